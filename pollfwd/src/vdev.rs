//! # Virtual Ethernet Device
//!
//! ## Purpose
//!
//! A software NIC that implements `Device` with real descriptor rings, so ports can be
//! brought up, polled and forwarded between without hardware. It is what the binaries
//! run on and what the tests drive.
//!
//! ## How it works
//!
//! `create()` returns two halves. The `VirtualDevice` is the driver side and gets attached
//! to a `DeviceRegistry`. The `Wire` is the medium: it puts frames on the RX rings the
//! way a NIC's DMA would, and takes transmitted buffers off the TX rings.
//!
//! Each queue is an SPSC ring from `ring`. The device owns the RX consumer and the TX
//! producer; the wire owns the RX producer and the TX consumer. Queue setup creates the
//! ring and parks the wire's half in a shared slot that the wire picks up under a mutex,
//! which keeps the lock off the device's burst path.
//!
//! Frames injected while the device is stopped, or when the ring or the pool is full, are
//! released and counted as `imissed`.
//!
//! `VdevConfig::fail_step` makes one init step fail, for exercising error paths.
//!
//! ## Main components
//!
//! - `VdevConfig`, `create()`
//! - `VirtualDevice`: the `Device` implementation.
//! - `Wire`: `inject`, `drain`, `discard`, `collect`, `stats`.

use crate::device::{
    Burst, DescLim, DevInfo, Device, PortConf, PortStats, RxConf,
    TX_OFFLOAD_IPV4_CKSUM, TX_OFFLOAD_MBUF_FAST_FREE, TX_OFFLOAD_UDP_CKSUM, TxConf,
};
use crate::error::InitStep;
use crate::mempool::{MBUF_HEADROOM, Mbuf, Mempool};
use crate::numa::SOCKET_ID_ANY;
use crate::ring::{self, Consumer, Producer};
use eui48::MacAddress;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const MAX_VDEV_QUEUES: u16 = 16;

/// Virtual device options.
#[derive(Debug, Copy, Clone)]
pub struct VdevConfig {
    pub mac: [u8; 6],
    pub socket_id: i32,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    pub rx_desc_lim: DescLim,
    pub tx_desc_lim: DescLim,
    pub tx_offload_capa: u64,
    pub max_rx_pktlen: u32,
    /// Init step that returns an error.
    pub fail_step: Option<InitStep>,
}

impl Default for VdevConfig {
    fn default() -> Self {
        VdevConfig {
            mac: [0x02, 0, 0, 0, 0, 0],
            socket_id: SOCKET_ID_ANY,
            max_rx_queues: 4,
            max_tx_queues: 4,
            rx_desc_lim: DescLim::default(),
            tx_desc_lim: DescLim::default(),
            tx_offload_capa: TX_OFFLOAD_MBUF_FAST_FREE
                | TX_OFFLOAD_IPV4_CKSUM
                | TX_OFFLOAD_UDP_CKSUM,
            max_rx_pktlen: 9618,
            fail_step: None,
        }
    }
}

impl VdevConfig {
    /// Default device with the locally administered MAC `02:00:00:00:00:<id>`.
    pub fn with_id(id: u8) -> Self {
        VdevConfig {
            mac: [0x02, 0, 0, 0, 0, id],
            ..Default::default()
        }
    }
}

struct RxFeed {
    producer: Producer<Mbuf>,
    pool: Arc<Mempool>,
}

#[derive(Default)]
struct Counters {
    ipackets: AtomicU64,
    ibytes: AtomicU64,
    imissed: AtomicU64,
    opackets: AtomicU64,
    obytes: AtomicU64,
}

struct Link {
    name: String,
    started: AtomicBool,
    rx: Vec<Mutex<Option<RxFeed>>>,
    tx: Vec<Mutex<Option<Consumer<Mbuf>>>>,
    counters: Counters,
}

struct RxQueue {
    consumer: Consumer<Mbuf>,
    pool: Arc<Mempool>,
}

/// Driver half of a virtual device.
pub struct VirtualDevice {
    link: Arc<Link>,
    config: VdevConfig,
    conf: Option<PortConf>,
    nb_rx: u16,
    nb_tx: u16,
    rxq: Vec<Option<RxQueue>>,
    txq: Vec<Option<Producer<Mbuf>>>,
    promiscuous: bool,
}

/// Medium half of a virtual device.
#[derive(Clone)]
pub struct Wire {
    link: Arc<Link>,
}

/// Creates a virtual device and the wire attached to it.
pub fn create(config: VdevConfig) -> (VirtualDevice, Wire) {
    let max_rx = config.max_rx_queues.min(MAX_VDEV_QUEUES);
    let max_tx = config.max_tx_queues.min(MAX_VDEV_QUEUES);
    let link = Arc::new(Link {
        name: format!("net_vdev_{}", MacAddress::new(config.mac).to_hex_string()),
        started: AtomicBool::new(false),
        rx: (0..max_rx).map(|_| Mutex::new(None)).collect(),
        tx: (0..max_tx).map(|_| Mutex::new(None)).collect(),
        counters: Counters::default(),
    });
    let device = VirtualDevice {
        link: link.clone(),
        config: VdevConfig {
            max_rx_queues: max_rx,
            max_tx_queues: max_tx,
            ..config
        },
        conf: None,
        nb_rx: 0,
        nb_tx: 0,
        rxq: Vec::new(),
        txq: Vec::new(),
        promiscuous: false,
    };
    (device, Wire { link })
}

fn invalid(name: &str, what: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("{name}: {what}"))
}

impl VirtualDevice {
    fn fail_at(&self, step: InitStep) -> io::Result<()> {
        if self.config.fail_step == Some(step) {
            return Err(io::Error::other(format!(
                "{}: injected failure at {step}",
                self.link.name
            )));
        }
        Ok(())
    }

    fn check_desc(&self, nb_desc: u16, lim: &DescLim, dir: &str) -> io::Result<()> {
        let align = lim.nb_align.max(1);
        if nb_desc == 0
            || nb_desc < lim.nb_min
            || (lim.nb_max != 0 && nb_desc > lim.nb_max)
            || nb_desc % align != 0
        {
            return Err(invalid(
                &self.link.name,
                format!("invalid {dir} descriptor count {nb_desc} for limits {lim:?}"),
            ));
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.link.started.load(Ordering::Acquire)
    }

    fn release_rx_queues(&mut self) {
        for rxq in self.rxq.iter_mut().flatten() {
            while let Some(mbuf) = rxq.consumer.pop() {
                rxq.pool.put(mbuf);
            }
        }
    }
}

impl Device for VirtualDevice {
    fn name(&self) -> &str {
        &self.link.name
    }

    fn info(&self) -> io::Result<DevInfo> {
        self.fail_at(InitStep::Info)?;
        Ok(DevInfo {
            driver_name: "net_vdev".to_string(),
            max_rx_queues: self.config.max_rx_queues,
            max_tx_queues: self.config.max_tx_queues,
            max_rx_pktlen: self.config.max_rx_pktlen,
            rx_desc_lim: self.config.rx_desc_lim,
            tx_desc_lim: self.config.tx_desc_lim,
            tx_offload_capa: self.config.tx_offload_capa,
            default_txconf: TxConf {
                tx_free_thresh: 32,
                tx_rs_thresh: 32,
                offloads: 0,
            },
        })
    }

    fn socket_id(&self) -> i32 {
        self.config.socket_id
    }

    fn configure(&mut self, nb_rx_queues: u16, nb_tx_queues: u16, conf: &PortConf) -> io::Result<()> {
        self.fail_at(InitStep::Configure)?;
        if self.is_started() {
            return Err(io::Error::new(
                io::ErrorKind::ResourceBusy,
                format!("{}: cannot configure a started device", self.link.name),
            ));
        }
        if nb_rx_queues == 0 && nb_tx_queues == 0 {
            return Err(invalid(&self.link.name, "no queues requested".to_string()));
        }
        if nb_rx_queues > self.config.max_rx_queues || nb_tx_queues > self.config.max_tx_queues {
            return Err(invalid(
                &self.link.name,
                format!(
                    "{nb_rx_queues} rx / {nb_tx_queues} tx queues exceed {} / {}",
                    self.config.max_rx_queues, self.config.max_tx_queues
                ),
            ));
        }
        let unsupported = conf.txmode.offloads & !self.config.tx_offload_capa;
        if unsupported != 0 {
            return Err(invalid(
                &self.link.name,
                format!("tx offloads {unsupported:#x} not supported"),
            ));
        }
        if conf.rxmode.max_rx_pkt_len > self.config.max_rx_pktlen {
            return Err(invalid(
                &self.link.name,
                format!(
                    "max rx packet length {} exceeds {}",
                    conf.rxmode.max_rx_pkt_len, self.config.max_rx_pktlen
                ),
            ));
        }
        self.release_rx_queues();
        self.conf = Some(*conf);
        self.nb_rx = nb_rx_queues;
        self.nb_tx = nb_tx_queues;
        self.rxq = (0..nb_rx_queues).map(|_| None).collect();
        self.txq = (0..nb_tx_queues).map(|_| None).collect();
        Ok(())
    }

    fn rx_queue_setup(
        &mut self,
        queue: u16,
        nb_desc: u16,
        socket_id: i32,
        conf: Option<&RxConf>,
        pool: &Arc<Mempool>,
    ) -> io::Result<()> {
        self.fail_at(InitStep::RxQueueSetup)?;
        let Some(port_conf) = self.conf else {
            return Err(invalid(&self.link.name, "device is not configured".to_string()));
        };
        if queue >= self.nb_rx {
            return Err(invalid(&self.link.name, format!("rx queue {queue} out of range")));
        }
        self.check_desc(nb_desc, &self.config.rx_desc_lim, "rx")?;
        let room = pool.data_room().saturating_sub(MBUF_HEADROOM as usize);
        let needed = port_conf.rxmode.max_rx_pkt_len;
        if room < needed as usize {
            return Err(invalid(
                &self.link.name,
                format!(
                    "pool {} buffers hold {room} bytes, {needed} needed",
                    pool.name()
                ),
            ));
        }
        let (producer, consumer) = ring::ring(nb_desc as usize)?;
        if let Some(mut old) = self.rxq[queue as usize].take() {
            while let Some(mbuf) = old.consumer.pop() {
                old.pool.put(mbuf);
            }
        }
        self.rxq[queue as usize] = Some(RxQueue {
            consumer,
            pool: pool.clone(),
        });
        if let Ok(mut slot) = self.link.rx[queue as usize].lock() {
            *slot = Some(RxFeed {
                producer,
                pool: pool.clone(),
            });
        }
        log::debug!(
            "{}: rx queue {queue}: {nb_desc} descriptors, socket {socket_id}, pool {}, conf {conf:?}",
            self.link.name,
            pool.name()
        );
        Ok(())
    }

    fn tx_queue_setup(&mut self, queue: u16, nb_desc: u16, socket_id: i32, conf: &TxConf) -> io::Result<()> {
        self.fail_at(InitStep::TxQueueSetup)?;
        if self.conf.is_none() {
            return Err(invalid(&self.link.name, "device is not configured".to_string()));
        }
        if queue >= self.nb_tx {
            return Err(invalid(&self.link.name, format!("tx queue {queue} out of range")));
        }
        self.check_desc(nb_desc, &self.config.tx_desc_lim, "tx")?;
        let unsupported = conf.offloads & !self.config.tx_offload_capa;
        if unsupported != 0 {
            return Err(invalid(
                &self.link.name,
                format!("tx queue {queue} offloads {unsupported:#x} not supported"),
            ));
        }
        let (producer, consumer) = ring::ring(nb_desc as usize)?;
        self.txq[queue as usize] = Some(producer);
        if let Ok(mut slot) = self.link.tx[queue as usize].lock() {
            *slot = Some(consumer);
        }
        log::debug!(
            "{}: tx queue {queue}: {nb_desc} descriptors, socket {socket_id}, offloads {:#x}",
            self.link.name,
            conf.offloads
        );
        Ok(())
    }

    fn start(&mut self) -> io::Result<()> {
        self.fail_at(InitStep::Start)?;
        if self.rxq.iter().any(Option::is_none) || self.txq.iter().any(Option::is_none) {
            return Err(invalid(
                &self.link.name,
                "cannot start with queues not set up".to_string(),
            ));
        }
        self.link.started.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> io::Result<()> {
        self.link.started.store(false, Ordering::Release);
        self.release_rx_queues();
        Ok(())
    }

    fn mac_addr(&self) -> io::Result<MacAddress> {
        self.fail_at(InitStep::MacAddr)?;
        Ok(MacAddress::new(self.config.mac))
    }

    fn promiscuous_enable(&mut self) -> io::Result<()> {
        self.fail_at(InitStep::Promiscuous)?;
        self.promiscuous = true;
        Ok(())
    }

    fn rx_burst(&mut self, queue: u16, out: &mut Burst, max: usize) -> usize {
        let Some(Some(rxq)) = self.rxq.get_mut(queue as usize) else {
            return 0;
        };
        let before = out.len();
        let n = rxq.consumer.pop_burst(out, max);
        if n > 0 {
            let bytes: usize = out[before..].iter().map(Mbuf::len).sum();
            let counters = &self.link.counters;
            counters.ipackets.fetch_add(n as u64, Ordering::Relaxed);
            counters.ibytes.fetch_add(bytes as u64, Ordering::Relaxed);
        }
        n
    }

    fn tx_burst(&mut self, queue: u16, pkts: &mut Burst) -> usize {
        let Some(Some(producer)) = self.txq.get_mut(queue as usize) else {
            return 0;
        };
        let n = producer.free_count(pkts.len()).min(pkts.len());
        let bytes: usize = pkts[..n].iter().map(Mbuf::len).sum();
        let sent = producer.push_burst(pkts);
        debug_assert_eq!(sent, n);
        let counters = &self.link.counters;
        counters.opackets.fetch_add(sent as u64, Ordering::Relaxed);
        counters.obytes.fetch_add(bytes as u64, Ordering::Relaxed);
        sent
    }

    fn stats(&self) -> PortStats {
        self.link.stats()
    }
}

impl Link {
    fn stats(&self) -> PortStats {
        let c = &self.counters;
        PortStats {
            ipackets: c.ipackets.load(Ordering::Relaxed),
            ibytes: c.ibytes.load(Ordering::Relaxed),
            imissed: c.imissed.load(Ordering::Relaxed),
            opackets: c.opackets.load(Ordering::Relaxed),
            obytes: c.obytes.load(Ordering::Relaxed),
        }
    }

    fn missed(&self) {
        self.counters.imissed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Wire {
    pub fn name(&self) -> &str {
        &self.link.name
    }

    /// Puts a frame on RX queue `queue`.
    ///
    /// Returns `Ok(false)` when the frame was dropped because the device is stopped, the
    /// pool is empty or the ring is full.
    ///
    /// # Errors
    /// `NotConnected` if the queue was never set up, `InvalidInput` if the frame does not
    /// fit into a pool buffer.
    pub fn inject(&self, queue: u16, frame: &[u8]) -> io::Result<bool> {
        let mut slot = self.rx_slot(queue)?;
        let Some(feed) = slot.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{}: rx queue {queue} is not set up", self.link.name),
            ));
        };
        if !self.link.started.load(Ordering::Acquire) {
            self.link.missed();
            return Ok(false);
        }
        let Some(mut mbuf) = feed.pool.get() else {
            self.link.missed();
            return Ok(false);
        };
        if let Err(e) = feed.pool.write(&mut mbuf, frame) {
            feed.pool.put(mbuf);
            return Err(e);
        }
        if let Err(mbuf) = feed.producer.push(mbuf) {
            feed.pool.put(mbuf);
            self.link.missed();
            return Ok(false);
        }
        Ok(true)
    }

    /// Takes every transmitted buffer off TX queue `queue`, passes its bytes to `f` and
    /// releases it to `pool`. Returns the number of frames drained.
    pub fn drain<F>(&self, queue: u16, pool: &Mempool, mut f: F) -> io::Result<usize>
    where
        F: FnMut(&[u8]),
    {
        let mut slot = self.tx_slot(queue)?;
        let Some(consumer) = slot.as_mut() else {
            return Ok(0);
        };
        let mut n = 0;
        while let Some(mbuf) = consumer.pop() {
            f(pool.data(&mbuf));
            pool.put(mbuf);
            n += 1;
        }
        Ok(n)
    }

    /// Drains TX queue `queue` without looking at the frames.
    pub fn discard(&self, queue: u16, pool: &Mempool) -> io::Result<usize> {
        self.drain(queue, pool, |_| {})
    }

    /// Drains TX queue `queue` into owned byte vectors.
    pub fn collect(&self, queue: u16, pool: &Mempool) -> io::Result<Vec<Vec<u8>>> {
        let mut frames = Vec::new();
        self.drain(queue, pool, |bytes| frames.push(bytes.to_vec()))?;
        Ok(frames)
    }

    pub fn stats(&self) -> PortStats {
        self.link.stats()
    }

    fn rx_slot(&self, queue: u16) -> io::Result<std::sync::MutexGuard<'_, Option<RxFeed>>> {
        self.link
            .rx
            .get(queue as usize)
            .ok_or_else(|| invalid(&self.link.name, format!("rx queue {queue} out of range")))?
            .lock()
            .map_err(|_| io::Error::other(format!("{}: rx queue {queue} lock poisoned", self.link.name)))
    }

    fn tx_slot(&self, queue: u16) -> io::Result<std::sync::MutexGuard<'_, Option<Consumer<Mbuf>>>> {
        self.link
            .tx
            .get(queue as usize)
            .ok_or_else(|| invalid(&self.link.name, format!("tx queue {queue} out of range")))?
            .lock()
            .map_err(|_| io::Error::other(format!("{}: tx queue {queue} lock poisoned", self.link.name)))
    }
}

impl std::fmt::Debug for Wire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wire").field("name", &self.link.name).finish()
    }
}

impl std::fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDevice")
            .field("name", &self.link.name)
            .field("nb_rx", &self.nb_rx)
            .field("nb_tx", &self.nb_tx)
            .field("started", &self.is_started())
            .field("promiscuous", &self.promiscuous)
            .finish()
    }
}
