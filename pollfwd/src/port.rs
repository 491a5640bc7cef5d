//! # Port Manager
//!
//! ## Purpose
//!
//! Brings a port from attached to forwarding-ready and keeps it honest afterwards. A port
//! moves through `Unconfigured -> Configured -> Started`; queue setup is only possible
//! while configured, and bursts on a port that is not started move nothing.
//!
//! ## How it works
//!
//! `Port` wraps the driver behind `Device` and checks the lifecycle before every call.
//! What was negotiated (queue counts, ring depths, TX offloads, MAC) is kept in a
//! `PortRecord`.
//!
//! `port_init_with()` runs the fixed bring-up sequence:
//!
//! 1.  Validate the port id.
//! 2.  Query the device capabilities.
//! 3.  Build the port configuration, turning on fast buffer release only when the device
//!     advertises it.
//! 4.  Configure the RX and TX queue counts.
//! 5.  Fit the requested ring depths to the device's descriptor limits.
//! 6.  Set up every RX queue on the port's socket, bound to the shared pool.
//! 7.  Set up every TX queue from the device's default TX config with the negotiated
//!     offloads.
//! 8.  Start the device.
//! 9.  Read the MAC address.
//! 10. Enable promiscuous mode.
//!
//! Any failure stops the sequence and reports the step; nothing is retried.
//!
//! ## Main components
//!
//! - `Port`, `PortState`, `PortRecord`
//! - `port_init()`, `port_init_with()`, `PortInitParams`
//! - `check_port_count()`, `adjust_desc()`

use crate::device::{
    Burst, DescLim, DevInfo, Device, DeviceRegistry, PortConf, PortStats, RxConf,
    TX_OFFLOAD_MBUF_FAST_FREE, TxConf,
};
use crate::error::{InitError, InitStep};
use crate::mempool::Mempool;
use eui48::MacAddress;
use std::io;
use std::sync::Arc;

/// RX ring depth requested for every port.
pub const RX_RING_SIZE: u16 = 1024;
/// TX ring depth requested for every port.
pub const TX_RING_SIZE: u16 = 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortState {
    Unconfigured,
    Configured,
    Started,
}

/// What a port was configured with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRecord {
    pub socket_id: i32,
    pub nb_rx_queues: u16,
    pub nb_tx_queues: u16,
    pub nb_rxd: u16,
    pub nb_txd: u16,
    pub tx_offloads: u64,
    pub mac: Option<MacAddress>,
    pub promiscuous: bool,
}

/// An attached device and its lifecycle.
pub struct Port {
    id: u16,
    device: Box<dyn Device>,
    state: PortState,
    record: PortRecord,
}

impl Port {
    pub(crate) fn new(id: u16, device: Box<dyn Device>) -> Self {
        let socket_id = device.socket_id();
        Port {
            id,
            device,
            state: PortState::Unconfigured,
            record: PortRecord {
                socket_id,
                ..Default::default()
            },
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn record(&self) -> &PortRecord {
        &self.record
    }

    pub fn socket_id(&self) -> i32 {
        self.record.socket_id
    }

    pub fn info(&self) -> io::Result<DevInfo> {
        self.device.info()
    }

    fn busy(&self, what: &str) -> io::Error {
        io::Error::new(
            io::ErrorKind::ResourceBusy,
            format!("port {}: cannot {what} while {:?}", self.id, self.state),
        )
    }

    fn require(&self, state: PortState, what: &str) -> io::Result<()> {
        if self.state != state {
            return Err(self.busy(what));
        }
        Ok(())
    }

    pub fn configure(&mut self, nb_rx_queues: u16, nb_tx_queues: u16, conf: &PortConf) -> io::Result<()> {
        if self.state == PortState::Started {
            return Err(self.busy("configure"));
        }
        self.device.configure(nb_rx_queues, nb_tx_queues, conf)?;
        self.state = PortState::Configured;
        self.record.nb_rx_queues = nb_rx_queues;
        self.record.nb_tx_queues = nb_tx_queues;
        self.record.tx_offloads = conf.txmode.offloads;
        Ok(())
    }

    /// Fits the requested ring depths to the device's descriptor limits.
    pub fn adjust_nb_desc(&self, nb_rxd: u16, nb_txd: u16) -> io::Result<(u16, u16)> {
        let info = self.device.info()?;
        Ok((
            adjust_desc(nb_rxd, &info.rx_desc_lim)?,
            adjust_desc(nb_txd, &info.tx_desc_lim)?,
        ))
    }

    pub fn rx_queue_setup(
        &mut self,
        queue: u16,
        nb_desc: u16,
        socket_id: i32,
        conf: Option<&RxConf>,
        pool: &Arc<Mempool>,
    ) -> io::Result<()> {
        self.require(PortState::Configured, "set up an rx queue")?;
        self.device
            .rx_queue_setup(queue, nb_desc, socket_id, conf, pool)?;
        self.record.nb_rxd = nb_desc;
        Ok(())
    }

    pub fn tx_queue_setup(&mut self, queue: u16, nb_desc: u16, socket_id: i32, conf: &TxConf) -> io::Result<()> {
        self.require(PortState::Configured, "set up a tx queue")?;
        self.device.tx_queue_setup(queue, nb_desc, socket_id, conf)?;
        self.record.nb_txd = nb_desc;
        Ok(())
    }

    pub fn start(&mut self) -> io::Result<()> {
        self.require(PortState::Configured, "start")?;
        self.device.start()?;
        self.state = PortState::Started;
        Ok(())
    }

    /// Stops a started port. Stopping a port that is not started does nothing.
    pub fn stop(&mut self) -> io::Result<()> {
        if self.state != PortState::Started {
            return Ok(());
        }
        self.device.stop()?;
        self.state = PortState::Configured;
        Ok(())
    }

    pub fn mac_addr(&mut self) -> io::Result<MacAddress> {
        let mac = self.device.mac_addr()?;
        self.record.mac = Some(mac);
        Ok(mac)
    }

    pub fn promiscuous_enable(&mut self) -> io::Result<()> {
        self.device.promiscuous_enable()?;
        self.record.promiscuous = true;
        Ok(())
    }

    /// Receives up to `max` buffers from `queue` into `out`, tagging each with this port.
    #[inline]
    pub fn rx_burst(&mut self, queue: u16, out: &mut Burst, max: usize) -> usize {
        if self.state != PortState::Started {
            return 0;
        }
        let before = out.len();
        let n = self
            .device
            .rx_burst(queue, out, max.min(out.remaining_capacity()));
        for mbuf in &mut out[before..] {
            mbuf.set_port(self.id);
        }
        n
    }

    /// Queues buffers from the front of `pkts` on `queue`; the rest stay in `pkts`.
    #[inline]
    pub fn tx_burst(&mut self, queue: u16, pkts: &mut Burst) -> usize {
        if self.state != PortState::Started || pkts.is_empty() {
            return 0;
        }
        self.device.tx_burst(queue, pkts)
    }

    pub fn stats(&self) -> PortStats {
        self.device.stats()
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("name", &self.device.name())
            .field("state", &self.state)
            .field("record", &self.record)
            .finish()
    }
}

/// Clamps `nb` into the descriptor limits and rounds it up to the alignment.
pub fn adjust_desc(nb: u16, lim: &DescLim) -> io::Result<u16> {
    let mut nb = nb as u32;
    if lim.nb_max != 0 {
        nb = nb.min(lim.nb_max as u32);
    }
    nb = nb.max(lim.nb_min as u32);
    nb = nb.next_multiple_of(lim.nb_align.max(1) as u32);
    u16::try_from(nb).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("descriptor count {nb} does not fit limits {lim:?}"),
        )
    })
}

/// Ports are paired `p <-> p ^ 1`, so there must be an even number of them, at least 2.
pub fn check_port_count(nb_ports: u16) -> Result<(), InitError> {
    if nb_ports < 2 || nb_ports % 2 != 0 {
        return Err(InitError::PortCount(nb_ports));
    }
    Ok(())
}

/// Queue counts, ring depths and base configuration used by `port_init_with`.
#[derive(Debug, Copy, Clone)]
pub struct PortInitParams {
    pub nb_rx_queues: u16,
    pub nb_tx_queues: u16,
    pub nb_rxd: u16,
    pub nb_txd: u16,
    pub conf: PortConf,
}

impl Default for PortInitParams {
    fn default() -> Self {
        PortInitParams {
            nb_rx_queues: 1,
            nb_tx_queues: 1,
            nb_rxd: RX_RING_SIZE,
            nb_txd: TX_RING_SIZE,
            conf: PortConf::default(),
        }
    }
}

/// Initialises `port_id` with one RX and one TX queue of the default depths.
pub fn port_init(registry: &mut DeviceRegistry, port_id: u16, pool: &Arc<Mempool>) -> Result<(), InitError> {
    port_init_with(registry, port_id, pool, PortInitParams::default())
}

/// Initialises `port_id` with explicit queue counts and ring depths.
pub fn port_init_with(
    registry: &mut DeviceRegistry,
    port_id: u16,
    pool: &Arc<Mempool>,
    params: PortInitParams,
) -> Result<(), InitError> {
    let fail = |step: InitStep| {
        move |source: io::Error| InitError::Port {
            port: port_id,
            step,
            source,
        }
    };

    let port = registry.port_mut(port_id).ok_or_else(|| {
        fail(InitStep::Validate)(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no port with id {port_id}"),
        ))
    })?;

    let info = port.info().map_err(fail(InitStep::Info))?;

    let mut conf = params.conf;
    if info.tx_offload_capa & TX_OFFLOAD_MBUF_FAST_FREE != 0 {
        conf.txmode.offloads |= TX_OFFLOAD_MBUF_FAST_FREE;
    }

    port.configure(params.nb_rx_queues, params.nb_tx_queues, &conf)
        .map_err(fail(InitStep::Configure))?;

    let (nb_rxd, nb_txd) = port
        .adjust_nb_desc(params.nb_rxd, params.nb_txd)
        .map_err(fail(InitStep::AdjustDesc))?;

    let socket_id = port.socket_id();
    for queue in 0..params.nb_rx_queues {
        port.rx_queue_setup(queue, nb_rxd, socket_id, None, pool)
            .map_err(fail(InitStep::RxQueueSetup))?;
    }

    let txconf = TxConf {
        offloads: conf.txmode.offloads,
        ..info.default_txconf
    };
    for queue in 0..params.nb_tx_queues {
        port.tx_queue_setup(queue, nb_txd, socket_id, &txconf)
            .map_err(fail(InitStep::TxQueueSetup))?;
    }

    port.start().map_err(fail(InitStep::Start))?;

    let mac = port.mac_addr().map_err(fail(InitStep::MacAddr))?;

    port.promiscuous_enable()
        .map_err(fail(InitStep::Promiscuous))?;

    log::info!("Port {port_id} MAC: {}", mac.to_hex_string());
    log::debug!(
        "port {port_id}: {} rx x {nb_rxd}, {} tx x {nb_txd}, tx offloads {:#x}",
        params.nb_rx_queues,
        params.nb_tx_queues,
        conf.txmode.offloads
    );
    Ok(())
}

//
// ================================================================================================
//   UNITTESTS
// ================================================================================================
//
#[cfg(test)]
mod tests {
    use super::{PortState, adjust_desc, check_port_count};
    use crate::device::{Burst, DescLim, DeviceRegistry, PortConf};
    use crate::error::InitError;
    use crate::vdev::{self, VdevConfig};
    use std::io;

    #[test]
    fn test_port_count_rule() {
        for n in 0..=16u16 {
            let res = check_port_count(n);
            if n >= 2 && n % 2 == 0 {
                assert!(res.is_ok(), "{n} ports must be accepted");
            } else {
                assert!(matches!(res, Err(InitError::PortCount(c)) if c == n));
            }
        }
    }

    #[test]
    fn test_adjust_desc() {
        let lim = DescLim {
            nb_max: 4096,
            nb_min: 64,
            nb_align: 32,
        };
        assert_eq!(adjust_desc(1024, &lim).unwrap(), 1024);
        assert_eq!(adjust_desc(8192, &lim).unwrap(), 4096);
        assert_eq!(adjust_desc(10, &lim).unwrap(), 64);
        assert_eq!(adjust_desc(1000, &lim).unwrap(), 1024);

        let unbounded = DescLim {
            nb_max: 0,
            nb_min: 0,
            nb_align: 0,
        };
        assert_eq!(adjust_desc(777, &unbounded).unwrap(), 777);

        let coarse = DescLim {
            nb_max: 0,
            nb_min: 0,
            nb_align: 1024,
        };
        assert_eq!(
            adjust_desc(65535, &coarse).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_lifecycle_is_enforced() {
        let mut registry = DeviceRegistry::new();
        let (dev, _wire) = vdev::create(VdevConfig::default());
        let id = registry.attach(Box::new(dev)).unwrap();
        let port = registry.port_mut(id).unwrap();

        assert_eq!(port.state(), PortState::Unconfigured);
        assert_eq!(
            port.start().unwrap_err().kind(),
            io::ErrorKind::ResourceBusy
        );
        let mut burst = Burst::new();
        assert_eq!(port.rx_burst(0, &mut burst, 32), 0);

        port.configure(1, 1, &PortConf::default()).unwrap();
        assert_eq!(port.state(), PortState::Configured);
        assert!(port.stop().is_ok());
        assert_eq!(port.state(), PortState::Configured);
    }
}
