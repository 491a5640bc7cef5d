//! # Device Contract
//!
//! ## Purpose
//!
//! The port manager and the forwarding loop never talk to a NIC directly. They go through
//! the `Device` trait, which is the whole contract a poll-mode driver has to honour:
//! capability query, configuration, queue setup, start/stop, MAC, promiscuous mode, and
//! burst RX/TX on descriptor rings.
//!
//! ## How it works
//!
//! Drivers are attached to a `DeviceRegistry`, which assigns port ids in attach order and
//! wraps every driver in a `Port` that tracks the lifecycle. The registry is an explicit
//! value handed to whoever needs it; there is no process-global device table.
//!
//! Bursts move `Mbuf` handles in and out of fixed-capacity `Burst` arrays. RX appends up
//! to the requested count. TX takes buffers from the front of the burst, and whatever the
//! device did not accept stays behind, still owned by the caller.
//!
//! ## Main components
//!
//! - `Device`: the driver trait.
//! - `DevInfo`, `DescLim`, `PortConf`, `RxConf`, `TxConf`: capability and configuration records.
//! - `PortStats`: basic per-port counters.
//! - `DeviceRegistry`: port id to `Port` mapping.

use crate::mempool::Mempool;
use crate::port::Port;
use arrayvec::ArrayVec;
use eui48::MacAddress;
use std::io;
use std::sync::Arc;

/// Largest number of buffers moved by one RX or TX burst.
pub const MAX_PKT_BURST: usize = 32;

/// A burst of packet buffers.
pub type Burst = ArrayVec<crate::mempool::Mbuf, MAX_PKT_BURST>;

/// Longest standard Ethernet frame, CRC included.
pub const ETHER_MAX_LEN: u32 = 1518;

pub const TX_OFFLOAD_VLAN_INSERT: u64 = 1 << 0;
pub const TX_OFFLOAD_IPV4_CKSUM: u64 = 1 << 1;
pub const TX_OFFLOAD_UDP_CKSUM: u64 = 1 << 2;
/// Buffers handed to TX all come from one pool and are not shared, so the driver may
/// return them to the pool without per-buffer checks.
pub const TX_OFFLOAD_MBUF_FAST_FREE: u64 = 1 << 16;

/// Descriptor count limits of a queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DescLim {
    /// Upper bound, 0 when the device has none.
    pub nb_max: u16,
    pub nb_min: u16,
    /// Descriptor counts must be a multiple of this.
    pub nb_align: u16,
}

impl Default for DescLim {
    fn default() -> Self {
        DescLim {
            nb_max: 4096,
            nb_min: 64,
            nb_align: 32,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct RxConf {
    pub rx_free_thresh: u16,
    pub offloads: u64,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TxConf {
    pub tx_free_thresh: u16,
    pub tx_rs_thresh: u16,
    pub offloads: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RxMode {
    pub max_rx_pkt_len: u32,
    pub offloads: u64,
}

impl Default for RxMode {
    fn default() -> Self {
        RxMode {
            max_rx_pkt_len: ETHER_MAX_LEN,
            offloads: 0,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TxMode {
    pub offloads: u64,
}

/// Port-wide configuration passed to `Device::configure`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PortConf {
    pub rxmode: RxMode,
    pub txmode: TxMode,
}

/// What a device can do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevInfo {
    pub driver_name: String,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    pub max_rx_pktlen: u32,
    pub rx_desc_lim: DescLim,
    pub tx_desc_lim: DescLim,
    pub tx_offload_capa: u64,
    pub default_txconf: TxConf,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PortStats {
    pub ipackets: u64,
    pub ibytes: u64,
    /// Frames the device dropped on receive because no descriptor or buffer was free.
    pub imissed: u64,
    pub opackets: u64,
    pub obytes: u64,
}

/// A poll-mode driver.
///
/// Lifecycle order is `configure`, queue setup, `start`; `Port` enforces it before
/// calling in here. Burst calls never block.
pub trait Device: Send {
    fn name(&self) -> &str;

    fn info(&self) -> io::Result<DevInfo>;

    /// NUMA socket the device is attached to, `SOCKET_ID_ANY` if unknown.
    fn socket_id(&self) -> i32;

    fn configure(&mut self, nb_rx_queues: u16, nb_tx_queues: u16, conf: &PortConf)
    -> io::Result<()>;

    /// Sets up RX queue `queue` with `nb_desc` descriptors, filled from `pool`.
    fn rx_queue_setup(
        &mut self,
        queue: u16,
        nb_desc: u16,
        socket_id: i32,
        conf: Option<&RxConf>,
        pool: &Arc<Mempool>,
    ) -> io::Result<()>;

    fn tx_queue_setup(
        &mut self,
        queue: u16,
        nb_desc: u16,
        socket_id: i32,
        conf: &TxConf,
    ) -> io::Result<()>;

    fn start(&mut self) -> io::Result<()>;

    fn stop(&mut self) -> io::Result<()>;

    fn mac_addr(&self) -> io::Result<MacAddress>;

    fn promiscuous_enable(&mut self) -> io::Result<()>;

    /// Appends up to `max` received buffers to `out` and returns how many were added.
    fn rx_burst(&mut self, queue: u16, out: &mut Burst, max: usize) -> usize;

    /// Queues buffers from the front of `pkts` for transmission and returns how many were
    /// taken. The rest stay in `pkts`.
    fn tx_burst(&mut self, queue: u16, pkts: &mut Burst) -> usize;

    fn stats(&self) -> PortStats;
}

/// Attached devices, indexed by port id.
#[derive(Default)]
pub struct DeviceRegistry {
    ports: Vec<Port>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a driver and returns the port id it was given.
    pub fn attach(&mut self, device: Box<dyn Device>) -> io::Result<u16> {
        let id = u16::try_from(self.ports.len())
            .ok()
            .filter(|id| *id < u16::MAX)
            .ok_or_else(|| io::Error::other("port table is full"))?;
        log::debug!("attached device {} as port {id}", device.name());
        self.ports.push(Port::new(id, device));
        Ok(id)
    }

    /// Number of usable ports.
    pub fn count_avail(&self) -> u16 {
        self.ports.len() as u16
    }

    pub fn is_valid_port(&self, id: u16) -> bool {
        (id as usize) < self.ports.len()
    }

    /// Port ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = u16> + use<> {
        0..self.count_avail()
    }

    pub fn port(&self, id: u16) -> Option<&Port> {
        self.ports.get(id as usize)
    }

    pub fn port_mut(&mut self, id: u16) -> Option<&mut Port> {
        self.ports.get_mut(id as usize)
    }

    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter()
    }

    pub fn ports_mut(&mut self) -> impl Iterator<Item = &mut Port> {
        self.ports.iter_mut()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.ports.iter().map(|p| (p.id(), p.name())))
            .finish()
    }
}

//
// ================================================================================================
//   UNITTESTS
// ================================================================================================
//
#[cfg(test)]
mod tests {
    use super::DeviceRegistry;
    use crate::vdev::{self, VdevConfig};

    #[test]
    fn test_ports_numbered_in_attach_order() {
        let mut registry = DeviceRegistry::new();
        assert_eq!(registry.count_avail(), 0);
        for expect in 0..3u16 {
            let (dev, _wire) = vdev::create(VdevConfig::with_id(expect as u8));
            assert_eq!(registry.attach(Box::new(dev)).unwrap(), expect);
        }
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(registry.is_valid_port(2));
        assert!(!registry.is_valid_port(3));
        assert!(registry.port(3).is_none());
        assert_eq!(registry.port(1).unwrap().id(), 1);
    }
}
