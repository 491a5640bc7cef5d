//
// suite/mod.rs - Shared fixtures for the pollfwd integration tests
//
// Purpose:
//   Builds a registry of virtual ports that are already initialised against one pool,
//   and the Ethernet frames the tests feed into them.
//
#![allow(dead_code)]

use etherparse::{EtherType, Ethernet2Header, PacketBuilder};
use pollfwd::mempool::DEFAULT_DATA_ROOM;
use pollfwd::numa::SOCKET_ID_ANY;
use pollfwd::{DeviceRegistry, Mempool, PoolConfig, PortInitParams, VdevConfig, Wire};
use std::sync::Arc;

pub const SRC_MAC: [u8; 6] = [0xaa, 0x79, 0xea, 0x34, 0x4b, 0xb8];
pub const DST_MAC: [u8; 6] = [0xfa, 0x95, 0x2c, 0xe3, 0x0e, 0xa5];

pub struct Testbed {
    pub registry: DeviceRegistry,
    pub pool: Arc<Mempool>,
    pub wires: Vec<Wire>,
}

pub fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

pub fn no_huge() -> Option<PoolConfig> {
    Some(PoolConfig {
        huge_page: Some(false),
    })
}

pub fn pool(name: &str, n: usize, cache: usize) -> Arc<Mempool> {
    Mempool::create(name, n, cache, DEFAULT_DATA_ROOM, SOCKET_ID_ANY, no_huge()).unwrap()
}

/// `nb_ports` virtual ports, attached but not initialised.
pub fn attach(nb_ports: u16, config: impl Fn(u8) -> VdevConfig) -> (DeviceRegistry, Vec<Wire>) {
    let mut registry = DeviceRegistry::new();
    let mut wires = Vec::new();
    for id in 0..nb_ports {
        let (dev, wire) = pollfwd::vdev::create(config(id as u8));
        registry.attach(Box::new(dev)).unwrap();
        wires.push(wire);
    }
    (registry, wires)
}

/// `nb_ports` virtual ports initialised with `params`, sharing one pool.
pub fn testbed_with(nb_ports: u16, pool_size: usize, cache: usize, config: impl Fn(u8) -> VdevConfig, params: PortInitParams) -> Testbed {
    init_logger();
    let pool = pool("TESTBED_POOL", pool_size, cache);
    let (mut registry, wires) = attach(nb_ports, config);
    for port_id in registry.ids() {
        pollfwd::port_init_with(&mut registry, port_id, &pool, params).unwrap();
    }
    Testbed {
        registry,
        pool,
        wires,
    }
}

pub fn testbed(nb_ports: u16) -> Testbed {
    testbed_with(nb_ports, 4096, 32, VdevConfig::with_id, PortInitParams {
        nb_rxd: 256,
        nb_txd: 256,
        ..Default::default()
    })
}

pub fn udp_frame(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
        .ipv4([192, 168, 0, 1], [192, 168, 0, 2], 64)
        .udp(src_port, dst_port);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).unwrap();
    frame
}

/// An ARP request whose target address ends in `seq`, so frames can be told apart.
pub fn arp_frame(seq: u8) -> Vec<u8> {
    let mut frame = Ethernet2Header {
        source: SRC_MAC,
        destination: [0xff; 6],
        ether_type: EtherType::ARP,
    }
    .to_bytes()
    .to_vec();
    frame.extend_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01]);
    frame.extend_from_slice(&SRC_MAC);
    frame.extend_from_slice(&[192, 168, 0, 1]);
    frame.extend_from_slice(&[0; 6]);
    frame.extend_from_slice(&[192, 168, 0, seq]);
    frame
}
