//
// port_init.rs - Integration tests for port bring-up
//
// Purpose:
//   Checks the port initialisation sequence against virtual devices: the topology rule,
//   how ring depths and offloads are negotiated, and that a failure at any step is
//   reported with that step.
//

pub mod suite;

use pollfwd::device::{DescLim, TX_OFFLOAD_IPV4_CKSUM, TX_OFFLOAD_MBUF_FAST_FREE};
use pollfwd::mempool::MBUF_HEADROOM;
use pollfwd::numa::SOCKET_ID_ANY;
use pollfwd::{
    InitError, InitStep, Mempool, PortInitParams, PortState, VdevConfig, check_port_count,
    port_init, port_init_with,
};
use std::io;

#[test]
fn test_odd_port_count_rejected_before_any_port_is_touched() {
    let (registry, _wires) = suite::attach(3, VdevConfig::with_id);
    let err = check_port_count(registry.count_avail()).unwrap_err();
    assert!(matches!(err, InitError::PortCount(3)));
    assert_eq!(
        err.to_string(),
        "number of ports must be even and at least 2, found 3"
    );
    assert!(
        registry
            .ports()
            .all(|p| p.state() == PortState::Unconfigured)
    );
}

#[test]
fn test_default_init() {
    suite::init_logger();
    let pool = suite::pool("INIT_POOL", 1024, 32);
    let (mut registry, _wires) = suite::attach(2, VdevConfig::with_id);
    for id in registry.ids() {
        port_init(&mut registry, id, &pool).unwrap();
    }
    let port = registry.port(1).unwrap();
    assert_eq!(port.state(), PortState::Started);
    let record = port.record();
    assert_eq!((record.nb_rx_queues, record.nb_tx_queues), (1, 1));
    assert_eq!((record.nb_rxd, record.nb_txd), (1024, 1024));
    assert!(record.promiscuous);
    assert_eq!(
        record.mac.map(|mac| mac.to_hex_string()),
        Some("02:00:00:00:00:01".to_string())
    );
    assert_eq!(pool.in_use_count(), 0);
}

#[test]
fn test_fast_free_only_when_advertised() {
    let pool = suite::pool("OFFLOAD_POOL", 1024, 32);
    let (mut registry, _wires) = suite::attach(2, |id| VdevConfig {
        tx_offload_capa: if id == 0 {
            TX_OFFLOAD_MBUF_FAST_FREE | TX_OFFLOAD_IPV4_CKSUM
        } else {
            TX_OFFLOAD_IPV4_CKSUM
        },
        ..VdevConfig::with_id(id)
    });
    port_init(&mut registry, 0, &pool).unwrap();
    port_init(&mut registry, 1, &pool).unwrap();
    assert_eq!(
        registry.port(0).unwrap().record().tx_offloads,
        TX_OFFLOAD_MBUF_FAST_FREE
    );
    assert_eq!(registry.port(1).unwrap().record().tx_offloads, 0);
}

#[test]
fn test_ring_depths_fitted_to_device_limits() {
    let pool = suite::pool("DESC_POOL", 2048, 32);
    let (mut registry, _wires) = suite::attach(2, |id| VdevConfig {
        rx_desc_lim: DescLim {
            nb_max: 512,
            nb_min: 64,
            nb_align: 32,
        },
        tx_desc_lim: DescLim {
            nb_max: 4096,
            nb_min: 64,
            nb_align: 100,
        },
        ..VdevConfig::with_id(id)
    });
    port_init(&mut registry, 0, &pool).unwrap();
    let record = registry.port(0).unwrap().record();
    assert_eq!((record.nb_rxd, record.nb_txd), (512, 1100));

    port_init_with(&mut registry, 1, &pool, PortInitParams {
        nb_rxd: 10,
        nb_txd: 10,
        ..Default::default()
    })
    .unwrap();
    let record = registry.port(1).unwrap().record();
    assert_eq!((record.nb_rxd, record.nb_txd), (64, 100));
}

#[test]
fn test_unknown_port_fails_validation() {
    let pool = suite::pool("VALIDATE_POOL", 256, 0);
    let (mut registry, _wires) = suite::attach(2, VdevConfig::with_id);
    let err = port_init(&mut registry, 7, &pool).unwrap_err();
    assert_eq!(err.step(), Some(InitStep::Validate));
    assert!(err.to_string().starts_with("cannot init port 7: port validation failed"));
}

#[test]
fn test_every_step_failure_is_named() {
    let pool = suite::pool("FAIL_POOL", 2048, 32);
    for step in [
        InitStep::Info,
        InitStep::Configure,
        InitStep::RxQueueSetup,
        InitStep::TxQueueSetup,
        InitStep::Start,
        InitStep::MacAddr,
        InitStep::Promiscuous,
    ] {
        let (mut registry, _wires) = suite::attach(2, |id| VdevConfig {
            fail_step: Some(step),
            ..VdevConfig::with_id(id)
        });
        let err = port_init(&mut registry, 0, &pool).unwrap_err();
        assert_eq!(err.step(), Some(step));
        assert!(
            err.to_string().contains(&step.to_string()),
            "{err} does not name {step}"
        );
    }
}

#[test]
fn test_descriptor_adjustment_overflow_fails() {
    let pool = suite::pool("ADJUST_POOL", 256, 0);
    let (mut registry, _wires) = suite::attach(2, |id| VdevConfig {
        tx_desc_lim: DescLim {
            nb_max: 0,
            nb_min: 0,
            nb_align: 1024,
        },
        ..VdevConfig::with_id(id)
    });
    let err = port_init_with(&mut registry, 0, &pool, PortInitParams {
        nb_txd: u16::MAX,
        ..Default::default()
    })
    .unwrap_err();
    assert_eq!(err.step(), Some(InitStep::AdjustDesc));
}

#[test]
fn test_pool_too_small_for_frames_fails_rx_setup() {
    let pool = Mempool::create(
        "TINY_POOL",
        256,
        0,
        MBUF_HEADROOM + 512,
        SOCKET_ID_ANY,
        suite::no_huge(),
    )
    .unwrap();
    let (mut registry, _wires) = suite::attach(2, VdevConfig::with_id);
    let err = port_init(&mut registry, 0, &pool).unwrap_err();
    assert_eq!(err.step(), Some(InitStep::RxQueueSetup));
    let InitError::Port { source, .. } = err else {
        panic!("expected a port error");
    };
    assert_eq!(source.kind(), io::ErrorKind::InvalidInput);
}

#[test]
fn test_reinit_of_started_port_fails_configure() {
    let pool = suite::pool("REINIT_POOL", 1024, 0);
    let (mut registry, _wires) = suite::attach(2, VdevConfig::with_id);
    port_init(&mut registry, 0, &pool).unwrap();
    let err = port_init(&mut registry, 0, &pool).unwrap_err();
    assert_eq!(err.step(), Some(InitStep::Configure));
}
