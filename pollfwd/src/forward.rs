//! # Forwarding Loop
//!
//! ## Purpose
//!
//! The steady-state routine of a lane: poll every port, hand each received frame to the
//! classifier, and send what is not consumed out of the paired port `p ^ 1`.
//!
//! ## How it works
//!
//! Every iteration visits the ports in ascending order. For each port it receives one
//! burst from queue 0, logs and releases UDP datagrams, and transmits the rest once on the
//! peer's queue 0. Whatever the peer did not accept is released right away. Nothing is
//! retried and nothing blocks; a short burst is only a counter.
//!
//! The loop is a small state machine. It stays `Running` until the cancellation token is
//! seen at the top of an iteration, then moves to `ShutdownRequested` and returns the
//! cumulative counters.
//!
//! Buffers are released through a `PoolCache`, so the shared free list is only touched
//! when the cache spills.

use crate::classify::{Verdict, classify};
use crate::device::{Burst, DeviceRegistry, MAX_PKT_BURST};
use crate::lcore;
use crate::mempool::{Mempool, PoolCache};
use std::io;
use std::ops::AddAssign;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default number of buffers per RX/TX burst.
pub const BURST_SIZE: usize = MAX_PKT_BURST;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoopState {
    Running,
    ShutdownRequested,
}

/// Forwarding counters.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub iterations: u64,
    /// Buffers received.
    pub rx: u64,
    /// Buffers accepted by a TX queue.
    pub tx: u64,
    /// UDP datagrams logged and released.
    pub consumed: u64,
    /// Buffers released because the peer's TX queue was full.
    pub dropped: u64,
}

impl AddAssign for ForwardStats {
    fn add_assign(&mut self, other: Self) {
        self.iterations += other.iterations;
        self.rx += other.rx;
        self.tx += other.tx;
        self.consumed += other.consumed;
        self.dropped += other.dropped;
    }
}

/// Forwards between the paired ports of a registry.
pub struct Forwarder<'a> {
    registry: &'a mut DeviceRegistry,
    pool: Arc<Mempool>,
    cache: PoolCache,
    burst: usize,
    nb_ports: u16,
    state: LoopState,
    stats: ForwardStats,
}

impl<'a> Forwarder<'a> {
    /// Creates a forwarder over every port of `registry`.
    ///
    /// # Errors
    /// `InvalidInput` when `burst` is outside `1..=MAX_PKT_BURST` or the port count is odd.
    pub fn new(registry: &'a mut DeviceRegistry, pool: Arc<Mempool>, burst: usize) -> io::Result<Self> {
        if burst == 0 || burst > MAX_PKT_BURST {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("burst size {burst} not in 1..={MAX_PKT_BURST}"),
            ));
        }
        let nb_ports = registry.count_avail();
        crate::port::check_port_count(nb_ports)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        Ok(Forwarder {
            registry,
            cache: PoolCache::new(&pool),
            pool,
            burst,
            nb_ports,
            state: LoopState::Running,
            stats: ForwardStats::default(),
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> ForwardStats {
        self.stats
    }

    /// Logs a warning for every port on a different NUMA socket than `lane_socket`.
    /// Returns the number of such ports.
    pub fn warn_remote_ports(&self, lane_socket: i32) -> usize {
        let mut remote = 0;
        for port in self.registry.ports() {
            let socket = port.socket_id();
            if socket >= 0 && lane_socket >= 0 && socket != lane_socket {
                log::warn!(
                    "port {} is on remote NUMA node {socket} to polling thread on node {lane_socket}, performance will not be optimal",
                    port.id()
                );
                remote += 1;
            }
        }
        remote
    }

    /// Runs one pass over all ports and returns what it did.
    pub fn poll_once(&mut self) -> ForwardStats {
        let mut pass = ForwardStats {
            iterations: 1,
            ..Default::default()
        };
        let pool = &self.pool;
        let cache = &mut self.cache;

        for port_id in 0..self.nb_ports {
            let Some(port) = self.registry.port_mut(port_id) else {
                continue;
            };
            let mut rx = Burst::new();
            let nb_rx = port.rx_burst(0, &mut rx, self.burst);
            if nb_rx == 0 {
                continue;
            }
            pass.rx += nb_rx as u64;

            let mut fwd = Burst::new();
            for mut mbuf in rx.drain(..) {
                let len = mbuf.len();
                match classify(pool.room_mut(&mut mbuf), len) {
                    Verdict::Consume(datagram) => {
                        log::info!(
                            "src: {}, dst: {}, {}",
                            datagram.src,
                            datagram.dst,
                            datagram.text(pool.data(&mbuf))
                        );
                        cache.put(mbuf);
                        pass.consumed += 1;
                    }
                    Verdict::Forward => fwd.push(mbuf),
                }
            }

            let Some(peer) = self.registry.port_mut(port_id ^ 1) else {
                pass.dropped += fwd.len() as u64;
                fwd.drain(..).for_each(|mbuf| cache.put(mbuf));
                continue;
            };
            pass.tx += peer.tx_burst(0, &mut fwd) as u64;
            pass.dropped += fwd.len() as u64;
            for mbuf in fwd.drain(..) {
                cache.put(mbuf);
            }
        }

        self.stats += pass;
        pass
    }

    /// Polls until `token` is cancelled and returns the cumulative counters.
    pub fn run(&mut self, token: &CancellationToken) -> ForwardStats {
        if let Some(lane) = lcore::current() {
            log::info!("Core {lane} forwarding packets. [Ctrl+C to quit]");
        }
        while self.state == LoopState::Running {
            if token.is_cancelled() {
                self.state = LoopState::ShutdownRequested;
                break;
            }
            self.poll_once();
        }
        log::debug!(
            "forwarding stopped after {} iterations: {:?}",
            self.stats.iterations,
            self.stats
        );
        self.stats
    }
}

impl std::fmt::Debug for Forwarder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("nb_ports", &self.nb_ports)
            .field("burst", &self.burst)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}
