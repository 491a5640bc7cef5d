//! # Virtual Medium
//!
//! ## Purpose
//!
//! With virtual ports nothing arrives and nothing leaves unless somebody plays the wire.
//! These tasks do that for the binaries: feed generated frames into a port, keep every
//! TX ring drained so the forwarder never backs up, and log port counters.
//!
//! ## How it works
//!
//! Each task is an async loop on the tokio runtime that stops when the shared
//! `CancellationToken` is cancelled. The forwarder itself runs on the main lane outside of
//! these tasks.

use etherparse::PacketBuilder;
use pollfwd::{Mempool, Wire};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// UDP port the generated datagrams are sent to.
pub const PING_PORT: u16 = 9999;

const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x10, 0x01];
const DST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x10, 0x02];

/// Frame number `seq` of the generated traffic: every fourth one is a UDP datagram carrying
/// `ping`, the others are ARP requests.
pub fn generate(seq: u64) -> io::Result<Vec<u8>> {
    if seq % 4 == 0 {
        let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(40000 + (seq % 1000) as u16, PING_PORT);
        let mut frame = Vec::with_capacity(builder.size(4));
        builder
            .write(&mut frame, b"ping")
            .map_err(|e| io::Error::other(format!("Error writing UDP frame: {e}")))?;
        return Ok(frame);
    }
    let mut frame = Vec::with_capacity(42);
    frame.extend_from_slice(&[0xff; 6]);
    frame.extend_from_slice(&SRC_MAC);
    frame.extend_from_slice(&[0x08, 0x06]);
    frame.extend_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01]);
    frame.extend_from_slice(&SRC_MAC);
    frame.extend_from_slice(&[10, 0, 0, 1]);
    frame.extend_from_slice(&[0; 6]);
    frame.extend_from_slice(&[10, 0, 0, (seq % 254) as u8 + 1]);
    Ok(frame)
}

/// Puts `count` generated frames on RX queue 0 of `wire`, yielding between bursts.
/// Returns how many were accepted by the device.
pub async fn inject(wire: Wire, count: u64, token: CancellationToken) -> io::Result<u64> {
    let mut accepted = 0;
    for seq in 0..count {
        if token.is_cancelled() {
            break;
        }
        if wire.inject(0, &generate(seq)?)? {
            accepted += 1;
        }
        if seq % 32 == 31 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    log::info!("injected {accepted} of {count} frames into {}", wire.name());
    Ok(accepted)
}

/// Keeps TX queue 0 of every wire drained until cancelled. Returns the frames drained.
pub async fn drain(wires: Vec<Wire>, pool: Arc<Mempool>, token: CancellationToken) -> io::Result<u64> {
    let mut drained = 0u64;
    let mut tick = tokio::time::interval(Duration::from_millis(1));
    loop {
        for wire in &wires {
            drained += wire.discard(0, &pool)? as u64;
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tick.tick() => {}
        }
    }
    for wire in &wires {
        drained += wire.discard(0, &pool)? as u64;
    }
    Ok(drained)
}

/// Logs the counters of every wire each `every` until cancelled.
pub async fn report(wires: Vec<Wire>, every: Duration, token: CancellationToken) {
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tick.tick() => {
                for (port, wire) in wires.iter().enumerate() {
                    let s = wire.stats();
                    log::info!(
                        "port {port}: rx {} pkts {} bytes, missed {}, tx {} pkts {} bytes",
                        s.ipackets, s.ibytes, s.imissed, s.opackets, s.obytes
                    );
                }
            }
        }
    }
}
