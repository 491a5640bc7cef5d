//
// basicfwd.rs - Forward packets between paired ports
//
// Purpose:
//   Brings up every port, then forwards whatever arrives on port p out of port p ^ 1 on
//   the main lane until Ctrl-C. UDP datagrams are logged and consumed instead of forwarded.
//
// How it works:
//   - The bootstrap attaches `--vdev` virtual ports and sets up the lanes.
//   - One mbuf pool sized for all ports is created on the main lane's socket.
//   - Background tasks play the medium: `--inject N` feeds frames into port 0, every TX
//     ring is drained, and `--stats` logs port counters.
//   - The forwarder runs on the main thread through `block_in_place`.
//

use anyhow::Context as _;
use clap::Parser;
use pollfwd::mempool::{DEFAULT_DATA_ROOM, MBUF_CACHE_SIZE, NUM_MBUFS};
use pollfwd::port::{RX_RING_SIZE, TX_RING_SIZE};
use pollfwd::{
    BURST_SIZE, Forwarder, InitError, Mempool, PoolConfig, PortInitParams, check_port_count,
    port_init_with,
};
use pollfwd_cli::{EalArgs, Runtime, medium};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
struct Args {
    #[clap(flatten)]
    eal: EalArgs,

    /// packets per RX/TX burst, 1 to 32
    #[clap(long, default_value_t = BURST_SIZE)]
    burst: usize,

    /// mbufs per port in the pool
    #[clap(long, default_value_t = NUM_MBUFS)]
    nb_mbufs: usize,

    /// per-lane mbuf cache size
    #[clap(long, default_value_t = MBUF_CACHE_SIZE)]
    mbuf_cache: usize,

    /// RX ring depth
    #[clap(long, default_value_t = RX_RING_SIZE)]
    rxd: u16,

    /// TX ring depth
    #[clap(long, default_value_t = TX_RING_SIZE)]
    txd: u16,

    /// log port counters periodically, like 1s or 500ms
    #[clap(long)]
    stats: Option<String>,

    /// feed this many generated frames into port 0
    #[clap(long)]
    inject: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let stats_every: Option<Duration> = args
        .stats
        .as_deref()
        .map(humantime::parse_duration)
        .transpose()
        .context("invalid --stats interval")?;

    let mut rt = Runtime::init(&args.eal).context("bootstrap failed")?;

    let nb_ports = rt.registry.count_avail();
    check_port_count(nb_ports)?;

    let socket_id = rt.lcores.main_info().socket_id;
    let pool = Mempool::create(
        "MBUF_POOL",
        args.nb_mbufs * nb_ports as usize,
        args.mbuf_cache,
        DEFAULT_DATA_ROOM,
        socket_id,
        Some(PoolConfig {
            huge_page: args.eal.huge_page(),
        }),
    )
    .map_err(InitError::Pool)?;

    let params = PortInitParams {
        nb_rxd: args.rxd,
        nb_txd: args.txd,
        ..Default::default()
    };
    for port_id in rt.registry.ids() {
        port_init_with(&mut rt.registry, port_id, &pool, params)?;
    }

    if rt.lcores.count() > 1 {
        log::warn!("Too many lcores enabled. Only 1 used.");
    }

    // registered before any traffic flows, so an early SIGINT is not lost
    let mut sigint = signal(SignalKind::interrupt()).context("cannot listen for SIGINT")?;
    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            if sigint.recv().await.is_some() {
                log::info!("Signal received, preparing to exit...");
            }
            token.cancel();
        }
    });

    let drainer = tokio::spawn(medium::drain(rt.wires.clone(), pool.clone(), token.clone()));
    let injector = args.inject.zip(rt.wires.first().cloned()).map(|(count, wire)| {
        tokio::spawn(medium::inject(wire, count, token.clone()))
    });
    let reporter = stats_every.map(|every| {
        tokio::spawn(medium::report(rt.wires.clone(), every, token.clone()))
    });

    let stats = tokio::task::block_in_place(|| -> anyhow::Result<_> {
        let mut fwd = Forwarder::new(&mut rt.registry, pool.clone(), args.burst)
            .context("cannot set up forwarding")?;
        fwd.warn_remote_ports(socket_id);
        let mut stats = Default::default();
        rt.lcores.launch_on_current(|_| {
            stats = fwd.run(&token);
            0
        });
        Ok(stats)
    })?;
    token.cancel();

    if let Some(injector) = injector {
        injector.await?.context("traffic injection failed")?;
    }
    if let Some(reporter) = reporter {
        reporter.await?;
    }
    let drained = drainer.await?.context("draining TX rings failed")?;

    log::info!(
        "forwarded {} of {} packets in {} iterations, {} consumed, {} dropped, {drained} drained",
        stats.tx,
        stats.rx,
        stats.iterations,
        stats.consumed,
        stats.dropped
    );
    for port in rt.registry.ports() {
        let s = port.stats();
        println!(
            "port {}: rx {} pkts {} bytes, missed {}, tx {} pkts {} bytes",
            port.id(),
            s.ipackets,
            s.ibytes,
            s.imissed,
            s.opackets,
            s.obytes
        );
    }

    rt.cleanup()?;
    log::debug!("{} mbufs still in use at exit", pool.in_use_count());
    Ok(())
}
