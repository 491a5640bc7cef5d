//
// helloworld.rs - Run a routine on every lane
//
// Purpose:
//   Launches a greeting on every worker lane, runs it on the main lane too, and waits for
//   all of them. The output order is not defined.
//

use anyhow::Context as _;
use clap::Parser;
use pollfwd::LcoreId;
use pollfwd_cli::{EalArgs, Runtime};

fn lcore_hello(lane: LcoreId) -> i32 {
    println!("hello from core {lane}");
    0
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = EalArgs::parse();
    let rt = Runtime::init(&args).context("bootstrap failed")?;

    let workers: Vec<LcoreId> = rt.lcores.workers().collect();
    for lane in workers {
        rt.lcores
            .remote_launch(lane, lcore_hello)
            .with_context(|| format!("cannot launch on lane {lane}"))?;
    }
    rt.lcores.launch_on_current(lcore_hello);

    for (lane, ret) in rt.lcores.wait_all() {
        if ret != 0 {
            log::warn!("lane {lane} returned {ret}");
        }
    }
    rt.cleanup()
}
