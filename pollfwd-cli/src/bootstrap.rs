//! # Process Bootstrap
//!
//! Sets up what the forwarding engine expects to exist before `main` logic runs: the
//! execution lanes and the attached ports. Ports are virtual devices, one `Wire` per port
//! is kept so the binaries can play the medium.

use crate::args::EalArgs;
use anyhow::Context as _;
use pollfwd::numa;
use pollfwd::vdev::{self, VdevConfig};
use pollfwd::{DeviceRegistry, Lcores, Wire};

pub struct Runtime {
    pub lcores: Lcores,
    pub registry: DeviceRegistry,
    pub wires: Vec<Wire>,
}

impl Runtime {
    /// Parses the lane list, starts the lanes and attaches `--vdev` virtual ports.
    pub fn init(args: &EalArgs) -> anyhow::Result<Self> {
        let cpus = numa::parse_cpu_list(&args.lcores).context("invalid lane list")?;
        let lcores = Lcores::new(&cpus).context("cannot set up execution lanes")?;

        let mut registry = DeviceRegistry::new();
        let mut wires = Vec::with_capacity(args.vdev as usize);
        for id in 0..args.vdev {
            let (dev, wire) = vdev::create(VdevConfig::with_id(id));
            registry
                .attach(Box::new(dev))
                .with_context(|| format!("cannot attach virtual port {id}"))?;
            wires.push(wire);
        }
        log::debug!(
            "bootstrap done: {} lanes, {} ports",
            lcores.count(),
            registry.count_avail()
        );
        Ok(Runtime {
            lcores,
            registry,
            wires,
        })
    }

    /// Stops every port and joins the worker lanes.
    pub fn cleanup(mut self) -> anyhow::Result<()> {
        for port in self.registry.ports_mut() {
            port.stop()
                .with_context(|| format!("cannot stop port {}", port.id()))?;
        }
        let unfinished = self.lcores.wait_all();
        if !unfinished.is_empty() {
            log::debug!("collected late lane results: {unfinished:?}");
        }
        drop(self.lcores);
        Ok(())
    }
}

//
// ================================================================================================
//   UNITTESTS
// ================================================================================================
//
#[cfg(test)]
mod tests {
    use super::Runtime;
    use crate::args::EalArgs;
    use clap::Parser as _;

    #[test]
    fn test_init_attaches_ports() {
        let args = EalArgs::try_parse_from(["prog", "-l", "0", "--vdev", "4"]).unwrap();
        let rt = Runtime::init(&args).unwrap();
        assert_eq!(rt.registry.count_avail(), 4);
        assert_eq!(rt.wires.len(), 4);
        assert_eq!(rt.lcores.count(), 1);
        rt.cleanup().unwrap();
    }

    #[test]
    fn test_bad_lane_list() {
        let args = EalArgs::try_parse_from(["prog", "-l", "3-1"]).unwrap();
        let err = Runtime::init(&args).err().unwrap();
        assert!(err.to_string().contains("invalid lane list"));
    }
}
