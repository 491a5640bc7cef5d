//! Startup errors.

use std::fmt;
use std::io;
use thiserror::Error;

/// The step of port initialisation that failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum InitStep {
    Validate,
    Info,
    Configure,
    AdjustDesc,
    RxQueueSetup,
    TxQueueSetup,
    Start,
    MacAddr,
    Promiscuous,
}

impl fmt::Display for InitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InitStep::Validate => "port validation",
            InitStep::Info => "device info query",
            InitStep::Configure => "device configure",
            InitStep::AdjustDesc => "descriptor adjustment",
            InitStep::RxQueueSetup => "rx queue setup",
            InitStep::TxQueueSetup => "tx queue setup",
            InitStep::Start => "device start",
            InitStep::MacAddr => "mac address query",
            InitStep::Promiscuous => "promiscuous enable",
        })
    }
}

/// Fatal errors of process startup.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("number of ports must be even and at least 2, found {0}")]
    PortCount(u16),

    #[error("cannot create mbuf pool: {0}")]
    Pool(#[source] io::Error),

    #[error("cannot init port {port}: {step} failed: {source}")]
    Port {
        port: u16,
        step: InitStep,
        #[source]
        source: io::Error,
    },
}

impl InitError {
    /// The failed step, for port errors.
    pub fn step(&self) -> Option<InitStep> {
        match self {
            InitError::Port { step, .. } => Some(*step),
            _ => None,
        }
    }
}
