// Public modules and re-exports
pub mod classify;
pub mod device;
pub mod error;
pub mod forward;
pub mod lcore;
pub mod mempool;
pub mod numa;
pub mod port;
pub mod vdev;

pub use device::{Burst, Device, DeviceRegistry, MAX_PKT_BURST, PortStats};
pub use error::{InitError, InitStep};
pub use forward::{BURST_SIZE, ForwardStats, Forwarder, LoopState};
pub use lcore::{LcoreId, Lcores};
pub use mempool::{Mbuf, Mempool, PoolCache, PoolConfig};
pub use port::{Port, PortInitParams, PortState, check_port_count, port_init, port_init_with};
pub use vdev::{VdevConfig, VirtualDevice, Wire};

// Internal modules
#[doc(hidden)]
pub mod mmap;
#[doc(hidden)]
pub mod ring;
