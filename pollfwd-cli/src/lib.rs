// Bootstrap and tooling shared by the pollfwd binaries
pub mod args;
pub mod bootstrap;
pub mod medium;

pub use args::EalArgs;
pub use bootstrap::Runtime;
