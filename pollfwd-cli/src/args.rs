//! Command line arguments shared by every binary.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct EalArgs {
    /// lanes to run on, like 0-3,8; the first one is the main lane
    #[clap(short = 'l', long = "lcores", default_value = "0")]
    pub lcores: String,

    /// number of virtual ports to create
    #[clap(long, default_value_t = 2)]
    pub vdev: u8,

    /// back the mbuf pool with huge pages, fail if there are not enough
    #[clap(long, conflicts_with = "no_huge")]
    pub huge_pages: bool,

    /// never use huge pages
    #[clap(long)]
    pub no_huge: bool,
}

impl EalArgs {
    /// Huge page choice for `PoolConfig`, `None` when left to the pool.
    pub fn huge_page(&self) -> Option<bool> {
        match (self.huge_pages, self.no_huge) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}
