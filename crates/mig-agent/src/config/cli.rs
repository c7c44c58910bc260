use clap::{Parser, Subcommand};
use utils::version;

use crate::config::catalog::CatalogArgs;
use crate::config::daemon::DaemonArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the MIG agent on this node
    Daemon(Box<DaemonArgs>),
    /// Validate the allowed-geometry catalog and print it
    #[command(name = "validate-catalog")]
    ValidateCatalog(CatalogArgs),
}
