//! CLI command definitions
//!
//! Defines the clap commands for the resync CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the proxy auto-sync scenario
    Run {
        /// Path to a YAML scenario file (default: the built-in two-node run)
        scenario: Option<PathBuf>,

        /// Tool configuration file (default: platform config dir)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Keep node data directories after the run
        #[arg(long)]
        keep_data: bool,
    },

    /// List cluster members
    Members {
        /// Client endpoints to query, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        endpoints: Vec<String>,

        /// Tool configuration file (default: platform config dir)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}
