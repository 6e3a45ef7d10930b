//! Proxy resync CLI
//!
//! Runs the etcd gRPC proxy endpoint auto-sync scenario against real
//! processes and reports each step.

use clap::Parser;
use commands::Commands;
use resync::{cli, commands, common::logging};

#[derive(Parser)]
#[command(name = "resync", about = "gRPC proxy endpoint auto-sync scenario runner")]
#[command(version, long_about = None)]
struct Cli {
    /// Debug-level logging for this tool
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    logging::init_cli(cli.verbose);

    if let Err(e) = cli::dispatch(cli.command).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
