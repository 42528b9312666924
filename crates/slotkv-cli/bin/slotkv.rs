//! slotkv command-line entry point.
//!
//! This is a thin wrapper around the slotkv-cli library that:
//! 1. Parses command-line arguments
//! 2. Initializes logging
//! 3. Runs the command against the store, writing to stdout

use anyhow::Result;
use clap::Parser;
use slotkv_cli::Cli;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays clean
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    tracing::debug!("Opening store at {:?}", cli.dir);

    let stdout = std::io::stdout();
    slotkv_cli::run(cli, &mut stdout.lock())
}
