mod bootstrap;
mod cli_args;
mod config;

use anyhow::Result;
use clap::Parser;

use crate::bootstrap::{init_tracing, run_bridge};
use crate::cli_args::Cli;
use crate::config::BridgeSettings;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let settings = BridgeSettings::from_cli(&cli)?;
    run_bridge(settings).await
}
