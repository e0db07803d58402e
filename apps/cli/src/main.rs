//! WikiSelect CLI: manage article selections and their archive exports.
//!
//! Builders describe a set of wiki articles; every run materializes a new
//! selection version and, in production, requests an archive build for it.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
