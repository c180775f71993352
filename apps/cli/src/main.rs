//! DNA-commit CLI: runs the self-evolution pipeline against a target repository.
//!
//! Collects knowledge, scores it, turns the best of it into code changes and
//! commits them to an isolated automation branch.

mod commands;
mod progress;

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
