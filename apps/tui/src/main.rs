//! DNA-commit dashboard: a read-only terminal view of the knowledge store.
//!
//! Shows lifecycle counts and pending approvals, recent runs, and strategy
//! deltas, built with `ratatui` + `crossterm`.

mod app;
mod screens;
mod snapshot;
mod widgets;

use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use dnacommit_shared::{load_config, load_config_from};
use dnacommit_storage::Storage;

/// Read-only dashboard over the DNA-commit database.
#[derive(Parser)]
#[command(name = "dnacommit-tui", version)]
struct Args {
    /// Config file (defaults to ~/.dnacommit/dnacommit.toml).
    #[arg(long, env = "DNACOMMIT_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let config = match args.config.as_deref() {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let path = config.database_path();
    let store = Storage::open_readonly(&path)
        .await
        .wrap_err_with(|| format!("cannot open database at {}", path.display()))?;
    app::run(store).await
}
