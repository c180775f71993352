//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use dnacommit_capability::{CapabilityBackend, backend_from_config};
use dnacommit_core::{AdaptiveStrategy, Collaborators, CommitSafetyLayer, CycleSummary, Orchestrator};
use dnacommit_shared::{
    AppConfig, Approval, DeltaStatus, ItemId, KeywordChange, PipelineConfig, RunMode, RunOutcome,
    RunRecord, SchedulePolicy, Status, StrategyDelta, StrategyPolicy, init_config, load_config,
    load_config_from,
};
use dnacommit_storage::{ItemFilter, Storage};
use dnacommit_vcs::{GitCli, MemoryVcs, TrunkGuard, VcsBackend};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::progress::CliProgress;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// DNA-commit: turn collected knowledge into reviewed commits on an automation branch.
#[derive(Parser)]
#[command(
    name = "dnacommit",
    version,
    about = "Collect, evaluate and apply knowledge to a repository on an isolated branch.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.dnacommit/dnacommit.toml).
    #[arg(long, global = true, env = "DNACOMMIT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the pipeline once.
    Run {
        /// Stage to run alone: collect, evaluate, generate, review, commit or cleanup.
        #[arg(long, default_value = "full")]
        stage: RunMode,

        /// Work on a copy of the database and an in-memory repository.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show item counts, pending approvals and recent runs.
    Status {
        /// Number of recent runs to show.
        #[arg(long, default_value = "5")]
        runs: usize,
    },

    /// Run the pipeline on its daily schedule until interrupted.
    Schedule {
        /// Override `[schedule].policy`: full or split.
        #[arg(long)]
        policy: Option<String>,
    },

    /// Grant manual approval for a reviewed item.
    Approve {
        id: String,

        #[arg(long, default_value = "approved by operator")]
        reason: String,
    },

    /// Revert an item's commit on the automation branch.
    Rollback {
        id: String,

        #[arg(long, default_value = "rolled back by operator")]
        reason: String,
    },

    /// Inspect and act on strategy adjustments.
    Strategy {
        #[command(subcommand)]
        action: StrategyAction,
    },

    /// Physically remove long soft-deleted items.
    Purge {
        /// Defaults to `[cleanup].purge_after_days`.
        #[arg(long)]
        older_than_days: Option<u32>,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Strategy subcommands.
#[derive(Subcommand)]
pub(crate) enum StrategyAction {
    /// Propose an adjustment from recent runs.
    Propose {
        /// Trailing runs to consider [default: strategy.window_runs]
        #[arg(long)]
        window: Option<usize>,
    },
    /// Apply a proposed delta.
    Apply { id: Uuid },
    /// Dismiss a proposed delta.
    Dismiss { id: Uuid },
    /// List deltas.
    List {
        /// Filter: proposed, applied or dismissed.
        #[arg(long)]
        status: Option<DeltaStatus>,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "dnacommit=info",
        1 => "dnacommit=debug",
        _ => "dnacommit=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    // Config commands never touch the database.
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(config_path),
        };
    }

    let config = resolve_config(config_path)?;
    match cli.command {
        Command::Run { stage, dry_run } => cmd_run(&config, stage, dry_run).await,
        Command::Status { runs } => cmd_status(&config, runs).await,
        Command::Schedule { policy } => cmd_schedule(config, policy).await,
        Command::Approve { id, reason } => cmd_approve(&config, &id, &reason).await,
        Command::Rollback { id, reason } => cmd_rollback(&config, &id, &reason).await,
        Command::Strategy { action } => cmd_strategy(&config, action).await,
        Command::Purge { older_than_days } => cmd_purge(&config, older_than_days).await,
        Command::Config { .. } => Ok(()),
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

async fn open_store(config: &AppConfig) -> Result<Arc<Storage>> {
    let path = config.database_path();
    let store = Storage::open(&path)
        .await
        .wrap_err_with(|| format!("cannot open database at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn committer(config: &AppConfig, store: Arc<Storage>, vcs: Arc<dyn VcsBackend>) -> Result<Arc<CommitSafetyLayer>> {
    let layer = CommitSafetyLayer::new(
        store,
        vcs,
        config.repository.branch.clone(),
        &TrunkGuard::from_config(config),
    )?
    .with_gate(PipelineConfig::from(config).gate);
    Ok(Arc::new(layer))
}

/// Everything a pipeline run needs, wired from config.
struct Pipeline {
    orchestrator: Orchestrator,
    backend: Arc<dyn CapabilityBackend>,
}

impl Pipeline {
    fn build(config: &AppConfig, store: Arc<Storage>, vcs: Arc<dyn VcsBackend>) -> Result<Self> {
        let backend = backend_from_config(config)?;
        let committer = committer(config, store.clone(), vcs)?;
        let orchestrator = Orchestrator::new(
            store,
            Collaborators::from_backend(backend.clone()),
            committer,
            PipelineConfig::from(config),
            config.seed_strategy(),
        );
        Ok(Self {
            orchestrator,
            backend,
        })
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config: &AppConfig, mode: RunMode, dry_run: bool) -> Result<()> {
    let mut scratch = None;
    let (store, vcs): (Arc<Storage>, Arc<dyn VcsBackend>) = if dry_run {
        let path = scratch_copy(&config.database_path()).await?;
        info!(database = %path.display(), "dry run on a scratch database");
        let store = Storage::open(&path).await;
        scratch = Some(path.clone());
        match store {
            Ok(store) => (Arc::new(store), Arc::new(MemoryVcs::new(TrunkGuard::from_config(config)))),
            Err(e) => {
                remove_scratch(&path).await;
                return Err(e.into());
            }
        }
    } else {
        (open_store(config).await?, Arc::new(GitCli::from_config(config)))
    };

    let result: Result<CycleSummary> = match Pipeline::build(config, store, vcs) {
        Ok(pipeline) => {
            let progress = CliProgress::new();
            let result = pipeline.orchestrator.run_cycle(mode, &progress).await;
            progress.finish();
            pipeline.backend.shutdown().await;
            result.map_err(Into::into)
        }
        Err(e) => Err(e),
    };
    // The pipeline and its store are dropped by now, so the file is closed.
    if let Some(path) = &scratch {
        remove_scratch(path).await;
    }

    let summary = result?;
    print_summary(&summary);
    if dry_run {
        println!("  (dry run: no repository or database changes were kept)");
    }
    println!();
    Ok(())
}

/// Copy the database to a temp file so a dry run never touches the real store.
async fn scratch_copy(database: &Path) -> Result<PathBuf> {
    let scratch = std::env::temp_dir().join(format!("dnacommit-dry-run-{}.db", Uuid::now_v7()));
    if tokio::fs::try_exists(database).await.unwrap_or(false) {
        tokio::fs::copy(database, &scratch)
            .await
            .wrap_err_with(|| format!("cannot copy {}", database.display()))?;
    }
    Ok(scratch)
}

/// Delete a dry-run database and any sidecar files SQLite left next to it.
async fn remove_scratch(scratch: &Path) {
    for suffix in ["", "-wal", "-shm", "-journal"] {
        let mut name = scratch.as_os_str().to_owned();
        name.push(suffix);
        let path = PathBuf::from(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed dry-run scratch file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "could not remove dry-run scratch file"),
        }
    }
}

fn print_summary(summary: &CycleSummary) {
    let run = &summary.run;
    println!();
    println!("  Run {} ({})", run.run_id, run.mode);
    println!("  Outcome:     {}", outcome_label(&run.outcome));
    println!("  Transitions: {}", summary.transition_count());
    for (status, n) in &summary.transitions {
        println!("    -> {status:<20} {n}");
    }
    println!("  Items:");
    for (status, n) in &summary.totals {
        println!("    {status:<23} {n}");
    }
}

fn outcome_label(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Running => "running".into(),
        RunOutcome::Completed => "completed".into(),
        RunOutcome::TimedOut => "timed out".into(),
        RunOutcome::Aborted { reason } => format!("aborted: {reason}"),
    }
}

async fn cmd_status(config: &AppConfig, runs: usize) -> Result<()> {
    let store = open_store(config).await?;
    let stats = store.stats(chrono::Duration::days(1)).await?;

    println!();
    println!("  Items by status");
    for (status, n) in &stats.by_status {
        println!("    {status:<20} {n}");
    }
    println!(
        "  Last 24h: {} collected, {} retries",
        stats.collected, stats.retries
    );

    let pending = store
        .list(&ItemFilter::statuses(&[Status::ReviewPassed]).approval(Approval::Pending))
        .await?;
    println!();
    println!("  Pending approval ({})", pending.len());
    for item in &pending {
        let confidence = item
            .review_notes
            .as_ref()
            .map(|n| format!("{:.2}", n.confidence))
            .unwrap_or_else(|| "-".into());
        println!("    {}  confidence {confidence}  {}", item.id, item.payload.title);
    }

    println!();
    println!("  Recent runs");
    for run in store.list_runs(runs).await? {
        print_run(&run);
    }
    println!();
    Ok(())
}

fn print_run(run: &RunRecord) {
    let total: u64 = run.stage_results.values().map(|c| c.total()).sum();
    println!(
        "    {}  {:<8} {:<10} {} items  {}",
        run.started_at.format("%Y-%m-%d %H:%M"),
        run.mode,
        outcome_label(&run.outcome),
        total,
        run.run_id
    );
}

async fn cmd_schedule(mut config: AppConfig, policy: Option<String>) -> Result<()> {
    if let Some(policy) = policy {
        config.schedule.policy = policy;
    }
    let schedule = SchedulePolicy::try_from(&config)?;
    let store = open_store(&config).await?;
    let pipeline = Pipeline::build(&config, store, Arc::new(GitCli::from_config(&config)))?;
    info!(policy = %config.schedule.policy, "scheduler started");

    let progress = dnacommit_core::SilentProgress;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let result = dnacommit_core::run_forever(&pipeline.orchestrator, &schedule, &progress, shutdown).await;
    pipeline.backend.shutdown().await;
    result?;
    Ok(())
}

async fn cmd_approve(config: &AppConfig, id: &str, reason: &str) -> Result<()> {
    let store = open_store(config).await?;
    let layer = committer(config, store, Arc::new(GitCli::from_config(config)))?;
    let item = layer.approve(&ItemId(id.to_string()), reason).await?;
    println!("Approved {} ({}); it will be committed on the next commit run.", item.id, item.payload.title);
    Ok(())
}

async fn cmd_rollback(config: &AppConfig, id: &str, reason: &str) -> Result<()> {
    let store = open_store(config).await?;
    let layer = committer(config, store, Arc::new(GitCli::from_config(config)))?;
    let item = layer.rollback(&ItemId(id.to_string()), reason).await?;
    let reverted = item
        .commit_ref
        .as_ref()
        .and_then(|c| c.reverted_by.clone())
        .unwrap_or_default();
    println!("Rolled back {} on {} (revert {reverted}).", item.id, layer.branch());
    Ok(())
}

async fn cmd_strategy(config: &AppConfig, action: StrategyAction) -> Result<()> {
    let store = open_store(config).await?;
    let strategy = AdaptiveStrategy::new(store, StrategyPolicy::from(config), config.seed_strategy());
    match action {
        StrategyAction::Propose { window } => {
            let window = window.unwrap_or_else(|| strategy.window_runs());
            let delta = strategy.propose_adjustments(window).await?;
            if delta.is_empty() {
                println!("No adjustment proposed.");
                for line in &delta.rationale {
                    println!("  {line}");
                }
            } else {
                print_delta(&delta);
                println!("Apply with: dnacommit strategy apply {}", delta.id);
            }
        }
        StrategyAction::Apply { id } => {
            let params = strategy.apply(id).await?;
            println!(
                "Strategy version {}: threshold {:.2}, keywords: {}",
                params.version,
                params.acceptance_threshold,
                params.keywords.join(", ")
            );
        }
        StrategyAction::Dismiss { id } => {
            let delta = strategy.dismiss(id).await?;
            println!("Dismissed {}.", delta.id);
        }
        StrategyAction::List { status } => {
            let params = strategy.active_params().await?;
            println!(
                "Active strategy v{} (threshold {:.2})",
                params.version, params.acceptance_threshold
            );
            for delta in strategy.list(status).await? {
                print_delta(&delta);
            }
        }
    }
    Ok(())
}

fn print_delta(delta: &StrategyDelta) {
    println!();
    println!(
        "  {} [{}] {}",
        delta.id,
        delta.status.as_str(),
        delta.created_at.format("%Y-%m-%d %H:%M")
    );
    match delta.acceptance_rate {
        Some(rate) => println!("    acceptance {:.0}% over {} runs", rate * 100.0, delta.window_runs),
        None => println!("    no samples over {} runs", delta.window_runs),
    }
    if let Some(change) = &delta.threshold_change {
        println!("    threshold {:.2} -> {:.2}", change.from, change.to);
    }
    for change in &delta.keyword_changes {
        match change {
            KeywordChange::Add(k) => println!("    + {k}"),
            KeywordChange::Remove(k) => println!("    - {k}"),
        }
    }
    for (reason, n) in &delta.rejection_reasons {
        println!("    {n:>4} x {reason}");
    }
    for line in &delta.rationale {
        println!("    {line}");
    }
}

async fn cmd_purge(config: &AppConfig, older_than_days: Option<u32>) -> Result<()> {
    let days = older_than_days.unwrap_or(config.cleanup.purge_after_days);
    let store = open_store(config).await?;
    let removed = store.purge(chrono::Duration::days(i64::from(days))).await?;
    info!(removed, days, at = %Utc::now(), "purge finished");
    println!("Purged {removed} item(s) deleted more than {days} day(s) ago.");
    Ok(())
}

fn cmd_config_init(path: Option<&Path>) -> Result<()> {
    let path = init_config(path)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_stage_dry_run() {
        let cli = Cli::try_parse_from(["dnacommit", "run", "--stage", "collect", "--dry-run"]).unwrap();
        match cli.command {
            Command::Run { stage, dry_run } => {
                assert_eq!(stage, RunMode::Collect);
                assert!(dry_run);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_defaults_to_full_cycle() {
        let cli = Cli::try_parse_from(["dnacommit", "-vv", "run"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Command::Run {
                stage: RunMode::Full,
                dry_run: false
            }
        ));
    }

    #[test]
    fn strategy_apply_takes_a_uuid() {
        assert!(Cli::try_parse_from(["dnacommit", "strategy", "apply", "not-a-uuid"]).is_err());
        let id = Uuid::now_v7();
        let cli = Cli::try_parse_from(["dnacommit", "strategy", "apply", &id.to_string()]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Strategy {
                action: StrategyAction::Apply { id: parsed }
            } if parsed == id
        ));
    }

    #[test]
    fn strategy_propose_accepts_a_window() {
        let cli = Cli::try_parse_from(["dnacommit", "strategy", "propose", "--window", "5"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Strategy {
                action: StrategyAction::Propose { window: Some(5) }
            }
        ));
        let cli = Cli::try_parse_from(["dnacommit", "strategy", "propose"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Strategy {
                action: StrategyAction::Propose { window: None }
            }
        ));
    }

    #[tokio::test]
    async fn dry_run_scratch_is_removed() {
        let source = std::env::temp_dir().join(format!("dnacommit-src-{}.db", Uuid::now_v7()));
        tokio::fs::write(&source, b"not really sqlite").await.unwrap();
        let scratch = scratch_copy(&source).await.unwrap();
        assert!(scratch.exists());
        let mut wal = scratch.as_os_str().to_owned();
        wal.push("-wal");
        tokio::fs::write(&wal, b"").await.unwrap();

        remove_scratch(&scratch).await;
        assert!(!scratch.exists());
        assert!(!Path::new(&wal).exists());
        assert!(source.exists());
        let _ = std::fs::remove_file(&source);
    }

    #[test]
    fn global_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["dnacommit", "status", "--config", "/tmp/dna.toml"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some(Path::new("/tmp/dna.toml")));
    }
}
