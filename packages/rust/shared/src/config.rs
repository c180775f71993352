//! Application configuration for DNA-commit.
//!
//! User config lives at `~/.dnacommit/dnacommit.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use chrono::NaiveTime;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DnaCommitError, Result};
use crate::types::{ScoreWeights, Stage, StrategyParams};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "dnacommit.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".dnacommit";

/// Branch names that are always treated as trunk.
pub const BUILTIN_TRUNK_BRANCHES: [&str; 3] = ["main", "master", "trunk"];

static BRANCH_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+(/[A-Za-z0-9._-]+)*$").expect("valid regex"));

// ---------------------------------------------------------------------------
// Config structs (matching dnacommit.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub repository: RepositoryConfig,

    #[serde(default)]
    pub approval: ApprovalConfig,

    #[serde(default)]
    pub strategy: StrategyConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub backend: BackendConfig,
}

/// `[paths]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Knowledge Store database file.
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

fn default_database() -> String {
    "~/.dnacommit/dnacommit.db".into()
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Aggregate score an item must exceed to be accepted.
    #[serde(default = "default_threshold")]
    pub acceptance_threshold: f64,

    /// Accept items whose aggregate equals the threshold exactly.
    #[serde(default)]
    pub ties_accept: bool,

    #[serde(default)]
    pub weights: ScoreWeights,

    #[serde(default = "default_generation_attempts")]
    pub generation_attempts: u32,

    #[serde(default = "default_review_attempts")]
    pub review_attempts: u32,

    #[serde(default = "default_evaluation_attempts")]
    pub evaluation_attempts: u32,

    /// Maximum concurrent collaborator calls within a stage.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Wall-clock limit for a whole run, in seconds.
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,

    /// Results requested per keyword/topic during collection.
    #[serde(default = "default_results_per_query")]
    pub results_per_query: usize,

    /// Maximum generations per run.
    #[serde(default = "default_generate_batch")]
    pub generate_batch: usize,

    /// Maximum commits per run.
    #[serde(default = "default_commit_batch")]
    pub commit_batch: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            acceptance_threshold: default_threshold(),
            ties_accept: false,
            weights: ScoreWeights::default(),
            generation_attempts: default_generation_attempts(),
            review_attempts: default_review_attempts(),
            evaluation_attempts: default_evaluation_attempts(),
            parallelism: default_parallelism(),
            run_timeout_secs: default_run_timeout(),
            results_per_query: default_results_per_query(),
            generate_batch: default_generate_batch(),
            commit_batch: default_commit_batch(),
        }
    }
}

fn default_threshold() -> f64 {
    0.7
}
fn default_generation_attempts() -> u32 {
    2
}
fn default_review_attempts() -> u32 {
    2
}
fn default_evaluation_attempts() -> u32 {
    3
}
fn default_parallelism() -> usize {
    4
}
fn default_run_timeout() -> u64 {
    3600
}
fn default_results_per_query() -> usize {
    3
}
fn default_generate_batch() -> usize {
    5
}
fn default_commit_batch() -> usize {
    3
}

/// `[cleanup]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Non-terminal items older than this are soft-deleted.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Sink items scoring below this are soft-deleted.
    #[serde(default = "default_min_usefulness")]
    pub min_usefulness: f64,

    /// Soft-deleted items older than this are purged by `purge`.
    #[serde(default = "default_purge_after_days")]
    pub purge_after_days: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            min_usefulness: default_min_usefulness(),
            purge_after_days: default_purge_after_days(),
        }
    }
}

fn default_retention_days() -> u32 {
    30
}
fn default_min_usefulness() -> f64 {
    0.3
}
fn default_purge_after_days() -> u32 {
    90
}

/// `[repository]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Target repository receiving generated changes.
    #[serde(default = "default_repo_path")]
    pub path: String,

    /// Dedicated automation branch.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Additional branch names protected as trunk.
    #[serde(default)]
    pub trunk_branches: Vec<String>,

    /// Worktree checked out on the automation branch.
    #[serde(default = "default_worktree")]
    pub worktree: String,

    /// Commit author, `Name <email>`.
    #[serde(default = "default_author")]
    pub author: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: default_repo_path(),
            branch: default_branch(),
            trunk_branches: Vec::new(),
            worktree: default_worktree(),
            author: default_author(),
        }
    }
}

fn default_repo_path() -> String {
    "~/dev/raspi-voice7".into()
}
fn default_branch() -> String {
    "dna-auto/evolution".into()
}
fn default_worktree() -> String {
    "~/.dnacommit/worktree".into()
}
fn default_author() -> String {
    "DNA-commit <dnacommit@localhost>".into()
}

/// `[approval]` section: when a passed review still needs an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Reviews below this confidence need manual approval.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Any critical finding needs manual approval.
    #[serde(default = "default_true")]
    pub block_on_critical: bool,

    /// Every passed review needs manual approval.
    #[serde(default)]
    pub always_manual: bool,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            block_on_critical: true,
            always_manual: false,
        }
    }
}

fn default_min_confidence() -> f64 {
    0.7
}
fn default_true() -> bool {
    true
}

/// `[strategy]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Initial web-search keywords (seed for strategy version 1).
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,

    /// Initial repository-trend topics.
    #[serde(default = "default_repo_topics")]
    pub repo_topics: Vec<String>,

    /// Candidates to swap in for underperforming keywords.
    #[serde(default)]
    pub reserve_keywords: Vec<String>,

    /// Acceptance rate below which adjustments loosen the gate.
    #[serde(default = "default_floor")]
    pub floor: f64,

    /// Acceptance rate above which adjustments tighten the gate.
    #[serde(default = "default_ceiling")]
    pub ceiling: f64,

    /// Threshold step per proposal.
    #[serde(default = "default_step")]
    pub threshold_step: f64,

    #[serde(default = "default_threshold_min")]
    pub threshold_min: f64,

    #[serde(default = "default_threshold_max")]
    pub threshold_max: f64,

    /// Trailing number of run records considered.
    #[serde(default = "default_window")]
    pub window_runs: usize,

    /// Collected items required before proposing anything.
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            keywords: default_keywords(),
            repo_topics: default_repo_topics(),
            reserve_keywords: Vec::new(),
            floor: default_floor(),
            ceiling: default_ceiling(),
            threshold_step: default_step(),
            threshold_min: default_threshold_min(),
            threshold_max: default_threshold_max(),
            window_runs: default_window(),
            min_samples: default_min_samples(),
        }
    }
}

fn default_keywords() -> Vec<String> {
    [
        "raspberry pi voice assistant",
        "openai realtime api best practices",
        "python audio streaming optimization",
        "webrtc python raspberry pi",
        "gpiozero button handling",
        "edge AI raspberry pi",
        "voice recognition optimization",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_repo_topics() -> Vec<String> {
    [
        "raspberry-pi voice-assistant",
        "openai-realtime-api",
        "python audio streaming",
        "aiortc webrtc",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_floor() -> f64 {
    0.2
}
fn default_ceiling() -> f64 {
    0.6
}
fn default_step() -> f64 {
    0.05
}
fn default_threshold_min() -> f64 {
    0.5
}
fn default_threshold_max() -> f64 {
    0.9
}
fn default_window() -> usize {
    14
}
fn default_min_samples() -> u64 {
    10
}

/// `[schedule]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// `full` or `split`.
    #[serde(default = "default_policy")]
    pub policy: String,

    /// Daily trigger for the `full` policy (`HH:MM`, local time).
    #[serde(default = "default_full_at")]
    pub full_at: String,

    /// Triggers for the `split` policy.
    #[serde(default = "default_split")]
    pub split: Vec<TriggerConfig>,
}

/// One `[[schedule.split]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// `HH:MM`, local time.
    pub at: String,
    pub stages: Vec<Stage>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            full_at: default_full_at(),
            split: default_split(),
        }
    }
}

fn default_policy() -> String {
    "full".into()
}
fn default_full_at() -> String {
    "03:00".into()
}
fn default_split() -> Vec<TriggerConfig> {
    vec![
        TriggerConfig {
            at: "06:00".into(),
            stages: vec![Stage::Collect, Stage::Evaluate],
        },
        TriggerConfig {
            at: "18:00".into(),
            stages: vec![Stage::Generate, Stage::Review, Stage::Commit],
        },
        TriggerConfig {
            at: "02:00".into(),
            stages: vec![Stage::Cleanup],
        },
    ]
}

/// `[backend]` section: which capability transport to use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Long-lived subprocess speaking JSON lines on stdio.
    Bridge {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
    },
    /// JSON-over-HTTP capability service.
    Http {
        endpoint: String,
        /// Name of the env var holding a bearer token (never the token itself).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key_env: Option<String>,
        #[serde(default = "default_http_timeout")]
        timeout_secs: u64,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Bridge {
            command: "python3".into(),
            args: vec!["-m".into(), "dnacommit_agents".into()],
            working_dir: None,
        }
    }
}

fn default_http_timeout() -> u64 {
    120
}

// ---------------------------------------------------------------------------
// Runtime views (derived from AppConfig)
// ---------------------------------------------------------------------------

/// Stage Gate parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatePolicy {
    pub acceptance_threshold: f64,
    pub ties_accept: bool,
    pub weights: ScoreWeights,
    pub evaluation_attempts: u32,
    pub generation_attempts: u32,
    pub review_attempts: u32,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for GatePolicy {
    fn from(config: &AppConfig) -> Self {
        let p = &config.pipeline;
        Self {
            acceptance_threshold: p.acceptance_threshold,
            ties_accept: p.ties_accept,
            weights: p.weights,
            evaluation_attempts: p.evaluation_attempts,
            generation_attempts: p.generation_attempts,
            review_attempts: p.review_attempts,
        }
    }
}

/// Manual-approval predicate parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApprovalPolicy {
    pub min_confidence: f64,
    pub block_on_critical: bool,
    pub always_manual: bool,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for ApprovalPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            min_confidence: config.approval.min_confidence,
            block_on_critical: config.approval.block_on_critical,
            always_manual: config.approval.always_manual,
        }
    }
}

/// Runtime orchestrator configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub gate: GatePolicy,
    pub approval: ApprovalPolicy,
    pub parallelism: usize,
    pub run_timeout: Duration,
    pub results_per_query: usize,
    pub generate_batch: usize,
    pub commit_batch: usize,
    pub retention: chrono::Duration,
    pub min_usefulness: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        let p = &config.pipeline;
        Self {
            gate: GatePolicy::from(config),
            approval: ApprovalPolicy::from(config),
            parallelism: p.parallelism.max(1),
            run_timeout: Duration::from_secs(p.run_timeout_secs),
            results_per_query: p.results_per_query,
            generate_batch: p.generate_batch,
            commit_batch: p.commit_batch,
            retention: chrono::Duration::days(i64::from(config.cleanup.retention_days)),
            min_usefulness: config.cleanup.min_usefulness,
        }
    }
}

/// Strategy module parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyPolicy {
    pub reserve_keywords: Vec<String>,
    pub floor: f64,
    pub ceiling: f64,
    pub threshold_step: f64,
    pub threshold_min: f64,
    pub threshold_max: f64,
    pub window_runs: usize,
    pub min_samples: u64,
}

impl Default for StrategyPolicy {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for StrategyPolicy {
    fn from(config: &AppConfig) -> Self {
        let s = &config.strategy;
        Self {
            reserve_keywords: s.reserve_keywords.clone(),
            floor: s.floor,
            ceiling: s.ceiling,
            threshold_step: s.threshold_step,
            threshold_min: s.threshold_min,
            threshold_max: s.threshold_max,
            window_runs: s.window_runs,
            min_samples: s.min_samples,
        }
    }
}

/// A daily trigger running a group of stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub at: NaiveTime,
    pub stages: Vec<Stage>,
}

/// Calendar policy consumed by the scheduler loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// One daily full cycle.
    Full { at: NaiveTime },
    /// Independent daily triggers per stage group.
    Split { triggers: Vec<Trigger> },
}

impl TryFrom<&AppConfig> for SchedulePolicy {
    type Error = DnaCommitError;

    fn try_from(config: &AppConfig) -> Result<Self> {
        let s = &config.schedule;
        match s.policy.as_str() {
            "full" => Ok(Self::Full {
                at: parse_time(&s.full_at)?,
            }),
            "split" => {
                let triggers = s
                    .split
                    .iter()
                    .map(|t| {
                        Ok(Trigger {
                            at: parse_time(&t.at)?,
                            stages: t.stages.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                if triggers.is_empty() {
                    return Err(DnaCommitError::config("split schedule has no triggers"));
                }
                Ok(Self::Split { triggers })
            }
            other => Err(DnaCommitError::config(format!(
                "unknown schedule policy '{other}' (expected full or split)"
            ))),
        }
    }
}

fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|e| DnaCommitError::config(format!("invalid time '{s}': {e}")))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Check ranges and invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        check_unit("pipeline.acceptance_threshold", p.acceptance_threshold)?;
        check_unit("cleanup.min_usefulness", self.cleanup.min_usefulness)?;
        check_unit("approval.min_confidence", self.approval.min_confidence)?;
        check_unit("strategy.floor", self.strategy.floor)?;
        check_unit("strategy.ceiling", self.strategy.ceiling)?;
        check_unit("strategy.threshold_min", self.strategy.threshold_min)?;
        check_unit("strategy.threshold_max", self.strategy.threshold_max)?;

        for (name, cap) in [
            ("pipeline.generation_attempts", p.generation_attempts),
            ("pipeline.review_attempts", p.review_attempts),
            ("pipeline.evaluation_attempts", p.evaluation_attempts),
        ] {
            if cap < 1 {
                return Err(DnaCommitError::config(format!("{name} must be at least 1")));
            }
        }
        if p.parallelism < 1 {
            return Err(DnaCommitError::config("pipeline.parallelism must be at least 1"));
        }
        if self.strategy.floor > self.strategy.ceiling {
            return Err(DnaCommitError::config(
                "strategy.floor must not exceed strategy.ceiling",
            ));
        }
        if self.strategy.threshold_min > self.strategy.threshold_max {
            return Err(DnaCommitError::config(
                "strategy.threshold_min must not exceed strategy.threshold_max",
            ));
        }

        validate_branch_name(&self.repository.branch)?;
        if self.is_trunk(&self.repository.branch) {
            return Err(DnaCommitError::config(format!(
                "repository.branch '{}' is a trunk branch",
                self.repository.branch
            )));
        }

        if let BackendConfig::Http { endpoint, .. } = &self.backend {
            url::Url::parse(endpoint).map_err(|e| {
                DnaCommitError::config(format!("invalid backend endpoint '{endpoint}': {e}"))
            })?;
        }

        SchedulePolicy::try_from(self)?;
        Ok(())
    }

    /// Whether `branch` is protected as trunk (built-in or configured).
    pub fn is_trunk(&self, branch: &str) -> bool {
        BUILTIN_TRUNK_BRANCHES.contains(&branch)
            || self.repository.trunk_branches.iter().any(|b| b == branch)
    }

    /// Resolved database path.
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.paths.database)
    }

    /// Version-1 strategy parameters seeded from `[strategy]` and `[pipeline]`.
    pub fn seed_strategy(&self) -> StrategyParams {
        StrategyParams {
            version: 1,
            keywords: self.strategy.keywords.clone(),
            repo_topics: self.strategy.repo_topics.clone(),
            acceptance_threshold: self.pipeline.acceptance_threshold,
        }
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(DnaCommitError::config(format!(
            "{name} must be within [0, 1], got {value}"
        )))
    }
}

/// Reject ref names git would refuse (`..`, `.lock` suffix, leading dash, ...).
pub fn validate_branch_name(branch: &str) -> Result<()> {
    let ok = BRANCH_NAME_RE.is_match(branch)
        && !branch.contains("..")
        && !branch.starts_with('-')
        && !branch.ends_with(".lock")
        && !branch.ends_with('.')
        && !branch.split('/').any(|part| part.starts_with('.'));
    if ok {
        Ok(())
    } else {
        Err(DnaCommitError::config(format!(
            "invalid branch name '{branch}'"
        )))
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.dnacommit/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| DnaCommitError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.dnacommit/dnacommit.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load and validate the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DnaCommitError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        DnaCommitError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Write a default config file to `path` (or the default location).
/// Returns the path to the created file.
pub fn init_config(path: Option<&Path>) -> Result<PathBuf> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| DnaCommitError::io(dir, e))?;
    }

    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DnaCommitError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DnaCommitError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
