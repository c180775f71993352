//! Shared types, error model, and configuration for DNA-commit.
//!
//! This crate is the foundation depended on by all other DNA-commit crates.
//! It provides:
//! - [`DnaCommitError`], the unified error type
//! - Domain types ([`KnowledgeItem`], [`Status`], [`RunRecord`], [`StrategyDelta`], ...)
//! - Configuration ([`AppConfig`], runtime policies, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ApprovalConfig, ApprovalPolicy, BUILTIN_TRUNK_BRANCHES, BackendConfig,
    CleanupConfig, GatePolicy, PipelineConfig, PipelineSection, RepositoryConfig, ScheduleConfig,
    SchedulePolicy, StrategyConfig, StrategyPolicy, Trigger, config_dir, config_file_path,
    expand_home, init_config, load_config, load_config_from, validate_branch_name,
};
pub use error::{DnaCommitError, Result};
pub use types::{
    Approval, Artifact, ArtifactFile, ArtifactRef, CommitRef, DeltaStatus, Evaluation, Finding,
    ItemId, KeywordChange, KnowledgeItem, Payload, RawCandidate, ReviewNotes, RunId, RunMode,
    RunOutcome, RunRecord, ScoreWeights, Scores, Severity, Source, Stage, StageCounts, Status,
    StrategyDelta, StrategyParams, ThresholdChange, TransitionKind, TransitionRecord,
};
