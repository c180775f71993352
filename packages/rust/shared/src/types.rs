//! Core domain types for the DNA-commit pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::DnaCommitError;

// ---------------------------------------------------------------------------
// ItemId
// ---------------------------------------------------------------------------

/// Stable content-derived identifier of a knowledge item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    /// Derive the id from the source and the candidate's locator.
    ///
    /// Falls back to the content when the locator is empty, so two payloads
    /// from the same URL always collapse to one item.
    pub fn derive(source: Source, locator: &str, content: &str) -> Self {
        let key = if locator.trim().is_empty() {
            content
        } else {
            locator.trim()
        };
        let mut hasher = Sha256::new();
        hasher.update(source.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self(digest[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Where a candidate was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    WebSearch,
    RepoTrend,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSearch => "web-search",
            Self::RepoTrend => "repo-trend",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Source {
    type Err = DnaCommitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web-search" => Ok(Self::WebSearch),
            "repo-trend" => Ok(Self::RepoTrend),
            other => Err(DnaCommitError::validation(format!("unknown source '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Status (lifecycle state machine)
// ---------------------------------------------------------------------------

/// Lifecycle state of a knowledge item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Collected,
    EvaluatedAccepted,
    EvaluatedRejected,
    CodeGenerated,
    ReviewPassed,
    ReviewFailed,
    Committed,
    RolledBack,
    Deleted,
}

impl Status {
    /// Every status, in lifecycle order.
    pub const ALL: [Status; 9] = [
        Status::Collected,
        Status::EvaluatedAccepted,
        Status::EvaluatedRejected,
        Status::CodeGenerated,
        Status::ReviewPassed,
        Status::ReviewFailed,
        Status::Committed,
        Status::RolledBack,
        Status::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collected => "collected",
            Self::EvaluatedAccepted => "evaluated_accepted",
            Self::EvaluatedRejected => "evaluated_rejected",
            Self::CodeGenerated => "code_generated",
            Self::ReviewPassed => "review_passed",
            Self::ReviewFailed => "review_failed",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Deleted => "deleted",
        }
    }

    /// Terminal states never leave (except `committed -> rolled_back`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Deleted)
    }

    /// Sink states: rejected items waiting for cleanup.
    pub fn is_sink(&self) -> bool {
        matches!(self, Self::EvaluatedRejected | Self::ReviewFailed)
    }

    /// Whether items in this status carry a generated artifact.
    pub fn has_artifact(&self) -> bool {
        matches!(
            self,
            Self::CodeGenerated
                | Self::ReviewPassed
                | Self::ReviewFailed
                | Self::Committed
                | Self::RolledBack
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: Status) -> bool {
        use Status::*;
        if next == Deleted {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Collected, EvaluatedAccepted)
                | (Collected, EvaluatedRejected)
                | (EvaluatedAccepted, CodeGenerated)
                | (EvaluatedAccepted, EvaluatedRejected)
                | (CodeGenerated, ReviewPassed)
                | (CodeGenerated, ReviewFailed)
                | (ReviewPassed, Committed)
                | (ReviewPassed, ReviewFailed)
                | (Committed, RolledBack)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Status {
    type Err = DnaCommitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DnaCommitError::validation(format!("unknown status '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Stage & RunMode
// ---------------------------------------------------------------------------

/// One pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Collect,
    Evaluate,
    Generate,
    Review,
    Commit,
    Cleanup,
}

impl Stage {
    /// Fixed execution order of a full cycle.
    pub const ORDER: [Stage; 6] = [
        Stage::Collect,
        Stage::Evaluate,
        Stage::Generate,
        Stage::Review,
        Stage::Commit,
        Stage::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collect => "collect",
            Self::Evaluate => "evaluate",
            Self::Generate => "generate",
            Self::Review => "review",
            Self::Commit => "commit",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = DnaCommitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ORDER
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DnaCommitError::validation(format!("unknown stage '{s}'")))
    }
}

/// What a single orchestrator execution covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    Collect,
    Evaluate,
    Generate,
    Review,
    Commit,
    Cleanup,
}

impl RunMode {
    /// Stages executed by this mode, in order.
    pub fn stages(&self) -> &'static [Stage] {
        match self {
            Self::Full => &Stage::ORDER,
            Self::Collect => &[Stage::Collect],
            Self::Evaluate => &[Stage::Evaluate],
            Self::Generate => &[Stage::Generate],
            Self::Review => &[Stage::Review],
            Self::Commit => &[Stage::Commit],
            Self::Cleanup => &[Stage::Cleanup],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Collect => "collect",
            Self::Evaluate => "evaluate",
            Self::Generate => "generate",
            Self::Review => "review",
            Self::Commit => "commit",
            Self::Cleanup => "cleanup",
        }
    }
}

impl From<Stage> for RunMode {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Collect => Self::Collect,
            Stage::Evaluate => Self::Evaluate,
            Stage::Generate => Self::Generate,
            Stage::Review => Self::Review,
            Stage::Commit => Self::Commit,
            Stage::Cleanup => Self::Cleanup,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = DnaCommitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "full" {
            return Ok(Self::Full);
        }
        s.parse::<Stage>()
            .map(Self::from)
            .map_err(|_| DnaCommitError::validation(format!("unknown run mode '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Payload & collection
// ---------------------------------------------------------------------------

/// Collected content, kept as delivered by the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Headline (article title, `owner/repo`, ...).
    pub title: String,
    /// URL or other locator used for deduplication.
    #[serde(default)]
    pub locator: String,
    /// Body text or description.
    #[serde(default)]
    pub content: String,
    /// Keyword or topic that produced this candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Collector-specific extras (stars, language, topics...).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

/// A raw candidate returned by a collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub source: Source,
    pub payload: Payload,
}

impl RawCandidate {
    /// Stable id for deduplication.
    pub fn item_id(&self) -> ItemId {
        ItemId::derive(self.source, &self.payload.locator, &self.payload.content)
    }
}

// ---------------------------------------------------------------------------
// Scores & evaluation
// ---------------------------------------------------------------------------

/// Metric scores produced by the evaluator, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub quality: f64,
    pub relevance: f64,
    pub novelty: f64,
    pub utility: f64,
}

impl Scores {
    /// Metric name/value pairs in a fixed order.
    pub fn metrics(&self) -> [(&'static str, f64); 4] {
        [
            ("quality", self.quality),
            ("relevance", self.relevance),
            ("novelty", self.novelty),
            ("utility", self.utility),
        ]
    }

    /// Weighted mean of the four metrics.
    pub fn aggregate(&self, weights: &ScoreWeights) -> f64 {
        let total = weights.quality + weights.relevance + weights.novelty + weights.utility;
        if total <= 0.0 {
            return (self.quality + self.relevance + self.novelty + self.utility) / 4.0;
        }
        (self.quality * weights.quality
            + self.relevance * weights.relevance
            + self.novelty * weights.novelty
            + self.utility * weights.utility)
            / total
    }

    /// Name of the lowest-scoring metric.
    pub fn weakest(&self) -> &'static str {
        self.metrics()
            .into_iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(name, _)| name)
            .unwrap_or("quality")
    }

    /// Reject NaN and out-of-range values.
    pub fn validate(&self) -> crate::Result<()> {
        for (name, value) in self.metrics() {
            if !(0.0..=1.0).contains(&value) {
                return Err(DnaCommitError::validation(format!(
                    "score '{name}' out of range: {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Relative weight of each metric in the aggregate score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub quality: f64,
    pub relevance: f64,
    pub novelty: f64,
    pub utility: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            quality: 1.0,
            relevance: 1.0,
            novelty: 1.0,
            utility: 1.0,
        }
    }
}

/// Evaluation outcome frozen at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub scores: Scores,
    /// Weighted aggregate of `scores`.
    pub aggregate: f64,
    /// Acceptance threshold in force when the item was evaluated.
    pub threshold: f64,
    /// Whether the gate accepted the item.
    pub accepted: bool,
}

// ---------------------------------------------------------------------------
// Review
// ---------------------------------------------------------------------------

/// Severity of a review finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Minor,
    Major,
    Critical,
}

/// A single reviewer finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub description: String,
}

/// Structured reviewer output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewNotes {
    pub passed: bool,
    /// Reviewer confidence in `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub summary: String,
}

impl ReviewNotes {
    pub fn has_critical(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Critical)
    }
}

/// Manual-approval substate of `review_passed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approval {
    /// No manual approval needed.
    #[default]
    Automatic,
    /// Waiting for an operator (`pending_manual_approval`).
    Pending,
    /// Approved by an operator.
    Granted,
}

impl Approval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Pending => "pending",
            Self::Granted => "granted",
        }
    }
}

impl FromStr for Approval {
    type Err = DnaCommitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(Self::Automatic),
            "pending" => Ok(Self::Pending),
            "granted" => Ok(Self::Granted),
            other => Err(DnaCommitError::validation(format!("unknown approval '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Artifacts & commits
// ---------------------------------------------------------------------------

/// Reference to a stored generated artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub String);

impl ArtifactRef {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl Default for ArtifactRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One file produced by the generator, relative to the repository root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    pub path: String,
    pub contents: String,
}

/// Generated code change for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_ref: ArtifactRef,
    pub item_id: ItemId,
    pub files: Vec<ArtifactFile>,
    pub commit_message: String,
    #[serde(default)]
    pub summary: String,
}

/// Where an item's change landed on the automation branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub branch: String,
    pub commit: String,
    /// Branch head before the commit.
    pub parent: String,
    /// Revert commit created by a rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverted_by: Option<String>,
}

// ---------------------------------------------------------------------------
// KnowledgeItem
// ---------------------------------------------------------------------------

/// A unit of discovered information tracked through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: ItemId,
    pub source: Source,
    pub payload: Payload,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
    /// Failed attempts at the current stage.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_artifact_ref: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_notes: Option<ReviewNotes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_ref: Option<CommitRef>,
    #[serde(default)]
    pub approval: Approval,
    /// Reason recorded with the latest transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl KnowledgeItem {
    /// A freshly collected item.
    pub fn collected(candidate: RawCandidate, now: DateTime<Utc>) -> Self {
        Self {
            id: candidate.item_id(),
            source: candidate.source,
            payload: candidate.payload,
            status: Status::Collected,
            evaluation: None,
            attempts: 0,
            created_at: now,
            last_transition_at: now,
            generated_artifact_ref: None,
            review_notes: None,
            commit_ref: None,
            approval: Approval::Automatic,
            reason: None,
            deleted_at: None,
        }
    }

    /// Display label including the manual-approval substate.
    pub fn status_label(&self) -> String {
        if self.status == Status::ReviewPassed && self.approval == Approval::Pending {
            "review_passed (pending_manual_approval)".to_string()
        } else {
            self.status.to_string()
        }
    }

    /// Aggregate score recorded at evaluation time, if evaluated.
    pub fn aggregate_score(&self) -> Option<f64> {
        self.evaluation.map(|e| e.aggregate)
    }
}

// ---------------------------------------------------------------------------
// Transition audit log
// ---------------------------------------------------------------------------

/// Kind of audit entry written alongside a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Transition,
    Retry,
    Delete,
    Approval,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transition => "transition",
            Self::Retry => "retry",
            Self::Delete => "delete",
            Self::Approval => "approval",
        }
    }
}

/// One row of the per-item audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub item_id: ItemId,
    pub kind: TransitionKind,
    pub from: Status,
    pub to: Status,
    pub reason: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// RunRecord
// ---------------------------------------------------------------------------

/// UUID v7 run identifier (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Per-stage outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub accepted: u64,
    pub rejected: u64,
    pub retried: u64,
    pub errored: u64,
}

impl StageCounts {
    pub fn total(&self) -> u64 {
        self.accepted + self.rejected + self.retried
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Running,
    Completed,
    TimedOut,
    Aborted { reason: String },
}

/// Audit entry summarizing one orchestrator execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub stage_results: BTreeMap<Stage, StageCounts>,
    pub outcome: RunOutcome,
}

impl RunRecord {
    pub fn start(mode: RunMode, now: DateTime<Utc>) -> Self {
        Self {
            run_id: RunId::new(),
            mode,
            started_at: now,
            ended_at: None,
            stage_results: BTreeMap::new(),
            outcome: RunOutcome::Running,
        }
    }

    /// Counts for `stage`, zero if the stage did not run.
    pub fn counts(&self, stage: Stage) -> StageCounts {
        self.stage_results.get(&stage).copied().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// Live collection/acceptance parameters, versioned in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyParams {
    pub version: u32,
    pub keywords: Vec<String>,
    pub repo_topics: Vec<String>,
    pub acceptance_threshold: f64,
}

/// A proposed keyword edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "keyword", rename_all = "snake_case")]
pub enum KeywordChange {
    Add(String),
    Remove(String),
}

/// A proposed acceptance threshold move.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdChange {
    pub from: f64,
    pub to: f64,
}

/// Lifecycle of a strategy proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaStatus {
    Proposed,
    Applied,
    Dismissed,
}

impl DeltaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Applied => "applied",
            Self::Dismissed => "dismissed",
        }
    }
}

impl FromStr for DeltaStatus {
    type Err = DnaCommitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(Self::Proposed),
            "applied" => Ok(Self::Applied),
            "dismissed" => Ok(Self::Dismissed),
            other => Err(DnaCommitError::validation(format!(
                "unknown delta status '{other}'"
            ))),
        }
    }
}

/// A proposed, auditable change to collection/acceptance parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDelta {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Number of run records the proposal was computed from.
    pub window_runs: usize,
    /// committed / collected over the window, if anything was collected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_rate: Option<f64>,
    pub keyword_changes: Vec<KeywordChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_change: Option<ThresholdChange>,
    /// Most common rejection reasons with occurrence counts.
    #[serde(default)]
    pub rejection_reasons: Vec<(String, u64)>,
    #[serde(default)]
    pub rationale: Vec<String>,
    pub status: DeltaStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
}

impl StrategyDelta {
    pub fn is_empty(&self) -> bool {
        self.keyword_changes.is_empty() && self.threshold_change.is_none()
    }
}
