//! Pipeline Orchestrator: `collect → evaluate → generate → review → commit → cleanup`.
//!
//! Each stage pulls its eligible items from the store by status, calls the
//! matching collaborator, runs the result through the [`gate`](crate::gate)
//! and persists the transition with a compare-and-set. Per-item failures are
//! counted and never abort the run; only infrastructure failures do.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use dnacommit_capability::{
    Agents, CapabilityBackend, CollectParams, Collector, Evaluator, GenerationOutcome, Generator,
    Reviewer,
};
use dnacommit_shared::{
    Approval, ApprovalPolicy, DnaCommitError, GatePolicy, ItemId, KnowledgeItem, PipelineConfig, Result, RunMode,
    RunOutcome, RunRecord, Stage, StageCounts, Status, StrategyParams,
};
use dnacommit_storage::{ItemFilter, Storage, TransitionPatch};

use crate::commit::{CommitSafetyLayer, requires_manual_approval};
use crate::gate::{self, Decision, StageResult};
use crate::strategy;

/// Statuses cleanup may expire by age.
const NON_TERMINAL: [Status; 6] = [
    Status::Collected,
    Status::EvaluatedAccepted,
    Status::EvaluatedRejected,
    Status::CodeGenerated,
    Status::ReviewPassed,
    Status::ReviewFailed,
];

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a stage starts, with the number of eligible items.
    fn stage_started(&self, stage: Stage, eligible: usize);
    /// Called after each item is processed.
    fn item_finished(&self, stage: Stage, id: &ItemId, outcome: &str);
    /// Called when a stage completes.
    fn stage_finished(&self, stage: Stage, counts: &StageCounts);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage_started(&self, _stage: Stage, _eligible: usize) {}
    fn item_finished(&self, _stage: Stage, _id: &ItemId, _outcome: &str) {}
    fn stage_finished(&self, _stage: Stage, _counts: &StageCounts) {}
}

// ---------------------------------------------------------------------------
// Collaborators and results
// ---------------------------------------------------------------------------

/// The four external collaborators the pipeline calls.
#[derive(Clone)]
pub struct Collaborators {
    pub collector: Arc<dyn Collector>,
    pub evaluator: Arc<dyn Evaluator>,
    pub generator: Arc<dyn Generator>,
    pub reviewer: Arc<dyn Reviewer>,
}

impl Collaborators {
    /// All four collaborators served by one capability backend.
    pub fn from_backend(backend: Arc<dyn CapabilityBackend>) -> Self {
        let agents = Arc::new(Agents::new(backend));
        Self {
            collector: agents.clone(),
            evaluator: agents.clone(),
            generator: agents.clone(),
            reviewer: agents,
        }
    }
}

/// Result of [`Orchestrator::run_cycle`].
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub run: RunRecord,
    /// Transitions made by this run, keyed by resulting status.
    pub transitions: BTreeMap<Status, u64>,
    /// Item count per status after the run.
    pub totals: BTreeMap<Status, u64>,
}

impl CycleSummary {
    pub fn timed_out(&self) -> bool {
        self.run.outcome == RunOutcome::TimedOut
    }

    /// Number of status transitions the run made.
    pub fn transition_count(&self) -> u64 {
        self.transitions.values().sum()
    }
}

/// What happened to one item at one stage.
#[derive(Debug, Clone, PartialEq)]
enum ItemOutcome {
    Accepted(Status),
    Rejected(Status),
    Retried,
    /// The collaborator could not be reached; the item was left untouched.
    Unavailable(String),
}

impl ItemOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Accepted(_) => "accepted",
            Self::Rejected(_) => "rejected",
            Self::Retried => "retried",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// Running totals for one stage.
#[derive(Debug, Default)]
struct StageTally {
    counts: StageCounts,
    transitions: BTreeMap<Status, u64>,
    unavailable: u64,
    last_unavailable: Option<String>,
    timed_out: bool,
}

impl StageTally {
    fn moved(&mut self, to: Status, accepted: bool) {
        if accepted {
            self.counts.accepted += 1;
        } else {
            self.counts.rejected += 1;
        }
        *self.transitions.entry(to).or_default() += 1;
    }

    fn record(
        &mut self,
        stage: Stage,
        joined: std::result::Result<(ItemId, Result<ItemOutcome>), JoinError>,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        let (id, outcome) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                error!(%stage, error = %e, "item task failed");
                self.counts.errored += 1;
                return Ok(());
            }
        };
        match outcome {
            Ok(outcome) => {
                progress.item_finished(stage, &id, outcome.label());
                match outcome {
                    ItemOutcome::Accepted(to) => self.moved(to, true),
                    ItemOutcome::Rejected(to) => self.moved(to, false),
                    ItemOutcome::Retried => self.counts.retried += 1,
                    ItemOutcome::Unavailable(message) => {
                        self.counts.errored += 1;
                        self.unavailable += 1;
                        self.last_unavailable = Some(message);
                    }
                }
                Ok(())
            }
            Err(e) if e.is_infrastructure() => Err(e),
            Err(e) => {
                warn!(item_id = %id, %stage, error = %e, "item failed");
                progress.item_finished(stage, &id, "error");
                self.counts.errored += 1;
                Ok(())
            }
        }
    }

    /// Every processed item hit an unreachable collaborator.
    fn all_unavailable(&self) -> bool {
        self.unavailable > 0 && self.unavailable == self.counts.total() + self.counts.errored
    }
}

/// Collaborator error split by how the pipeline handles it.
enum CallError {
    Unavailable(String),
    Failed(String),
}

fn classify(e: DnaCommitError) -> Result<CallError> {
    match e {
        DnaCommitError::CollaboratorUnavailable { .. } => Ok(CallError::Unavailable(e.to_string())),
        e if e.is_infrastructure() => Err(e),
        e => Ok(CallError::Failed(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives pipeline runs against one store.
pub struct Orchestrator {
    store: Arc<Storage>,
    agents: Collaborators,
    committer: Arc<CommitSafetyLayer>,
    config: PipelineConfig,
    seed: StrategyParams,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Storage>,
        agents: Collaborators,
        committer: Arc<CommitSafetyLayer>,
        config: PipelineConfig,
        seed: StrategyParams,
    ) -> Self {
        Self {
            store,
            agents,
            committer,
            config,
            seed,
        }
    }

    pub fn store(&self) -> &Arc<Storage> {
        &self.store
    }

    pub fn committer(&self) -> &Arc<CommitSafetyLayer> {
        &self.committer
    }

    /// Execute the stages of `mode` in order.
    ///
    /// Per-item failures are recorded and counted; only infrastructure
    /// failures return `Err`. A run that exceeds the configured timeout stops
    /// after the current stage with outcome `timed_out`, leaving unfinished
    /// items in their last persisted status.
    #[instrument(skip_all, fields(mode = %mode))]
    pub async fn run_cycle(&self, mode: RunMode, progress: &dyn ProgressReporter) -> Result<CycleSummary> {
        let mut run = RunRecord::start(mode, Utc::now());
        self.store.insert_run(&run).await?;
        info!(run_id = %run.run_id, "run started");

        let deadline = Instant::now() + self.config.run_timeout;
        let mut transitions: BTreeMap<Status, u64> = BTreeMap::new();

        let outcome = async {
            let params = strategy::active_params(&self.store, &self.seed).await?;
            let gate = GatePolicy {
                acceptance_threshold: params.acceptance_threshold,
                ..self.config.gate
            };

            for &stage in mode.stages() {
                let tally = match stage {
                    Stage::Collect => self.collect(&params, deadline, progress).await?,
                    Stage::Evaluate => self.evaluate(gate, deadline, progress).await?,
                    Stage::Generate => self.generate(gate, deadline, progress).await?,
                    Stage::Review => self.review(gate, deadline, progress).await?,
                    Stage::Commit => self.commit(deadline, progress).await?,
                    Stage::Cleanup => self.cleanup(deadline, progress).await?,
                };

                info!(
                    %stage,
                    accepted = tally.counts.accepted,
                    rejected = tally.counts.rejected,
                    retried = tally.counts.retried,
                    errored = tally.counts.errored,
                    "stage finished"
                );
                progress.stage_finished(stage, &tally.counts);
                for (status, n) in &tally.transitions {
                    *transitions.entry(*status).or_default() += n;
                }
                run.stage_results.insert(stage, tally.counts);
                self.store.update_run(&run).await?;

                if tally.timed_out {
                    warn!(%stage, "run timeout reached, stopping");
                    return Ok(RunOutcome::TimedOut);
                }
            }
            Ok::<_, DnaCommitError>(RunOutcome::Completed)
        }
        .await;

        run.ended_at = Some(Utc::now());
        match outcome {
            Ok(outcome) => {
                run.outcome = outcome;
                self.store.update_run(&run).await?;
            }
            Err(e) => {
                error!(run_id = %run.run_id, error = %e, "run aborted");
                run.outcome = RunOutcome::Aborted {
                    reason: e.to_string(),
                };
                if let Err(store_err) = self.store.update_run(&run).await {
                    warn!(error = %store_err, "could not record aborted run");
                }
                return Err(e);
            }
        }

        let totals = self.store.count_by_status().await?;
        info!(run_id = %run.run_id, outcome = ?run.outcome, "run finished");
        Ok(CycleSummary {
            run,
            transitions,
            totals,
        })
    }

    /// Fan `work` out over `items` with bounded concurrency until `deadline`.
    async fn run_items<F, Fut>(
        &self,
        stage: Stage,
        items: Vec<KnowledgeItem>,
        deadline: Instant,
        progress: &dyn ProgressReporter,
        work: F,
    ) -> Result<StageTally>
    where
        F: Fn(KnowledgeItem) -> Fut,
        Fut: Future<Output = Result<ItemOutcome>> + Send + 'static,
    {
        progress.stage_started(stage, items.len());
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let mut tasks: JoinSet<(ItemId, Result<ItemOutcome>)> = JoinSet::new();
        let mut tally = StageTally::default();

        let drive = async {
            for item in items {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| DnaCommitError::Infrastructure(format!("worker pool closed: {e}")))?;
                let id = item.id.clone();
                let fut = work(item);
                tasks.spawn(async move {
                    let _permit = permit;
                    (id, fut.await)
                });
                while let Some(joined) = tasks.try_join_next() {
                    tally.record(stage, joined, progress)?;
                }
            }
            while let Some(joined) = tasks.join_next().await {
                tally.record(stage, joined, progress)?;
            }
            Ok::<_, DnaCommitError>(())
        };
        let driven = tokio::time::timeout_at(deadline, drive).await;

        match driven {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tasks.abort_all();
                return Err(e);
            }
            Err(_) => {
                // Finished tasks already saved their transition; count them.
                while let Some(joined) = tasks.try_join_next() {
                    tally.record(stage, joined, progress)?;
                }
                tasks.abort_all();
                tally.timed_out = true;
            }
        }

        if tally.all_unavailable() {
            return Err(DnaCommitError::Infrastructure(format!(
                "{stage} collaborator unavailable for every item: {}",
                tally.last_unavailable.as_deref().unwrap_or("unknown")
            )));
        }
        Ok(tally)
    }

    async fn eligible(&self, stage: Stage, limit: Option<usize>) -> Result<Vec<KnowledgeItem>> {
        let Some(status) = gate::eligible_status(stage) else {
            return Ok(Vec::new());
        };
        let mut filter = ItemFilter::statuses(&[status]);
        if let Some(limit) = limit {
            filter = filter.limit(limit);
        }
        self.store.list(&filter).await
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(stage = "collect"))]
    async fn collect(
        &self,
        params: &StrategyParams,
        deadline: Instant,
        progress: &dyn ProgressReporter,
    ) -> Result<StageTally> {
        let mut tally = StageTally::default();
        progress.stage_started(Stage::Collect, 0);
        let request = CollectParams {
            keywords: params.keywords.clone(),
            repo_topics: params.repo_topics.clone(),
            results_per_query: self.config.results_per_query,
        };

        let candidates = match tokio::time::timeout_at(deadline, self.agents.collector.collect(&request)).await {
            Err(_) => {
                tally.timed_out = true;
                return Ok(tally);
            }
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => match classify(e)? {
                CallError::Unavailable(message) => {
                    return Err(DnaCommitError::Infrastructure(format!(
                        "collector unavailable: {message}"
                    )));
                }
                CallError::Failed(message) => {
                    warn!(error = %message, "collection failed");
                    tally.counts.errored += 1;
                    return Ok(tally);
                }
            },
        };

        let now = Utc::now();
        let mut seen: HashSet<ItemId> = HashSet::new();
        for candidate in candidates {
            let item = KnowledgeItem::collected(candidate, now);
            if !seen.insert(item.id.clone()) {
                tally.counts.rejected += 1;
                continue;
            }
            match self.store.put(&item).await {
                Ok(()) => {
                    debug!(item_id = %item.id, title = %item.payload.title, "collected");
                    progress.item_finished(Stage::Collect, &item.id, "accepted");
                    tally.counts.accepted += 1;
                    *tally.transitions.entry(Status::Collected).or_default() += 1;
                }
                Err(DnaCommitError::DuplicateItem { id }) => {
                    debug!(item_id = %id, "already known, skipping");
                    tally.counts.rejected += 1;
                }
                Err(e) if e.is_infrastructure() => return Err(e),
                Err(e) => {
                    warn!(item_id = %item.id, error = %e, "could not store candidate");
                    tally.counts.errored += 1;
                }
            }
        }
        Ok(tally)
    }

    #[instrument(skip_all, fields(stage = "evaluate"))]
    async fn evaluate(&self, gate: GatePolicy, deadline: Instant, progress: &dyn ProgressReporter) -> Result<StageTally> {
        let items = self.eligible(Stage::Evaluate, None).await?;
        let store = self.store.clone();
        let evaluator = self.agents.evaluator.clone();
        self.run_items(Stage::Evaluate, items, deadline, progress, move |item| {
            evaluate_item(store.clone(), evaluator.clone(), gate, item)
        })
        .await
    }

    #[instrument(skip_all, fields(stage = "generate"))]
    async fn generate(&self, gate: GatePolicy, deadline: Instant, progress: &dyn ProgressReporter) -> Result<StageTally> {
        let items = self
            .eligible(Stage::Generate, Some(self.config.generate_batch))
            .await?;
        let store = self.store.clone();
        let generator = self.agents.generator.clone();
        self.run_items(Stage::Generate, items, deadline, progress, move |item| {
            generate_item(store.clone(), generator.clone(), gate, item)
        })
        .await
    }

    #[instrument(skip_all, fields(stage = "review"))]
    async fn review(&self, gate: GatePolicy, deadline: Instant, progress: &dyn ProgressReporter) -> Result<StageTally> {
        let items = self.eligible(Stage::Review, None).await?;
        let store = self.store.clone();
        let reviewer = self.agents.reviewer.clone();
        let approval = self.config.approval;
        self.run_items(Stage::Review, items, deadline, progress, move |item| {
            review_item(store.clone(), reviewer.clone(), gate, approval, item)
        })
        .await
    }

    /// Commits run one at a time and are never cut off mid-write.
    #[instrument(skip_all, fields(stage = "commit"))]
    async fn commit(&self, deadline: Instant, progress: &dyn ProgressReporter) -> Result<StageTally> {
        let mut tally = StageTally::default();
        let ready: Vec<KnowledgeItem> = self.eligible(Stage::Commit, None).await?;
        let pending = ready.iter().filter(|i| i.approval == Approval::Pending).count();
        if pending > 0 {
            info!(pending, "items awaiting manual approval");
        }
        let items: Vec<KnowledgeItem> = ready
            .into_iter()
            .filter(|i| i.approval != Approval::Pending)
            .take(self.config.commit_batch)
            .collect();
        progress.stage_started(Stage::Commit, items.len());
        if items.is_empty() {
            return Ok(tally);
        }

        self.committer.prepare().await.map_err(|e| match e {
            e if e.is_infrastructure() => e,
            e => DnaCommitError::Infrastructure(format!("cannot prepare automation branch: {e}")),
        })?;

        for item in items {
            if Instant::now() >= deadline {
                tally.timed_out = true;
                break;
            }
            match self.committer.commit(&item.id).await {
                Ok(_) => {
                    progress.item_finished(Stage::Commit, &item.id, "accepted");
                    tally.moved(Status::Committed, true);
                }
                Err(e @ DnaCommitError::TrunkWriteForbidden { .. }) => return Err(e),
                Err(e) if e.is_infrastructure() => return Err(e),
                Err(e) => {
                    let now = self.store.get(&item.id).await?.map(|i| i.status);
                    if now == Some(Status::ReviewFailed) {
                        progress.item_finished(Stage::Commit, &item.id, "rejected");
                        tally.moved(Status::ReviewFailed, false);
                    } else {
                        warn!(item_id = %item.id, error = %e, "commit skipped");
                        progress.item_finished(Stage::Commit, &item.id, "error");
                        tally.counts.errored += 1;
                    }
                }
            }
        }
        Ok(tally)
    }

    /// Soft-delete stale items and useless sinks.
    #[instrument(skip_all, fields(stage = "cleanup"))]
    async fn cleanup(&self, deadline: Instant, progress: &dyn ProgressReporter) -> Result<StageTally> {
        let mut tally = StageTally::default();
        let retention = self.config.retention;
        let stale = self
            .store
            .list(&ItemFilter::statuses(&NON_TERMINAL).older_than(retention))
            .await?;
        let sinks: Vec<KnowledgeItem> = self
            .store
            .list(&ItemFilter::statuses(&[Status::EvaluatedRejected, Status::ReviewFailed]))
            .await?
            .into_iter()
            .filter(|i| {
                i.aggregate_score()
                    .is_none_or(|score| score < self.config.min_usefulness)
            })
            .collect();
        progress.stage_started(Stage::Cleanup, stale.len() + sinks.len());

        let stale_reason = format!("stale: older than {} days", retention.num_days());
        let mut targets: Vec<(ItemId, String)> = stale
            .into_iter()
            .map(|i| (i.id, stale_reason.clone()))
            .collect();
        for item in sinks {
            if targets.iter().any(|(id, _)| *id == item.id) {
                continue;
            }
            let reason = match item.aggregate_score() {
                Some(score) => format!(
                    "low_score: aggregate {score:.2} below {:.2}",
                    self.config.min_usefulness
                ),
                None => "low_score: never scored".to_string(),
            };
            targets.push((item.id, reason));
        }

        for (id, reason) in targets {
            if Instant::now() >= deadline {
                tally.timed_out = true;
                break;
            }
            match self.store.soft_delete(&id, &reason).await {
                Ok(true) => {
                    progress.item_finished(Stage::Cleanup, &id, "deleted");
                    tally.moved(Status::Deleted, true);
                }
                Ok(false) => {}
                Err(e) if e.is_infrastructure() => return Err(e),
                Err(e) => {
                    warn!(item_id = %id, error = %e, "cleanup skipped item");
                    tally.counts.errored += 1;
                }
            }
        }
        Ok(tally)
    }
}

// ---------------------------------------------------------------------------
// Per-item work
// ---------------------------------------------------------------------------

/// Persist the gate's decision for `item`.
async fn apply_decision(
    store: &Storage,
    item: &KnowledgeItem,
    stage: Stage,
    decision: Decision,
    reason: &str,
    patch: TransitionPatch,
) -> Result<ItemOutcome> {
    match gate::target_status(stage, decision) {
        None => {
            store.record_retry(&item.id, item.status, reason).await?;
            Ok(ItemOutcome::Retried)
        }
        Some(to) => {
            store
                .update_status_from(&item.id, item.status, to, reason, patch)
                .await?;
            if decision == Decision::Accept {
                Ok(ItemOutcome::Accepted(to))
            } else {
                Ok(ItemOutcome::Rejected(to))
            }
        }
    }
}

fn failure_reason(stage: Stage, item: &KnowledgeItem, decision: Decision, gate: &GatePolicy, message: &str) -> String {
    let cap = gate::attempt_cap(stage, gate);
    match decision {
        Decision::Retry => format!(
            "{stage} failed (attempt {}/{cap}): {message}",
            item.attempts + 1
        ),
        _ => format!("{stage} failed after {cap} attempt(s): {message}"),
    }
}

async fn evaluate_item(
    store: Arc<Storage>,
    evaluator: Arc<dyn Evaluator>,
    gate: GatePolicy,
    item: KnowledgeItem,
) -> Result<ItemOutcome> {
    let stage = Stage::Evaluate;
    match evaluator.evaluate(&item.payload).await {
        Ok(scores) => {
            let evaluation = gate::evaluate_scores(&scores, &gate);
            let decision = gate::decide(&item, stage, &StageResult::Evaluated(evaluation), &gate);
            let verdict = if evaluation.accepted { "above" } else { "not above" };
            let mut reason = format!(
                "aggregate {:.3} {verdict} threshold {:.3}",
                evaluation.aggregate, evaluation.threshold
            );
            if !evaluation.accepted {
                reason.push_str(&format!(" (weakest: {})", scores.weakest()));
            }
            let patch = TransitionPatch {
                evaluation: Some(evaluation),
                ..TransitionPatch::default()
            };
            apply_decision(&store, &item, stage, decision, &reason, patch).await
        }
        Err(e) => match classify(e)? {
            CallError::Unavailable(message) => Ok(ItemOutcome::Unavailable(message)),
            CallError::Failed(message) => {
                let decision = gate::decide(&item, stage, &StageResult::Failed, &gate);
                let reason = failure_reason(stage, &item, decision, &gate, &message);
                apply_decision(&store, &item, stage, decision, &reason, TransitionPatch::default()).await
            }
        },
    }
}

async fn generate_item(
    store: Arc<Storage>,
    generator: Arc<dyn Generator>,
    gate: GatePolicy,
    item: KnowledgeItem,
) -> Result<ItemOutcome> {
    let stage = Stage::Generate;
    let message = match generator.generate(&item).await {
        Ok(GenerationOutcome::Artifact(mut artifact)) => {
            artifact.item_id = item.id.clone();
            store.put_artifact(&artifact).await?;
            let reason = format!(
                "generated {} file(s): {}",
                artifact.files.len(),
                artifact.commit_message.lines().next().unwrap_or_default()
            );
            let patch = TransitionPatch {
                artifact_ref: Some(artifact.artifact_ref.clone()),
                ..TransitionPatch::default()
            };
            let decision = gate::decide(&item, stage, &StageResult::Generated, &gate);
            return apply_decision(&store, &item, stage, decision, &reason, patch).await;
        }
        Ok(GenerationOutcome::Failure(message)) => message,
        Err(e) => match classify(e)? {
            CallError::Unavailable(message) => return Ok(ItemOutcome::Unavailable(message)),
            CallError::Failed(message) => message,
        },
    };

    let decision = gate::decide(&item, stage, &StageResult::Failed, &gate);
    let reason = failure_reason(stage, &item, decision, &gate, &message);
    apply_decision(&store, &item, stage, decision, &reason, TransitionPatch::default()).await
}

async fn review_item(
    store: Arc<Storage>,
    reviewer: Arc<dyn Reviewer>,
    gate: GatePolicy,
    approval: ApprovalPolicy,
    item: KnowledgeItem,
) -> Result<ItemOutcome> {
    let stage = Stage::Review;
    let artifact = match &item.generated_artifact_ref {
        Some(artifact_ref) => store.get_artifact(artifact_ref).await?,
        None => None,
    };
    let Some(artifact) = artifact else {
        let decision = gate::decide(&item, stage, &StageResult::Failed, &gate);
        let reason = failure_reason(stage, &item, decision, &gate, "generated artifact is missing");
        return apply_decision(&store, &item, stage, decision, &reason, TransitionPatch::default()).await;
    };

    let notes = match reviewer.review(&artifact).await {
        Ok(notes) => notes,
        Err(e) => {
            return match classify(e)? {
                CallError::Unavailable(message) => Ok(ItemOutcome::Unavailable(message)),
                CallError::Failed(message) => {
                    let decision = gate::decide(&item, stage, &StageResult::Failed, &gate);
                    let reason = failure_reason(stage, &item, decision, &gate, &message);
                    apply_decision(&store, &item, stage, decision, &reason, TransitionPatch::default())
                        .await
                }
            };
        }
    };

    let decision = gate::decide(&item, stage, &StageResult::Reviewed { passed: notes.passed }, &gate);
    let (reason, patch) = match decision {
        Decision::Accept => {
            let manual = requires_manual_approval(&notes, &approval);
            let reason = if manual {
                format!("review passed ({:.2}), pending manual approval", notes.confidence)
            } else {
                format!("review passed ({:.2})", notes.confidence)
            };
            let patch = TransitionPatch {
                approval: Some(if manual { Approval::Pending } else { Approval::Automatic }),
                review_notes: Some(notes),
                ..TransitionPatch::default()
            };
            (reason, patch)
        }
        Decision::Reject => {
            let reason = failure_reason(stage, &item, decision, &gate, &notes.summary);
            let patch = TransitionPatch {
                review_notes: Some(notes),
                ..TransitionPatch::default()
            };
            (reason, patch)
        }
        Decision::Retry => (
            failure_reason(stage, &item, decision, &gate, &notes.summary),
            TransitionPatch::default(),
        ),
    };
    apply_decision(&store, &item, stage, decision, &reason, patch).await
}
