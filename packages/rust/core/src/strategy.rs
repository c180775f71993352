//! Adaptive Strategy Module.
//!
//! Reads the trailing window of run records and the items collected in it,
//! then proposes a [`StrategyDelta`]. Proposals are persisted as data and only
//! change the live [`StrategyParams`] through an explicit [`apply`] step.
//!
//! [`apply`]: AdaptiveStrategy::apply

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};
use uuid::Uuid;

use dnacommit_shared::{
    DeltaStatus, DnaCommitError, KeywordChange, KnowledgeItem, Result, RunRecord, Severity, Stage,
    StrategyDelta, StrategyParams, StrategyPolicy, ThresholdChange,
};
use dnacommit_storage::{ItemFilter, Storage};

/// Keywords need this many evaluated items before they can be replaced.
const MIN_KEYWORD_SAMPLES: u64 = 3;

/// Replacement keywords proposed per delta.
const MAX_KEYWORD_SWAPS: usize = 2;

const TOP_REASONS: usize = 5;

/// Acceptance counts for one search keyword.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeywordStats {
    pub evaluated: u64,
    pub accepted: u64,
}

impl KeywordStats {
    pub fn rate(&self) -> f64 {
        if self.evaluated == 0 {
            0.0
        } else {
            self.accepted as f64 / self.evaluated as f64
        }
    }
}

/// Strategy proposals over a store.
pub struct AdaptiveStrategy {
    store: Arc<Storage>,
    policy: StrategyPolicy,
    seed: StrategyParams,
}

impl AdaptiveStrategy {
    pub fn new(store: Arc<Storage>, policy: StrategyPolicy, seed: StrategyParams) -> Self {
        Self {
            store,
            policy,
            seed,
        }
    }

    /// Live parameters; the seed is stored as version 1 on first use.
    pub async fn active_params(&self) -> Result<StrategyParams> {
        active_params(&self.store, &self.seed).await
    }

    /// Configured number of trailing runs a proposal looks at.
    pub fn window_runs(&self) -> usize {
        self.policy.window_runs
    }

    /// Compute and persist a proposal over the last `window_runs` runs.
    ///
    /// A proposal without changes is returned but not stored.
    #[instrument(skip_all, fields(window = window_runs))]
    pub async fn propose_adjustments(&self, window_runs: usize) -> Result<StrategyDelta> {
        if window_runs == 0 {
            return Err(DnaCommitError::validation("strategy window must cover at least one run"));
        }
        let runs = self.store.list_runs(window_runs).await?;
        let params = self.active_params().await?;
        let now = Utc::now();

        let items = match runs.iter().map(|r| r.started_at).min() {
            Some(since) => {
                let filter = ItemFilter::default().max_age(now - since).include_deleted();
                self.store.list(&filter).await?
            }
            None => Vec::new(),
        };

        let delta = compute_delta(&runs, &items, &params, &self.policy, now);
        if delta.is_empty() {
            info!(rationale = ?delta.rationale, "no strategy adjustment proposed");
        } else {
            self.store.insert_delta(&delta).await?;
            info!(
                delta_id = %delta.id,
                rate = ?delta.acceptance_rate,
                keyword_changes = delta.keyword_changes.len(),
                threshold = ?delta.threshold_change,
                "strategy delta proposed"
            );
        }
        Ok(delta)
    }

    /// Apply a proposed delta, producing the next parameter version.
    #[instrument(skip_all, fields(delta_id = %id))]
    pub async fn apply(&self, id: Uuid) -> Result<StrategyParams> {
        let delta = self.proposed(id).await?;
        let current = self.active_params().await?;
        let next = next_params(&current, &delta)?;
        self.store.apply_delta(&delta, &next).await?;
        info!(
            version = next.version,
            threshold = next.acceptance_threshold,
            keywords = ?next.keywords,
            "strategy updated"
        );
        Ok(next)
    }

    pub async fn dismiss(&self, id: Uuid) -> Result<StrategyDelta> {
        let delta = self.proposed(id).await?;
        self.store.dismiss_delta(&delta).await?;
        info!(delta_id = %id, "strategy delta dismissed");
        self.store
            .get_delta(id)
            .await?
            .ok_or_else(|| DnaCommitError::NotFound { id: id.to_string() })
    }

    pub async fn list(&self, status: Option<DeltaStatus>) -> Result<Vec<StrategyDelta>> {
        self.store.list_deltas(status).await
    }

    async fn proposed(&self, id: Uuid) -> Result<StrategyDelta> {
        let delta = self
            .store
            .get_delta(id)
            .await?
            .ok_or_else(|| DnaCommitError::NotFound { id: id.to_string() })?;
        if delta.status != DeltaStatus::Proposed {
            return Err(DnaCommitError::validation(format!(
                "delta {id} is already {}",
                delta.status.as_str()
            )));
        }
        Ok(delta)
    }
}

/// Current stored parameters, seeding the store on first use.
pub async fn active_params(store: &Storage, seed: &StrategyParams) -> Result<StrategyParams> {
    match store.current_strategy().await? {
        Some(params) => Ok(params),
        None => {
            store.save_strategy(seed).await?;
            info!(version = seed.version, "seeded strategy parameters");
            Ok(seed.clone())
        }
    }
}

/// Per-keyword acceptance among evaluated items.
pub fn keyword_stats(items: &[KnowledgeItem]) -> BTreeMap<String, KeywordStats> {
    let mut stats: BTreeMap<String, KeywordStats> = BTreeMap::new();
    for item in items {
        let (Some(query), Some(evaluation)) = (&item.payload.query, item.evaluation) else {
            continue;
        };
        let entry = stats.entry(query.clone()).or_default();
        entry.evaluated += 1;
        if evaluation.accepted {
            entry.accepted += 1;
        }
    }
    stats
}

/// Most common rejection reasons: weakest metric of rejected evaluations and
/// major findings of failed reviews.
pub fn rejection_reasons(items: &[KnowledgeItem]) -> Vec<(String, u64)> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for item in items {
        if let Some(evaluation) = item.evaluation {
            if !evaluation.accepted {
                *counts
                    .entry(format!("low {}", evaluation.scores.weakest()))
                    .or_default() += 1;
            }
        }
        if let Some(notes) = &item.review_notes {
            if notes.passed {
                continue;
            }
            let mut any = false;
            for finding in notes.findings.iter().filter(|f| f.severity >= Severity::Major) {
                let text: String = finding.description.chars().take(80).collect();
                *counts.entry(format!("review: {text}")).or_default() += 1;
                any = true;
            }
            if !any {
                *counts.entry("review failed".to_string()).or_default() += 1;
            }
        }
    }

    let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(TOP_REASONS);
    ranked
}

fn round(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Pure proposal computation.
pub fn compute_delta(
    runs: &[RunRecord],
    items: &[KnowledgeItem],
    params: &StrategyParams,
    policy: &StrategyPolicy,
    now: DateTime<Utc>,
) -> StrategyDelta {
    let collected: u64 = runs.iter().map(|r| r.counts(Stage::Collect).accepted).sum();
    let committed: u64 = runs.iter().map(|r| r.counts(Stage::Commit).accepted).sum();

    let mut delta = StrategyDelta {
        id: Uuid::now_v7(),
        created_at: now,
        window_runs: runs.len(),
        acceptance_rate: (collected > 0).then(|| committed as f64 / collected as f64),
        keyword_changes: Vec::new(),
        threshold_change: None,
        rejection_reasons: rejection_reasons(items),
        rationale: Vec::new(),
        status: DeltaStatus::Proposed,
        applied_at: None,
    };

    if collected < policy.min_samples {
        delta.rationale.push(format!(
            "only {collected} items collected over {} runs (need {})",
            runs.len(),
            policy.min_samples
        ));
        return delta;
    }
    let rate = committed as f64 / collected as f64;
    let threshold = params.acceptance_threshold;

    if rate < policy.floor {
        delta.rationale.push(format!(
            "acceptance rate {rate:.2} below floor {:.2}",
            policy.floor
        ));
        let lowered = round((threshold - policy.threshold_step).max(policy.threshold_min));
        if lowered < threshold {
            delta.threshold_change = Some(ThresholdChange {
                from: threshold,
                to: lowered,
            });
            delta
                .rationale
                .push(format!("lower acceptance threshold to {lowered:.2}"));
        }

        let stats = keyword_stats(items);
        let mut weak: Vec<(&String, KeywordStats)> = params
            .keywords
            .iter()
            .filter_map(|k| stats.get(k).map(|s| (k, *s)))
            .filter(|(_, s)| s.evaluated >= MIN_KEYWORD_SAMPLES && s.rate() < policy.floor)
            .collect();
        weak.sort_by(|a, b| a.1.rate().total_cmp(&b.1.rate()).then_with(|| a.0.cmp(b.0)));

        let in_use: BTreeSet<&String> = params.keywords.iter().collect();
        let reserve = policy.reserve_keywords.iter().filter(|k| !in_use.contains(k));
        for ((keyword, s), replacement) in weak.into_iter().zip(reserve).take(MAX_KEYWORD_SWAPS) {
            delta
                .keyword_changes
                .push(KeywordChange::Remove(keyword.clone()));
            delta
                .keyword_changes
                .push(KeywordChange::Add(replacement.clone()));
            delta.rationale.push(format!(
                "replace '{keyword}' ({}/{} accepted) with '{replacement}'",
                s.accepted, s.evaluated
            ));
        }
    } else if rate > policy.ceiling {
        delta.rationale.push(format!(
            "acceptance rate {rate:.2} above ceiling {:.2}",
            policy.ceiling
        ));
        let raised = round((threshold + policy.threshold_step).min(policy.threshold_max));
        if raised > threshold {
            delta.threshold_change = Some(ThresholdChange {
                from: threshold,
                to: raised,
            });
            delta
                .rationale
                .push(format!("raise acceptance threshold to {raised:.2}"));
        }
    } else {
        delta.rationale.push(format!(
            "acceptance rate {rate:.2} within [{:.2}, {:.2}]",
            policy.floor, policy.ceiling
        ));
    }

    delta
}

/// Parameters after applying `delta` to `current`.
pub fn next_params(current: &StrategyParams, delta: &StrategyDelta) -> Result<StrategyParams> {
    let mut next = current.clone();
    next.version = current.version + 1;

    if let Some(change) = delta.threshold_change {
        if (current.acceptance_threshold - change.from).abs() > 1e-9 {
            return Err(DnaCommitError::validation(format!(
                "delta {} expects threshold {:.2} but the live value is {:.2}",
                delta.id, change.from, current.acceptance_threshold
            )));
        }
        next.acceptance_threshold = change.to;
    }

    for change in &delta.keyword_changes {
        match change {
            KeywordChange::Remove(k) => next.keywords.retain(|existing| existing != k),
            KeywordChange::Add(k) => {
                if !next.keywords.contains(k) {
                    next.keywords.push(k.clone());
                }
            }
        }
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnacommit_shared::{
        Evaluation, Payload, RawCandidate, RunMode, Scores, Source, StageCounts,
    };

    fn policy() -> StrategyPolicy {
        StrategyPolicy {
            reserve_keywords: vec!["edge tts".into(), "whisper.cpp".into()],
            floor: 0.2,
            ceiling: 0.6,
            threshold_step: 0.05,
            threshold_min: 0.5,
            threshold_max: 0.9,
            window_runs: 14,
            min_samples: 10,
        }
    }

    fn params() -> StrategyParams {
        StrategyParams {
            version: 1,
            keywords: vec!["raspberry pi voice".into(), "realtime api".into()],
            repo_topics: vec!["webrtc".into()],
            acceptance_threshold: 0.7,
        }
    }

    fn run(collected: u64, committed: u64) -> RunRecord {
        let mut run = RunRecord::start(RunMode::Full, Utc::now());
        run.stage_results.insert(
            Stage::Collect,
            StageCounts {
                accepted: collected,
                ..StageCounts::default()
            },
        );
        run.stage_results.insert(
            Stage::Commit,
            StageCounts {
                accepted: committed,
                ..StageCounts::default()
            },
        );
        run
    }

    fn evaluated(query: &str, n: usize, accepted: bool) -> KnowledgeItem {
        let mut item = KnowledgeItem::collected(
            RawCandidate {
                source: Source::WebSearch,
                payload: Payload {
                    title: format!("{query} {n}"),
                    locator: format!("https://example.com/{query}/{n}"),
                    content: String::new(),
                    query: Some(query.into()),
                    metadata: serde_json::Value::Null,
                },
            },
            Utc::now(),
        );
        item.evaluation = Some(Evaluation {
            scores: Scores {
                quality: 0.8,
                relevance: 0.8,
                novelty: if accepted { 0.8 } else { 0.1 },
                utility: 0.8,
            },
            aggregate: if accepted { 0.8 } else { 0.625 },
            threshold: 0.7,
            accepted,
        });
        item
    }

    #[test]
    fn too_few_samples_proposes_nothing() {
        let delta = compute_delta(&[run(3, 0)], &[], &params(), &policy(), Utc::now());
        assert!(delta.is_empty());
        assert_eq!(delta.acceptance_rate, Some(0.0));
    }

    #[test]
    fn low_acceptance_lowers_threshold_and_swaps_keywords() {
        let items: Vec<_> = (0..4)
            .map(|n| evaluated("realtime api", n, false))
            .chain((0..4).map(|n| evaluated("raspberry pi voice", n, true)))
            .collect();
        let delta = compute_delta(&[run(20, 1), run(10, 1)], &items, &params(), &policy(), Utc::now());

        let change = delta.threshold_change.unwrap();
        assert!((change.to - 0.65).abs() < 1e-9);
        assert_eq!(
            delta.keyword_changes,
            vec![
                KeywordChange::Remove("realtime api".into()),
                KeywordChange::Add("edge tts".into()),
            ]
        );
        assert_eq!(delta.rejection_reasons[0], ("low novelty".to_string(), 4));
    }

    #[test]
    fn high_acceptance_raises_threshold_within_bounds() {
        let mut p = params();
        p.acceptance_threshold = 0.88;
        let delta = compute_delta(&[run(10, 8)], &[], &p, &policy(), Utc::now());
        assert!((delta.threshold_change.unwrap().to - 0.9).abs() < 1e-9);

        p.acceptance_threshold = 0.9;
        let delta = compute_delta(&[run(10, 8)], &[], &p, &policy(), Utc::now());
        assert!(delta.is_empty());
    }

    #[test]
    fn applying_bumps_version_and_rejects_stale_threshold() {
        let items: Vec<_> = (0..3).map(|n| evaluated("realtime api", n, false)).collect();
        let delta = compute_delta(&[run(20, 0)], &items, &params(), &policy(), Utc::now());

        let next = next_params(&params(), &delta).unwrap();
        assert_eq!(next.version, 2);
        assert!(next.keywords.contains(&"edge tts".to_string()));
        assert!(!next.keywords.contains(&"realtime api".to_string()));

        let mut moved = params();
        moved.acceptance_threshold = 0.8;
        assert!(next_params(&moved, &delta).is_err());
    }

    #[tokio::test]
    async fn propose_apply_dismiss_roundtrip() {
        let path = std::env::temp_dir().join(format!("dna_strategy_{}.db", Uuid::now_v7()));
        let store = Arc::new(Storage::open(&path).await.unwrap());
        for _ in 0..3 {
            let mut r = run(5, 0);
            r.ended_at = Some(Utc::now());
            store.insert_run(&r).await.unwrap();
        }
        let strategy = AdaptiveStrategy::new(store.clone(), policy(), params());

        let delta = strategy.propose_adjustments(strategy.window_runs()).await.unwrap();
        assert!(delta.threshold_change.is_some());
        assert_eq!(strategy.list(Some(DeltaStatus::Proposed)).await.unwrap().len(), 1);

        let next = strategy.apply(delta.id).await.unwrap();
        assert_eq!(next.version, 2);
        assert_eq!(strategy.active_params().await.unwrap(), next);
        assert!(strategy.apply(delta.id).await.is_err());
        assert!(strategy.dismiss(delta.id).await.is_err());

        let second = strategy.propose_adjustments(strategy.window_runs()).await.unwrap();
        let dismissed = strategy.dismiss(second.id).await.unwrap();
        assert_eq!(dismissed.status, DeltaStatus::Dismissed);
        assert_eq!(strategy.active_params().await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn window_limits_runs_considered() {
        let path = std::env::temp_dir().join(format!("dna_strategy_{}.db", Uuid::now_v7()));
        let store = Arc::new(Storage::open(&path).await.unwrap());
        for _ in 0..3 {
            let mut r = run(5, 0);
            r.ended_at = Some(Utc::now());
            store.insert_run(&r).await.unwrap();
        }
        let strategy = AdaptiveStrategy::new(store, policy(), params());

        let narrow = strategy.propose_adjustments(1).await.unwrap();
        assert_eq!(narrow.window_runs, 1);
        let wide = strategy.propose_adjustments(10).await.unwrap();
        assert_eq!(wide.window_runs, 3);
        assert!(matches!(
            strategy.propose_adjustments(0).await,
            Err(DnaCommitError::Validation { .. })
        ));
    }
}
