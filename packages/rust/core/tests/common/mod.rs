//! Scripted collaborators and a harness over a temp store and in-memory VCS.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use dnacommit_capability::{
    CollectParams, Collector, Evaluator, GenerationOutcome, Generator, Reviewer,
};
use dnacommit_core::{Collaborators, CommitSafetyLayer, Orchestrator};
use dnacommit_shared::{
    Artifact, ArtifactFile, ArtifactRef, DnaCommitError, KnowledgeItem, Payload, PipelineConfig,
    RawCandidate, Result, ReviewNotes, Scores, Source, Stage, StrategyParams,
};
use dnacommit_storage::Storage;
use dnacommit_vcs::{MemoryVcs, TrunkGuard};

pub const BRANCH: &str = "dna-auto/evolution";

pub fn candidate(locator: &str) -> RawCandidate {
    RawCandidate {
        source: Source::WebSearch,
        payload: Payload {
            title: format!("Article at {locator}"),
            locator: locator.to_string(),
            content: "body".into(),
            query: Some("raspberry pi voice".into()),
            metadata: serde_json::Value::Null,
        },
    }
}

pub fn scores(q: f64, r: f64, n: f64, u: f64) -> Scores {
    Scores {
        quality: q,
        relevance: r,
        novelty: n,
        utility: u,
    }
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeCollector {
    pub candidates: Mutex<Vec<RawCandidate>>,
    pub unavailable: bool,
}

impl FakeCollector {
    pub fn with(candidates: Vec<RawCandidate>) -> Self {
        Self {
            candidates: Mutex::new(candidates),
            unavailable: false,
        }
    }
}

#[async_trait]
impl Collector for FakeCollector {
    async fn collect(&self, _params: &CollectParams) -> Result<Vec<RawCandidate>> {
        if self.unavailable {
            return Err(DnaCommitError::unavailable(Stage::Collect, "connection refused"));
        }
        Ok(self.candidates.lock().unwrap().clone())
    }
}

/// Scores by locator; unknown locators get `default`.
///
/// Tracks how many calls are in flight at once.
pub struct FakeEvaluator {
    pub by_locator: HashMap<String, Scores>,
    pub default: Scores,
    pub unavailable: bool,
    pub delay: Option<Duration>,
    /// Per-locator delay, overriding `delay`.
    pub slow: HashMap<String, Duration>,
    /// Locators whose call fails with a collaborator error.
    pub failing: HashSet<String>,
    pub in_flight: AtomicUsize,
    pub peak: AtomicUsize,
}

impl FakeEvaluator {
    pub fn uniform(scores: Scores) -> Self {
        Self {
            by_locator: HashMap::new(),
            default: scores,
            unavailable: false,
            delay: None,
            slow: HashMap::new(),
            failing: HashSet::new(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Evaluator for FakeEvaluator {
    async fn evaluate(&self, payload: &Payload) -> Result<Scores> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = self.slow.get(&payload.locator).copied().or(self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(DnaCommitError::unavailable(Stage::Evaluate, "bridge exited"));
        }
        if self.failing.contains(&payload.locator) {
            return Err(DnaCommitError::collaborator(Stage::Evaluate, "malformed score reply"));
        }
        Ok(self
            .by_locator
            .get(&payload.locator)
            .copied()
            .unwrap_or(self.default))
    }
}

/// Writes one file per item, named after the item id, unless told to fail.
#[derive(Default)]
pub struct FakeGenerator {
    pub fail: bool,
    pub files: HashMap<String, String>,
    pub calls: AtomicUsize,
}

impl FakeGenerator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(&self, item: &KnowledgeItem) -> Result<GenerationOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Ok(GenerationOutcome::Failure("model produced no diff".into()));
        }
        let path = self
            .files
            .get(&item.payload.locator)
            .cloned()
            .unwrap_or_else(|| format!("knowledge/{}.md", item.id));
        Ok(GenerationOutcome::Artifact(Artifact {
            artifact_ref: ArtifactRef::new(),
            item_id: item.id.clone(),
            files: vec![ArtifactFile {
                path,
                contents: format!("# {}\n", item.payload.title),
            }],
            commit_message: format!("Apply {}", item.payload.title),
            summary: String::new(),
        }))
    }
}

pub struct FakeReviewer {
    pub passed: bool,
    pub confidence: f64,
}

impl Default for FakeReviewer {
    fn default() -> Self {
        Self {
            passed: true,
            confidence: 0.9,
        }
    }
}

#[async_trait]
impl Reviewer for FakeReviewer {
    async fn review(&self, _artifact: &Artifact) -> Result<ReviewNotes> {
        Ok(ReviewNotes {
            passed: self.passed,
            confidence: self.confidence,
            findings: vec![],
            summary: if self.passed { "ok".into() } else { "unsafe change".into() },
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<Storage>,
    pub vcs: Arc<MemoryVcs>,
    pub orchestrator: Orchestrator,
}

pub struct Fakes {
    pub collector: Arc<FakeCollector>,
    pub evaluator: Arc<FakeEvaluator>,
    pub generator: Arc<FakeGenerator>,
    pub reviewer: Arc<FakeReviewer>,
}

impl Default for Fakes {
    fn default() -> Self {
        Self {
            collector: Arc::new(FakeCollector::default()),
            evaluator: Arc::new(FakeEvaluator::uniform(scores(0.9, 0.9, 0.9, 0.9))),
            generator: Arc::new(FakeGenerator::default()),
            reviewer: Arc::new(FakeReviewer::default()),
        }
    }
}

pub fn seed(threshold: f64) -> StrategyParams {
    StrategyParams {
        version: 1,
        keywords: vec!["raspberry pi voice".into()],
        repo_topics: vec!["webrtc".into()],
        acceptance_threshold: threshold,
    }
}

pub async fn harness(fakes: &Fakes, config: PipelineConfig, threshold: f64) -> Harness {
    let path = std::env::temp_dir().join(format!("dna_pipeline_{}.db", Uuid::now_v7()));
    let store = Arc::new(Storage::open(&path).await.unwrap());
    let vcs = Arc::new(MemoryVcs::new(TrunkGuard::default()));
    let committer = Arc::new(
        CommitSafetyLayer::new(store.clone(), vcs.clone(), BRANCH, &TrunkGuard::default())
            .unwrap()
            .with_gate(config.gate),
    );
    let collaborators = Collaborators {
        collector: fakes.collector.clone(),
        evaluator: fakes.evaluator.clone(),
        generator: fakes.generator.clone(),
        reviewer: fakes.reviewer.clone(),
    };
    let orchestrator = Orchestrator::new(store.clone(), collaborators, committer, config, seed(threshold));
    Harness {
        store,
        vcs,
        orchestrator,
    }
}
