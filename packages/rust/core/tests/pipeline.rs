mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::*;
use dnacommit_core::SilentProgress;
use dnacommit_shared::{
    Approval, DnaCommitError, KnowledgeItem, PipelineConfig, RunMode, RunOutcome, Stage, Status,
    TransitionKind,
};
use dnacommit_storage::ItemFilter;

fn config() -> PipelineConfig {
    PipelineConfig::default()
}

#[tokio::test]
async fn generation_cap_sinks_item_without_third_attempt() {
    let fakes = Fakes {
        collector: Arc::new(FakeCollector::with(vec![candidate("https://example.com/a")])),
        evaluator: Arc::new(FakeEvaluator::uniform(scores(0.9, 0.8, 0.7, 0.85))),
        generator: Arc::new(FakeGenerator {
            fail: true,
            ..FakeGenerator::default()
        }),
        ..Fakes::default()
    };
    let mut cfg = config();
    cfg.gate.generation_attempts = 2;
    let h = harness(&fakes, cfg, 0.75).await;
    let orch = &h.orchestrator;

    orch.run_cycle(RunMode::Collect, &SilentProgress).await.unwrap();
    orch.run_cycle(RunMode::Evaluate, &SilentProgress).await.unwrap();
    let items = h.store.list(&ItemFilter::default()).await.unwrap();
    assert_eq!(items.len(), 1);
    let id = items[0].id.clone();
    assert_eq!(items[0].status, Status::EvaluatedAccepted);

    let first = orch.run_cycle(RunMode::Generate, &SilentProgress).await.unwrap();
    assert_eq!(first.run.counts(Stage::Generate).retried, 1);
    let item = h.store.require(&id).await.unwrap();
    assert_eq!(item.status, Status::EvaluatedAccepted);
    assert_eq!(item.attempts, 1);

    orch.run_cycle(RunMode::Generate, &SilentProgress).await.unwrap();
    assert_eq!(h.store.require(&id).await.unwrap().status, Status::EvaluatedRejected);
    assert_eq!(fakes.generator.calls(), 2);

    orch.run_cycle(RunMode::Generate, &SilentProgress).await.unwrap();
    assert_eq!(fakes.generator.calls(), 2);
}

#[tokio::test]
async fn rollback_survives_unrelated_later_commit() {
    let b = "https://example.com/b";
    let c = "https://example.com/c";
    let mut generator = FakeGenerator::default();
    generator.files.insert(b.into(), "voice/b.py".into());
    generator.files.insert(c.into(), "voice/c.py".into());
    let fakes = Fakes {
        collector: Arc::new(FakeCollector::with(vec![candidate(b)])),
        generator: Arc::new(generator),
        ..Fakes::default()
    };
    let h = harness(&fakes, config(), 0.7).await;
    let orch = &h.orchestrator;

    orch.run_cycle(RunMode::Full, &SilentProgress).await.unwrap();
    let b_id = candidate(b).item_id();
    assert_eq!(h.store.require(&b_id).await.unwrap().status, Status::Committed);

    *fakes.collector.candidates.lock().unwrap() = vec![candidate(c)];
    orch.run_cycle(RunMode::Full, &SilentProgress).await.unwrap();
    let c_id = candidate(c).item_id();
    assert_eq!(h.store.require(&c_id).await.unwrap().status, Status::Committed);

    let rolled = orch.committer().rollback(&b_id, "operator request").await.unwrap();
    assert_eq!(rolled.status, Status::RolledBack);
    assert_eq!(h.store.require(&c_id).await.unwrap().status, Status::Committed);

    let tree = h.vcs.branch_tree(BRANCH).unwrap();
    assert!(!tree.contains_key("voice/b.py"));
    assert!(tree.contains_key("voice/c.py"));
    assert!(h.vcs.branch_tree("main").unwrap().is_empty());
}

#[tokio::test]
async fn second_full_run_makes_no_transitions() {
    let fakes = Fakes {
        collector: Arc::new(FakeCollector::with(vec![
            candidate("https://example.com/1"),
            candidate("https://example.com/2"),
            candidate("https://example.com/2"),
        ])),
        ..Fakes::default()
    };
    let h = harness(&fakes, config(), 0.7).await;

    let first = h.orchestrator.run_cycle(RunMode::Full, &SilentProgress).await.unwrap();
    assert_eq!(first.run.counts(Stage::Collect).accepted, 2);
    assert_eq!(first.totals.get(&Status::Committed), Some(&2));

    let id = candidate("https://example.com/1").item_id();
    let history_len = h.store.history(&id).await.unwrap().len();

    let second = h.orchestrator.run_cycle(RunMode::Full, &SilentProgress).await.unwrap();
    assert_eq!(second.transition_count(), 0);
    assert_eq!(second.run.outcome, RunOutcome::Completed);
    assert_eq!(h.store.history(&id).await.unwrap().len(), history_len);
}

#[tokio::test]
async fn score_equal_to_threshold_is_rejected() {
    let fakes = Fakes {
        collector: Arc::new(FakeCollector::with(vec![candidate("https://example.com/tie")])),
        evaluator: Arc::new(FakeEvaluator::uniform(scores(0.75, 0.75, 0.75, 0.75))),
        ..Fakes::default()
    };
    let h = harness(&fakes, config(), 0.75).await;
    h.orchestrator.run_cycle(RunMode::Collect, &SilentProgress).await.unwrap();
    h.orchestrator.run_cycle(RunMode::Evaluate, &SilentProgress).await.unwrap();

    let item = h
        .store
        .require(&candidate("https://example.com/tie").item_id())
        .await
        .unwrap();
    assert_eq!(item.status, Status::EvaluatedRejected);
    let evaluation = item.evaluation.unwrap();
    assert!(!evaluation.accepted);
    assert_eq!(evaluation.threshold, 0.75);
}

#[tokio::test]
async fn unreachable_evaluator_aborts_run() {
    let mut evaluator = FakeEvaluator::uniform(scores(0.9, 0.9, 0.9, 0.9));
    evaluator.unavailable = true;
    let fakes = Fakes {
        collector: Arc::new(FakeCollector::with(vec![
            candidate("https://example.com/x"),
            candidate("https://example.com/y"),
        ])),
        evaluator: Arc::new(evaluator),
        ..Fakes::default()
    };
    let h = harness(&fakes, config(), 0.7).await;

    let err = h
        .orchestrator
        .run_cycle(RunMode::Full, &SilentProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, DnaCommitError::Infrastructure(_)));

    let runs = h.store.list_runs(1).await.unwrap();
    assert!(matches!(runs[0].outcome, RunOutcome::Aborted { .. }));
    assert_eq!(runs[0].counts(Stage::Collect).accepted, 2);
    // Items stay where they were.
    let collected = h
        .store
        .list(&ItemFilter::statuses(&[Status::Collected]))
        .await
        .unwrap();
    assert_eq!(collected.len(), 2);
    assert!(collected.iter().all(|i| i.attempts == 0));
}

#[tokio::test]
async fn unreachable_collector_aborts_run() {
    let fakes = Fakes {
        collector: Arc::new(FakeCollector {
            unavailable: true,
            ..FakeCollector::default()
        }),
        ..Fakes::default()
    };
    let h = harness(&fakes, config(), 0.7).await;
    let err = h
        .orchestrator
        .run_cycle(RunMode::Collect, &SilentProgress)
        .await
        .unwrap_err();
    assert!(err.is_infrastructure());
}

#[tokio::test]
async fn low_confidence_review_waits_for_approval() {
    let fakes = Fakes {
        collector: Arc::new(FakeCollector::with(vec![candidate("https://example.com/m")])),
        reviewer: Arc::new(FakeReviewer {
            passed: true,
            confidence: 0.4,
        }),
        ..Fakes::default()
    };
    let h = harness(&fakes, config(), 0.7).await;
    let id = candidate("https://example.com/m").item_id();

    h.orchestrator.run_cycle(RunMode::Full, &SilentProgress).await.unwrap();
    let item = h.store.require(&id).await.unwrap();
    assert_eq!(item.status, Status::ReviewPassed);
    assert_eq!(item.approval, Approval::Pending);
    assert!(h.vcs.branch_tree(BRANCH).unwrap().is_empty());

    h.orchestrator.committer().approve(&id, "reviewed by hand").await.unwrap();
    h.orchestrator.run_cycle(RunMode::Commit, &SilentProgress).await.unwrap();
    assert_eq!(h.store.require(&id).await.unwrap().status, Status::Committed);

    let kinds: Vec<TransitionKind> = h
        .store
        .history(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.kind)
        .collect();
    assert!(kinds.contains(&TransitionKind::Approval));
}

#[tokio::test]
async fn failed_review_retries_then_sinks() {
    let fakes = Fakes {
        collector: Arc::new(FakeCollector::with(vec![candidate("https://example.com/r")])),
        reviewer: Arc::new(FakeReviewer {
            passed: false,
            confidence: 0.9,
        }),
        ..Fakes::default()
    };
    let mut cfg = config();
    cfg.gate.review_attempts = 2;
    let h = harness(&fakes, cfg, 0.7).await;
    let id = candidate("https://example.com/r").item_id();

    h.orchestrator.run_cycle(RunMode::Full, &SilentProgress).await.unwrap();
    assert_eq!(h.store.require(&id).await.unwrap().status, Status::CodeGenerated);

    h.orchestrator.run_cycle(RunMode::Review, &SilentProgress).await.unwrap();
    let item = h.store.require(&id).await.unwrap();
    assert_eq!(item.status, Status::ReviewFailed);
    assert!(!item.review_notes.unwrap().passed);
}

#[tokio::test]
async fn run_timeout_leaves_items_in_place() {
    let mut evaluator = FakeEvaluator::uniform(scores(0.9, 0.9, 0.9, 0.9));
    evaluator.delay = Some(Duration::from_secs(30));
    let fakes = Fakes {
        collector: Arc::new(FakeCollector::with(vec![candidate("https://example.com/slow")])),
        evaluator: Arc::new(evaluator),
        ..Fakes::default()
    };
    let mut cfg = config();
    cfg.run_timeout = Duration::from_millis(200);
    let h = harness(&fakes, cfg, 0.7).await;

    let summary = h.orchestrator.run_cycle(RunMode::Full, &SilentProgress).await.unwrap();
    assert!(summary.timed_out());
    assert!(!summary.run.stage_results.contains_key(&Stage::Generate));
    let item = h
        .store
        .require(&candidate("https://example.com/slow").item_id())
        .await
        .unwrap();
    assert_eq!(item.status, Status::Collected);
}

#[tokio::test]
async fn cleanup_deletes_stale_and_low_score_items() {
    let fakes = Fakes {
        collector: Arc::new(FakeCollector::with(vec![candidate("https://example.com/weak")])),
        evaluator: Arc::new(FakeEvaluator::uniform(scores(0.1, 0.2, 0.1, 0.2))),
        ..Fakes::default()
    };
    let h = harness(&fakes, config(), 0.7).await;

    let old = KnowledgeItem::collected(
        candidate("https://example.com/old"),
        Utc::now() - chrono::Duration::days(45),
    );
    h.store.put(&old).await.unwrap();

    let summary = h.orchestrator.run_cycle(RunMode::Full, &SilentProgress).await.unwrap();
    assert_eq!(summary.run.counts(Stage::Cleanup).accepted, 2);

    let weak = h
        .store
        .require(&candidate("https://example.com/weak").item_id())
        .await
        .unwrap();
    assert_eq!(weak.status, Status::Deleted);
    assert!(weak.reason.unwrap().starts_with("low_score"));
    let stale = h.store.require(&old.id).await.unwrap();
    assert_eq!(stale.status, Status::Deleted);
    assert!(stale.reason.unwrap().starts_with("stale"));

    // Deleted ids stay reserved.
    assert!(matches!(
        h.store.put(&old).await,
        Err(DnaCommitError::DuplicateItem { .. })
    ));
}

async fn put_collected(h: &Harness, locator: &str) {
    h.store
        .put(&KnowledgeItem::collected(candidate(locator), Utc::now()))
        .await
        .unwrap();
}

#[tokio::test]
async fn one_failing_item_does_not_stop_the_others() {
    let mut evaluator = FakeEvaluator::uniform(scores(0.9, 0.9, 0.9, 0.9));
    evaluator.failing.insert("https://example.com/broken".into());
    let fakes = Fakes {
        evaluator: Arc::new(evaluator),
        ..Fakes::default()
    };
    let h = harness(&fakes, config(), 0.7).await;
    put_collected(&h, "https://example.com/broken").await;
    put_collected(&h, "https://example.com/fine").await;

    let summary = h.orchestrator.run_cycle(RunMode::Evaluate, &SilentProgress).await.unwrap();
    assert_eq!(summary.run.outcome, RunOutcome::Completed);
    let counts = summary.run.counts(Stage::Evaluate);
    assert_eq!(counts.accepted, 1);
    assert_eq!(counts.retried, 1);

    let broken = h
        .store
        .require(&candidate("https://example.com/broken").item_id())
        .await
        .unwrap();
    assert_eq!(broken.status, Status::Collected);
    assert_eq!(broken.attempts, 1);
    let fine = h
        .store
        .require(&candidate("https://example.com/fine").item_id())
        .await
        .unwrap();
    assert_eq!(fine.status, Status::EvaluatedAccepted);
}

#[tokio::test]
async fn evaluator_calls_respect_parallelism() {
    let mut evaluator = FakeEvaluator::uniform(scores(0.9, 0.9, 0.9, 0.9));
    evaluator.delay = Some(Duration::from_millis(30));
    let fakes = Fakes {
        evaluator: Arc::new(evaluator),
        ..Fakes::default()
    };
    let mut cfg = config();
    cfg.parallelism = 2;
    let h = harness(&fakes, cfg, 0.7).await;
    for n in 0..6 {
        put_collected(&h, &format!("https://example.com/p{n}")).await;
    }

    let summary = h.orchestrator.run_cycle(RunMode::Evaluate, &SilentProgress).await.unwrap();
    assert_eq!(summary.run.counts(Stage::Evaluate).accepted, 6);
    assert!(fakes.evaluator.peak() <= 2, "peak {}", fakes.evaluator.peak());
    assert!(fakes.evaluator.peak() >= 1);
}

#[tokio::test]
async fn timed_out_stage_still_counts_finished_items() {
    let mut evaluator = FakeEvaluator::uniform(scores(0.9, 0.9, 0.9, 0.9));
    evaluator
        .slow
        .insert("https://example.com/stuck".into(), Duration::from_secs(30));
    let fakes = Fakes {
        evaluator: Arc::new(evaluator),
        ..Fakes::default()
    };
    let mut cfg = config();
    cfg.parallelism = 2;
    cfg.run_timeout = Duration::from_millis(300);
    let h = harness(&fakes, cfg, 0.7).await;
    put_collected(&h, "https://example.com/quick").await;
    put_collected(&h, "https://example.com/stuck").await;

    let summary = h.orchestrator.run_cycle(RunMode::Evaluate, &SilentProgress).await.unwrap();
    assert!(summary.timed_out());
    assert_eq!(summary.run.counts(Stage::Evaluate).accepted, 1);
    let quick = h
        .store
        .require(&candidate("https://example.com/quick").item_id())
        .await
        .unwrap();
    assert_eq!(quick.status, Status::EvaluatedAccepted);
}
