//! Stage Gate: pure accept/reject/retry decisions.
//!
//! Nothing here touches the store. The orchestrator feeds in an item and the
//! result of a collaborator call, then persists whatever [`target_status`]
//! says.

use dnacommit_shared::{Evaluation, GatePolicy, KnowledgeItem, Scores, Stage, Status};

/// Aggregates closer than this to the threshold count as a tie.
const TIE_EPSILON: f64 = 1e-9;

/// Gate verdict for one item at one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
    /// Stay in the current status; try again on a later run.
    Retry,
}

/// What a stage produced for an item.
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    /// Scores were computed and frozen.
    Evaluated(Evaluation),
    /// The generator produced an artifact.
    Generated,
    /// The reviewer answered.
    Reviewed { passed: bool },
    /// The branch commit succeeded.
    Committed,
    /// The collaborator failed for this item (error or explicit failure).
    Failed,
}

/// Freeze an evaluation: weighted aggregate compared against the threshold.
/// Ties reject unless `ties_accept` is set.
pub fn evaluate_scores(scores: &Scores, policy: &GatePolicy) -> Evaluation {
    let aggregate = scores.aggregate(&policy.weights);
    let threshold = policy.acceptance_threshold;
    let accepted = if (aggregate - threshold).abs() < TIE_EPSILON {
        policy.ties_accept
    } else {
        aggregate > threshold
    };
    Evaluation {
        scores: *scores,
        aggregate,
        threshold,
        accepted,
    }
}

/// Attempt cap for failures at `stage`.
pub fn attempt_cap(stage: Stage, policy: &GatePolicy) -> u32 {
    let cap = match stage {
        Stage::Evaluate => policy.evaluation_attempts,
        Stage::Generate => policy.generation_attempts,
        Stage::Review => policy.review_attempts,
        Stage::Collect | Stage::Commit | Stage::Cleanup => 1,
    };
    cap.max(1)
}

/// Decide the fate of `item` after `stage` produced `result`.
///
/// Failures retry while `attempts + 1 < cap`; the failure that reaches the cap
/// rejects.
pub fn decide(item: &KnowledgeItem, stage: Stage, result: &StageResult, policy: &GatePolicy) -> Decision {
    match result {
        StageResult::Evaluated(evaluation) => {
            if evaluation.accepted {
                Decision::Accept
            } else {
                Decision::Reject
            }
        }
        StageResult::Generated | StageResult::Committed => Decision::Accept,
        StageResult::Reviewed { passed: true } => Decision::Accept,
        StageResult::Reviewed { passed: false } | StageResult::Failed => {
            if item.attempts.saturating_add(1) >= attempt_cap(stage, policy) {
                Decision::Reject
            } else {
                Decision::Retry
            }
        }
    }
}

/// Status reached by `decision` at `stage`; `None` means stay put.
pub fn target_status(stage: Stage, decision: Decision) -> Option<Status> {
    use Decision::*;
    match (stage, decision) {
        (_, Retry) => None,
        (Stage::Evaluate, Accept) => Some(Status::EvaluatedAccepted),
        (Stage::Evaluate, Reject) => Some(Status::EvaluatedRejected),
        (Stage::Generate, Accept) => Some(Status::CodeGenerated),
        (Stage::Generate, Reject) => Some(Status::EvaluatedRejected),
        (Stage::Review, Accept) => Some(Status::ReviewPassed),
        (Stage::Review, Reject) => Some(Status::ReviewFailed),
        (Stage::Commit, Accept) => Some(Status::Committed),
        (Stage::Commit, Reject) => Some(Status::ReviewFailed),
        (Stage::Cleanup, Accept) => Some(Status::Deleted),
        (Stage::Collect, _) | (Stage::Cleanup, Reject) => None,
    }
}

/// Status an item must be in to be eligible for `stage`.
pub fn eligible_status(stage: Stage) -> Option<Status> {
    match stage {
        Stage::Evaluate => Some(Status::Collected),
        Stage::Generate => Some(Status::EvaluatedAccepted),
        Stage::Review => Some(Status::CodeGenerated),
        Stage::Commit => Some(Status::ReviewPassed),
        Stage::Collect | Stage::Cleanup => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dnacommit_shared::{Payload, RawCandidate, Source};

    fn item(status: Status, attempts: u32) -> KnowledgeItem {
        let mut item = KnowledgeItem::collected(
            RawCandidate {
                source: Source::WebSearch,
                payload: Payload {
                    title: "t".into(),
                    locator: "https://example.com/a".into(),
                    content: String::new(),
                    query: None,
                    metadata: serde_json::Value::Null,
                },
            },
            Utc::now(),
        );
        item.status = status;
        item.attempts = attempts;
        item
    }

    fn scores(q: f64, r: f64, n: f64, u: f64) -> Scores {
        Scores {
            quality: q,
            relevance: r,
            novelty: n,
            utility: u,
        }
    }

    #[test]
    fn accepts_above_threshold() {
        let policy = GatePolicy {
            acceptance_threshold: 0.75,
            ..GatePolicy::default()
        };
        let eval = evaluate_scores(&scores(0.9, 0.8, 0.7, 0.85), &policy);
        assert!(eval.accepted);
        assert!((eval.aggregate - 0.8125).abs() < 1e-12);
        let d = decide(&item(Status::Collected, 0), Stage::Evaluate, &StageResult::Evaluated(eval), &policy);
        assert_eq!(target_status(Stage::Evaluate, d), Some(Status::EvaluatedAccepted));
    }

    #[test]
    fn tie_rejects_by_default() {
        let mut policy = GatePolicy {
            acceptance_threshold: 0.75,
            ..GatePolicy::default()
        };
        let tie = scores(0.75, 0.75, 0.75, 0.75);
        assert!(!evaluate_scores(&tie, &policy).accepted);

        policy.ties_accept = true;
        assert!(evaluate_scores(&tie, &policy).accepted);
    }

    #[test]
    fn failures_retry_until_cap() {
        let policy = GatePolicy {
            generation_attempts: 2,
            ..GatePolicy::default()
        };
        let first = decide(&item(Status::EvaluatedAccepted, 0), Stage::Generate, &StageResult::Failed, &policy);
        assert_eq!(first, Decision::Retry);
        assert_eq!(target_status(Stage::Generate, first), None);

        let second = decide(&item(Status::EvaluatedAccepted, 1), Stage::Generate, &StageResult::Failed, &policy);
        assert_eq!(second, Decision::Reject);
        assert_eq!(target_status(Stage::Generate, second), Some(Status::EvaluatedRejected));
    }

    #[test]
    fn failed_review_sinks_after_cap() {
        let policy = GatePolicy {
            review_attempts: 1,
            ..GatePolicy::default()
        };
        let d = decide(
            &item(Status::CodeGenerated, 0),
            Stage::Review,
            &StageResult::Reviewed { passed: false },
            &policy,
        );
        assert_eq!(target_status(Stage::Review, d), Some(Status::ReviewFailed));
    }

    #[test]
    fn commit_failure_is_immediate() {
        let d = decide(&item(Status::ReviewPassed, 0), Stage::Commit, &StageResult::Failed, &GatePolicy::default());
        assert_eq!(target_status(Stage::Commit, d), Some(Status::ReviewFailed));
    }

    #[test]
    fn every_target_is_a_lifecycle_edge() {
        for stage in Stage::ORDER {
            let Some(from) = eligible_status(stage) else {
                continue;
            };
            for decision in [Decision::Accept, Decision::Reject] {
                if let Some(to) = target_status(stage, decision) {
                    assert!(from.can_transition_to(to), "{from} -> {to}");
                }
            }
        }
    }
}
