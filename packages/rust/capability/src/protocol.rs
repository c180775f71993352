//! Task/reply messages exchanged with a capability backend.
//!
//! The same JSON shapes travel over the subprocess bridge (wrapped in an
//! envelope with a request id) and as HTTP request/response bodies.

use serde::{Deserialize, Serialize};

use dnacommit_shared::{
    Artifact, ArtifactFile, Evaluation, ItemId, Payload, RawCandidate, ReviewNotes, Scores, Stage,
};

/// Work requested from the capability backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    /// Search for new candidates.
    Collect {
        keywords: Vec<String>,
        repo_topics: Vec<String>,
        results_per_query: usize,
    },
    /// Score a collected payload.
    Evaluate { payload: Payload },
    /// Produce a code change for an accepted item.
    Generate {
        item_id: ItemId,
        payload: Payload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        evaluation: Option<Evaluation>,
    },
    /// Review a generated change.
    Review { artifact: Artifact },
}

impl Task {
    /// Pipeline stage this task belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Collect { .. } => Stage::Collect,
            Self::Evaluate { .. } => Stage::Evaluate,
            Self::Generate { .. } => Stage::Generate,
            Self::Review { .. } => Stage::Review,
        }
    }
}

/// Successful reply from the capability backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskReply {
    Candidates {
        candidates: Vec<RawCandidate>,
    },
    Scores {
        scores: Scores,
    },
    Change {
        files: Vec<ArtifactFile>,
        commit_message: String,
        #[serde(default)]
        summary: String,
    },
    /// The generator declined or failed for this item.
    GenerationFailed {
        reason: String,
    },
    Review {
        notes: ReviewNotes,
    },
}

impl TaskReply {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Candidates { .. } => "candidates",
            Self::Scores { .. } => "scores",
            Self::Change { .. } => "change",
            Self::GenerationFailed { .. } => "generation_failed",
            Self::Review { .. } => "review",
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge envelope
// ---------------------------------------------------------------------------

/// Request line written to the bridge's stdin.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum RequestMessage {
    Task { id: String, task: Task },
    Shutdown,
}

/// Response line read from the bridge's stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ResponseMessage {
    Ready,
    Result { id: String, reply: TaskReply },
    Error { id: String, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_wire_shape() {
        let task = Task::Collect {
            keywords: vec!["edge ai".into()],
            repo_topics: vec![],
            results_per_query: 3,
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["task"], "collect");
        assert_eq!(json["results_per_query"], 3);
        assert_eq!(task.stage(), Stage::Collect);
    }

    #[test]
    fn bridge_envelope_shape() {
        let msg = RequestMessage::Task {
            id: "req-7".into(),
            task: Task::Evaluate {
                payload: Payload {
                    title: "t".into(),
                    locator: String::new(),
                    content: String::new(),
                    query: None,
                    metadata: serde_json::Value::Null,
                },
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "task");
        assert_eq!(json["id"], "req-7");
        assert_eq!(json["task"]["task"], "evaluate");

        let line = r#"{"type":"result","id":"req-7","reply":{"kind":"generation_failed","reason":"no idea"}}"#;
        match serde_json::from_str::<ResponseMessage>(line).unwrap() {
            ResponseMessage::Result { id, reply } => {
                assert_eq!(id, "req-7");
                assert_eq!(reply.kind(), "generation_failed");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
