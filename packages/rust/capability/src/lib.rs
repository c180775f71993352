//! External collaborators consumed by the DNA-commit pipeline.
//!
//! The orchestrator only sees the four collaborator traits ([`Collector`],
//! [`Evaluator`], [`Generator`], [`Reviewer`]). Concrete behavior lives behind
//! a single [`CapabilityBackend`] transport selected by configuration:
//! - [`BridgeBackend`]: long-lived subprocess speaking JSON lines
//! - [`HttpBackend`]: JSON POST to a capability service
//!
//! [`Agents`] adapts any backend to all four traits.

mod bridge;
mod http;
pub mod protocol;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use dnacommit_shared::{
    AppConfig, Artifact, ArtifactRef, BackendConfig, DnaCommitError, KnowledgeItem, Payload,
    RawCandidate, Result, ReviewNotes, Scores, Stage, expand_home,
};

pub use bridge::{BridgeBackend, BridgeConfig};
pub use http::HttpBackend;
pub use protocol::{Task, TaskReply};

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Parameters for one collection pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectParams {
    /// Web-search keywords.
    pub keywords: Vec<String>,
    /// Repository-trend topics.
    pub repo_topics: Vec<String>,
    pub results_per_query: usize,
}

/// Finds raw candidate payloads.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect(&self, params: &CollectParams) -> Result<Vec<RawCandidate>>;
}

/// Scores a payload on the four quality metrics.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, payload: &Payload) -> Result<Scores>;
}

/// Result of a generation attempt that reached the generator.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Artifact(Artifact),
    /// The generator ran but produced nothing usable.
    Failure(String),
}

/// Turns an accepted item into a code change.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, item: &KnowledgeItem) -> Result<GenerationOutcome>;
}

/// Reviews a generated change.
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, artifact: &Artifact) -> Result<ReviewNotes>;
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Swappable transport to whatever implements the agents.
#[async_trait]
pub trait CapabilityBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Run one task. Transport-level failures map to
    /// [`DnaCommitError::CollaboratorUnavailable`], per-task failures to
    /// [`DnaCommitError::Collaborator`].
    async fn invoke(&self, task: Task) -> Result<TaskReply>;

    /// Release any resources (child processes, connections).
    async fn shutdown(&self) {}
}

/// Build the backend selected by `[backend]`.
pub fn backend_from_config(config: &AppConfig) -> Result<Arc<dyn CapabilityBackend>> {
    match &config.backend {
        BackendConfig::Bridge {
            command,
            args,
            working_dir,
        } => {
            let mut bridge = BridgeConfig::new(command.clone(), args.clone());
            bridge.working_dir = working_dir.as_deref().map(expand_home);
            Ok(Arc::new(BridgeBackend::new(bridge)))
        }
        BackendConfig::Http {
            endpoint,
            api_key_env,
            timeout_secs,
        } => {
            if let Some(var) = api_key_env {
                if std::env::var(var).map(|v| v.is_empty()).unwrap_or(true) {
                    warn!(var = %var, "capability API key env var is not set");
                }
            }
            Ok(Arc::new(HttpBackend::new(
                endpoint,
                api_key_env.as_deref(),
                Duration::from_secs(*timeout_secs),
            )?))
        }
    }
}

// ---------------------------------------------------------------------------
// Agents: backend -> collaborator traits
// ---------------------------------------------------------------------------

/// Adapts a [`CapabilityBackend`] to every collaborator trait.
pub struct Agents<B: CapabilityBackend + ?Sized> {
    backend: Arc<B>,
}

impl<B: CapabilityBackend + ?Sized> Agents<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }
}

impl<B: CapabilityBackend + ?Sized> Clone for Agents<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

fn unexpected(stage: Stage, reply: &TaskReply) -> DnaCommitError {
    DnaCommitError::collaborator(stage, format!("unexpected reply kind '{}'", reply.kind()))
}

#[async_trait]
impl<B: CapabilityBackend + ?Sized> Collector for Agents<B> {
    async fn collect(&self, params: &CollectParams) -> Result<Vec<RawCandidate>> {
        let task = Task::Collect {
            keywords: params.keywords.clone(),
            repo_topics: params.repo_topics.clone(),
            results_per_query: params.results_per_query,
        };
        match self.backend.invoke(task).await? {
            TaskReply::Candidates { candidates } => Ok(candidates
                .into_iter()
                .filter(|c| !c.payload.title.trim().is_empty())
                .collect()),
            other => Err(unexpected(Stage::Collect, &other)),
        }
    }
}

#[async_trait]
impl<B: CapabilityBackend + ?Sized> Evaluator for Agents<B> {
    async fn evaluate(&self, payload: &Payload) -> Result<Scores> {
        let task = Task::Evaluate {
            payload: payload.clone(),
        };
        match self.backend.invoke(task).await? {
            TaskReply::Scores { scores } => {
                scores
                    .validate()
                    .map_err(|e| DnaCommitError::collaborator(Stage::Evaluate, e.to_string()))?;
                Ok(scores)
            }
            other => Err(unexpected(Stage::Evaluate, &other)),
        }
    }
}

#[async_trait]
impl<B: CapabilityBackend + ?Sized> Generator for Agents<B> {
    async fn generate(&self, item: &KnowledgeItem) -> Result<GenerationOutcome> {
        let task = Task::Generate {
            item_id: item.id.clone(),
            payload: item.payload.clone(),
            evaluation: item.evaluation,
        };
        match self.backend.invoke(task).await? {
            TaskReply::Change {
                files,
                commit_message,
                summary,
            } => {
                if files.is_empty() {
                    return Ok(GenerationOutcome::Failure("generator returned no files".into()));
                }
                if commit_message.trim().is_empty() {
                    return Ok(GenerationOutcome::Failure(
                        "generator returned an empty commit message".into(),
                    ));
                }
                Ok(GenerationOutcome::Artifact(Artifact {
                    artifact_ref: ArtifactRef::new(),
                    item_id: item.id.clone(),
                    files,
                    commit_message,
                    summary,
                }))
            }
            TaskReply::GenerationFailed { reason } => Ok(GenerationOutcome::Failure(reason)),
            other => Err(unexpected(Stage::Generate, &other)),
        }
    }
}

#[async_trait]
impl<B: CapabilityBackend + ?Sized> Reviewer for Agents<B> {
    async fn review(&self, artifact: &Artifact) -> Result<ReviewNotes> {
        let task = Task::Review {
            artifact: artifact.clone(),
        };
        match self.backend.invoke(task).await? {
            TaskReply::Review { notes } => {
                if !(0.0..=1.0).contains(&notes.confidence) {
                    return Err(DnaCommitError::collaborator(
                        Stage::Review,
                        format!("review confidence out of range: {}", notes.confidence),
                    ));
                }
                Ok(notes)
            }
            other => Err(unexpected(Stage::Review, &other)),
        }
    }
}
