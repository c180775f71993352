//! Error types for DNA-commit.
//!
//! Library crates use [`DnaCommitError`] via `thiserror`.
//! App crates (cli/tui) wrap this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::types::{ItemId, Stage, Status};

/// Top-level error type for all DNA-commit operations.
#[derive(Debug, thiserror::Error)]
pub enum DnaCommitError {
    /// A status change that is not an edge of the lifecycle graph, or a lost
    /// compare-and-set race on the stored status.
    #[error("invalid transition for item {id}: {from} -> {to}")]
    InvalidTransition { id: ItemId, from: Status, to: Status },

    /// A collaborator answered with an error for a single item.
    #[error("collaborator error during {stage}: {message}")]
    Collaborator { stage: Stage, message: String },

    /// A collaborator could not be spawned or reached at all.
    #[error("collaborator unavailable during {stage}: {message}")]
    CollaboratorUnavailable { stage: Stage, message: String },

    /// Branch history makes a clean revert impossible.
    #[error("conflicting history: {message}")]
    ConflictingHistory { message: String },

    /// Rollback requested for an item that is not committed.
    #[error("item {id} is not committed (status: {status})")]
    NotCommitted { id: ItemId, status: Status },

    /// Run-level failure: the store or every collaborator is unavailable.
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad payload, malformed reply, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// No record with this id.
    #[error("item {id} not found")]
    NotFound { id: String },

    /// The id already exists (live, soft-deleted or purged).
    #[error("item {id} already exists")]
    DuplicateItem { id: ItemId },

    /// Attempted write to a protected trunk branch.
    #[error("refusing to write to trunk branch '{branch}'")]
    TrunkWriteForbidden { branch: String },

    /// Version-control backend failure.
    #[error("vcs error: {0}")]
    Vcs(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DnaCommitError>;

impl DnaCommitError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a per-item collaborator error for `stage`.
    pub fn collaborator(stage: Stage, msg: impl Into<String>) -> Self {
        Self::Collaborator {
            stage,
            message: msg.into(),
        }
    }

    /// Create a collaborator-unreachable error for `stage`.
    pub fn unavailable(stage: Stage, msg: impl Into<String>) -> Self {
        Self::CollaboratorUnavailable {
            stage,
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors that abort a whole run rather than a single item.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Infrastructure(_) | Self::Storage(_) | Self::Io { .. }
        )
    }

    /// Errors raised by an external collaborator call.
    pub fn is_collaborator(&self) -> bool {
        matches!(
            self,
            Self::Collaborator { .. } | Self::CollaboratorUnavailable { .. }
        )
    }
}
