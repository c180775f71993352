//! Version-control backends for DNA-commit.
//!
//! Everything the pipeline writes lands on a dedicated automation branch. Both
//! backends carry a [`TrunkGuard`] that refuses to check out or commit on a
//! trunk branch; the guard is not configurable off.
//!
//! - [`GitCli`]: shells out to `git` on a separate worktree, never pushes
//! - [`MemoryVcs`]: in-process model for dry runs and tests

mod git;
mod guard;
mod memory;

use std::path::{Component, Path};

use async_trait::async_trait;

use dnacommit_shared::{ArtifactFile, DnaCommitError, Result};

pub use git::GitCli;
pub use guard::TrunkGuard;
pub use memory::MemoryVcs;

/// Result of reverting a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertOutcome {
    /// Revert applied; carries the new commit id.
    Clean(String),
    /// Later history touches the same content; nothing was changed.
    Conflict(String),
}

/// Operations the commit safety layer needs from a repository.
#[async_trait]
pub trait VcsBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Create `branch` if missing and make it the current branch.
    async fn create_branch(&self, branch: &str) -> Result<()>;

    /// Stage artifact files in the working tree of the current branch.
    async fn write_artifact(&self, files: &[ArtifactFile]) -> Result<()>;

    /// Commit staged files, returning the new commit id.
    async fn commit(&self, message: &str) -> Result<String>;

    /// Drop staged and untracked changes so the working tree matches head.
    async fn discard(&self) -> Result<()>;

    /// Revert `commit` on the current branch.
    async fn revert(&self, commit: &str) -> Result<RevertOutcome>;

    /// Current branch head, `None` on an unborn branch.
    async fn head(&self) -> Result<Option<String>>;

    /// Paths touched by `commit`.
    async fn files_changed(&self, commit: &str) -> Result<Vec<String>>;

    /// Commits reachable from head but not from `commit`, newest first.
    async fn commits_after(&self, commit: &str) -> Result<Vec<String>>;

    /// Newest commit on the current branch whose message has a line equal to
    /// `trailer`.
    async fn find_trailer(&self, trailer: &str) -> Result<Option<String>>;

    /// First parent of `commit`, `None` for a root commit.
    async fn parent(&self, commit: &str) -> Result<Option<String>>;
}

/// Reject artifact paths that could escape the working tree.
pub fn validate_artifact_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(DnaCommitError::validation("artifact path is empty"));
    }
    let p = Path::new(path);
    for component in p.components() {
        match component {
            Component::Normal(part) if part == ".git" => {
                return Err(DnaCommitError::validation(format!(
                    "artifact path '{path}' points into .git"
                )));
            }
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(DnaCommitError::validation(format!(
                    "artifact path '{path}' must be relative and stay inside the repository"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_paths() {
        assert!(validate_artifact_path("voice/webrtc.py").is_ok());
        assert!(validate_artifact_path("./docs/notes.md").is_ok());
        assert!(validate_artifact_path("/etc/passwd").is_err());
        assert!(validate_artifact_path("../outside.txt").is_err());
        assert!(validate_artifact_path("a/../../b").is_err());
        assert!(validate_artifact_path(".git/config").is_err());
        assert!(validate_artifact_path("  ").is_err());
    }
}
