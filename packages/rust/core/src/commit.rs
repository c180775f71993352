//! Commit Safety Layer.
//!
//! The only component that mutates the automation branch. Every commit and
//! rollback holds one mutex, so branch history never interleaves. Writes go
//! through a [`TrunkGuard`]-checked branch name; there is no way to target
//! trunk from here.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use dnacommit_shared::{
    Approval, ApprovalPolicy, CommitRef, DnaCommitError, GatePolicy, ItemId, KnowledgeItem,
    Result, ReviewNotes, Stage, Status,
};
use dnacommit_storage::{Storage, TransitionPatch};
use dnacommit_vcs::{RevertOutcome, TrunkGuard, VcsBackend};

use crate::gate::{self, StageResult};

/// Whether a passing review still needs an operator before commit.
pub fn requires_manual_approval(notes: &ReviewNotes, policy: &ApprovalPolicy) -> bool {
    policy.always_manual
        || notes.confidence < policy.min_confidence
        || (policy.block_on_critical && notes.has_critical())
}

/// Commit-message line tying a branch commit to its item.
pub fn item_trailer(id: &ItemId) -> String {
    format!("DNA-commit-Item: {id}")
}

pub struct CommitSafetyLayer {
    store: Arc<Storage>,
    vcs: Arc<dyn VcsBackend>,
    branch: String,
    gate: GatePolicy,
    lock: Mutex<()>,
}

impl CommitSafetyLayer {
    /// Fails with [`DnaCommitError::TrunkWriteForbidden`] if `branch` is a
    /// trunk name.
    pub fn new(
        store: Arc<Storage>,
        vcs: Arc<dyn VcsBackend>,
        branch: impl Into<String>,
        guard: &TrunkGuard,
    ) -> Result<Self> {
        let branch = branch.into();
        guard.check(&branch)?;
        Ok(Self {
            store,
            vcs,
            branch,
            gate: GatePolicy::default(),
            lock: Mutex::new(()),
        })
    }

    pub fn with_gate(mut self, gate: GatePolicy) -> Self {
        self.gate = gate;
        self
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Make sure the automation branch exists and is checked out.
    pub async fn prepare(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.vcs.create_branch(&self.branch).await
    }

    /// Commit a `review_passed` item's artifact to the automation branch.
    ///
    /// A VCS failure moves the item to `review_failed` and returns the error.
    #[instrument(skip_all, fields(item_id = %id, branch = %self.branch))]
    pub async fn commit(&self, id: &ItemId) -> Result<KnowledgeItem> {
        let _guard = self.lock.lock().await;

        let item = self.store.require(id).await?;
        if item.status != Status::ReviewPassed {
            return Err(DnaCommitError::InvalidTransition {
                id: id.clone(),
                from: item.status,
                to: Status::Committed,
            });
        }
        if item.approval == Approval::Pending {
            return Err(DnaCommitError::validation(format!(
                "item {id} is awaiting manual approval"
            )));
        }
        let artifact_ref = item.generated_artifact_ref.clone().ok_or_else(|| {
            DnaCommitError::validation(format!("item {id} has no generated artifact"))
        })?;
        let artifact = self
            .store
            .get_artifact(&artifact_ref)
            .await?
            .ok_or_else(|| DnaCommitError::NotFound {
                id: artifact_ref.0.clone(),
            })?;

        let trailer = item_trailer(&item.id);
        let written = async {
            self.vcs.create_branch(&self.branch).await?;
            // A commit from an earlier attempt whose status update was lost.
            if let Some(existing) = self.vcs.find_trailer(&trailer).await? {
                warn!(commit = %existing, "item already on branch, recording existing commit");
                let parent = self.vcs.parent(&existing).await?.unwrap_or_default();
                return Ok::<_, DnaCommitError>((parent, existing));
            }
            self.vcs.discard().await?;
            let parent = self.vcs.head().await?.unwrap_or_default();
            self.vcs.write_artifact(&artifact.files).await?;
            let message = format!("{}\n\n{trailer}", artifact.commit_message.trim());
            let commit = self.vcs.commit(&message).await?;
            Ok((parent, commit))
        }
        .await;

        let (parent, commit) = match written {
            Ok(refs) => refs,
            Err(e @ DnaCommitError::TrunkWriteForbidden { .. }) => return Err(e),
            Err(e) => {
                if let Err(reset) = self.vcs.discard().await {
                    error!(error = %reset, "could not reset worktree after failed commit");
                }
                if e.is_infrastructure() {
                    return Err(e);
                }
                warn!(error = %e, "commit failed");
                let decision = gate::decide(&item, Stage::Commit, &StageResult::Failed, &self.gate);
                if let Some(to) = gate::target_status(Stage::Commit, decision) {
                    self.store
                        .update_status_from(
                            id,
                            Status::ReviewPassed,
                            to,
                            &format!("commit failed: {e}"),
                            TransitionPatch::default(),
                        )
                        .await?;
                }
                return Err(e);
            }
        };

        let commit_ref = CommitRef {
            branch: self.branch.clone(),
            commit: commit.clone(),
            parent,
            reverted_by: None,
        };
        let patch = TransitionPatch {
            commit_ref: Some(commit_ref),
            ..TransitionPatch::default()
        };
        let reason = format!("committed {commit} to {}", self.branch);
        match self
            .store
            .update_status_from(id, Status::ReviewPassed, Status::Committed, &reason, patch)
            .await
        {
            Ok(item) => {
                info!(%commit, "item committed");
                Ok(item)
            }
            Err(e) => {
                error!(%commit, error = %e, "branch commit landed but status was not recorded");
                Err(e)
            }
        }
    }

    /// Revert a committed item's change.
    ///
    /// Refuses with [`DnaCommitError::ConflictingHistory`] when a later commit
    /// touched any of the same files.
    #[instrument(skip_all, fields(item_id = %id))]
    pub async fn rollback(&self, id: &ItemId, reason: &str) -> Result<KnowledgeItem> {
        let _guard = self.lock.lock().await;

        let item = self.store.require(id).await?;
        if item.status != Status::Committed {
            return Err(DnaCommitError::NotCommitted {
                id: id.clone(),
                status: item.status,
            });
        }
        let mut commit_ref = item.commit_ref.clone().ok_or_else(|| {
            DnaCommitError::validation(format!("committed item {id} has no commit reference"))
        })?;

        self.vcs.create_branch(&commit_ref.branch).await?;

        let touched: BTreeSet<String> = self
            .vcs
            .files_changed(&commit_ref.commit)
            .await?
            .into_iter()
            .collect();
        for later in self.vcs.commits_after(&commit_ref.commit).await? {
            let overlap: Vec<String> = self
                .vcs
                .files_changed(&later)
                .await?
                .into_iter()
                .filter(|f| touched.contains(f))
                .collect();
            if !overlap.is_empty() {
                warn!(%later, ?overlap, "rollback blocked by later commit");
                return Err(DnaCommitError::ConflictingHistory {
                    message: format!(
                        "commit {later} also changed {} after {}",
                        overlap.join(", "),
                        commit_ref.commit
                    ),
                });
            }
        }

        let revert = match self.vcs.revert(&commit_ref.commit).await? {
            RevertOutcome::Clean(revert) => revert,
            RevertOutcome::Conflict(message) => {
                return Err(DnaCommitError::ConflictingHistory { message });
            }
        };

        commit_ref.reverted_by = Some(revert.clone());
        let patch = TransitionPatch {
            commit_ref: Some(commit_ref),
            ..TransitionPatch::default()
        };
        let item = self
            .store
            .update_status_from(id, Status::Committed, Status::RolledBack, reason, patch)
            .await?;
        info!(%revert, "item rolled back");
        Ok(item)
    }

    /// Grant a pending manual approval so the next commit stage picks it up.
    pub async fn approve(&self, id: &ItemId, reason: &str) -> Result<KnowledgeItem> {
        let item = self.store.require(id).await?;
        if item.status != Status::ReviewPassed || item.approval != Approval::Pending {
            return Err(DnaCommitError::validation(format!(
                "item {id} is not awaiting approval (status: {})",
                item.status_label()
            )));
        }
        self.store.set_approval(id, Approval::Granted, reason).await?;
        self.store.require(id).await
    }
}
