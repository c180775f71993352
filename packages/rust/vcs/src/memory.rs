//! In-process VCS used for dry runs and tests.
//!
//! Commits are immutable snapshots of the whole tree, identified by a SHA-256
//! over parent, message and contents. Reverting restores the parent's content
//! for every path the commit touched.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use dnacommit_shared::{ArtifactFile, DnaCommitError, Result};

use crate::{RevertOutcome, TrunkGuard, VcsBackend, validate_artifact_path};

type Tree = BTreeMap<String, String>;

#[derive(Debug, Clone)]
struct Snapshot {
    parent: Option<String>,
    tree: Tree,
    changed: Vec<String>,
    message: String,
}

#[derive(Debug, Default)]
struct State {
    commits: BTreeMap<String, Snapshot>,
    branches: BTreeMap<String, Option<String>>,
    current: String,
    staged: Tree,
}

impl State {
    fn head(&self) -> Option<String> {
        self.branches.get(&self.current).cloned().flatten()
    }

    fn head_tree(&self) -> Tree {
        self.head()
            .and_then(|id| self.commits.get(&id))
            .map(|s| s.tree.clone())
            .unwrap_or_default()
    }

    fn snapshot(&self, id: &str) -> Result<&Snapshot> {
        self.commits
            .get(id)
            .ok_or_else(|| DnaCommitError::Vcs(format!("unknown commit {id}")))
    }

    fn record(&mut self, parent: Option<String>, tree: Tree, changed: Vec<String>, message: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(parent.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\0");
        hasher.update(message.as_bytes());
        for (path, contents) in &tree {
            hasher.update(b"\0");
            hasher.update(path.as_bytes());
            hasher.update(b"\0");
            hasher.update(contents.as_bytes());
        }
        let id = format!("{:x}", hasher.finalize())[..12].to_string();
        self.commits.insert(
            id.clone(),
            Snapshot {
                parent,
                tree,
                changed,
                message: message.to_string(),
            },
        );
        self.branches.insert(self.current.clone(), Some(id.clone()));
        id
    }

    fn ancestry(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut cursor = self.head();
        while let Some(id) = cursor {
            cursor = self.commits.get(&id).and_then(|s| s.parent.clone());
            out.push(id);
        }
        out
    }
}

/// In-memory repository starting with an empty `main` branch.
#[derive(Debug)]
pub struct MemoryVcs {
    guard: TrunkGuard,
    state: Mutex<State>,
}

impl MemoryVcs {
    pub fn new(guard: TrunkGuard) -> Self {
        let mut branches = BTreeMap::new();
        branches.insert("main".to_string(), None);
        Self {
            guard,
            state: Mutex::new(State {
                branches,
                current: "main".into(),
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| DnaCommitError::Vcs("memory vcs state poisoned".into()))
    }

    /// Files at the head of the current branch.
    pub fn tree(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.lock()?.head_tree())
    }

    /// Files at `branch`'s head.
    pub fn branch_tree(&self, branch: &str) -> Result<BTreeMap<String, String>> {
        let state = self.lock()?;
        let head = state.branches.get(branch).cloned().flatten();
        Ok(head
            .and_then(|id| state.commits.get(&id))
            .map(|s| s.tree.clone())
            .unwrap_or_default())
    }

    pub fn current_branch(&self) -> Result<String> {
        Ok(self.lock()?.current.clone())
    }

    /// Commit message of `commit`.
    pub fn message(&self, commit: &str) -> Result<String> {
        Ok(self.lock()?.snapshot(commit)?.message.clone())
    }
}

#[async_trait]
impl VcsBackend for MemoryVcs {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_branch(&self, branch: &str) -> Result<()> {
        self.guard.check(branch)?;
        let mut state = self.lock()?;
        if !state.branches.contains_key(branch) {
            let from = state.head();
            debug!(branch, from = ?from, "creating branch");
            state.branches.insert(branch.to_string(), from);
        }
        state.current = branch.to_string();
        state.staged.clear();
        Ok(())
    }

    async fn write_artifact(&self, files: &[ArtifactFile]) -> Result<()> {
        for file in files {
            validate_artifact_path(&file.path)?;
        }
        let mut state = self.lock()?;
        self.guard.check(&state.current)?;
        for file in files {
            state.staged.insert(file.path.clone(), file.contents.clone());
        }
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<String> {
        let mut state = self.lock()?;
        self.guard.check(&state.current)?;

        let mut tree = state.head_tree();
        let staged = std::mem::take(&mut state.staged);
        let mut changed = Vec::new();
        for (path, contents) in staged {
            if tree.get(&path) != Some(&contents) {
                changed.push(path.clone());
                tree.insert(path, contents);
            }
        }
        if changed.is_empty() {
            return Err(DnaCommitError::Vcs("nothing to commit".into()));
        }

        let parent = state.head();
        let id = state.record(parent, tree, changed, message);
        info!(commit = %id, branch = %state.current, "committed");
        Ok(id)
    }

    async fn discard(&self) -> Result<()> {
        self.lock()?.staged.clear();
        Ok(())
    }

    async fn revert(&self, commit: &str) -> Result<RevertOutcome> {
        let mut state = self.lock()?;
        self.guard.check(&state.current)?;
        if !state.ancestry().iter().any(|id| id == commit) {
            return Err(DnaCommitError::Vcs(format!(
                "commit {commit} is not on branch {}",
                state.current
            )));
        }

        let target = state.snapshot(commit)?.clone();
        let parent_tree = match &target.parent {
            Some(p) => state.snapshot(p)?.tree.clone(),
            None => Tree::new(),
        };
        let mut tree = state.head_tree();

        for path in &target.changed {
            if tree.get(path) != target.tree.get(path) {
                return Ok(RevertOutcome::Conflict(format!(
                    "{path} changed after {commit}"
                )));
            }
        }
        for path in &target.changed {
            match parent_tree.get(path) {
                Some(contents) => tree.insert(path.clone(), contents.clone()),
                None => tree.remove(path),
            };
        }

        let parent = state.head();
        let subject = target.message.lines().next().unwrap_or_default();
        let message = format!("Revert \"{subject}\"\n\nThis reverts commit {commit}.");
        let id = state.record(parent, tree, target.changed.clone(), &message);
        info!(commit = %id, reverted = %commit, "reverted");
        Ok(RevertOutcome::Clean(id))
    }

    async fn head(&self) -> Result<Option<String>> {
        Ok(self.lock()?.head())
    }

    async fn files_changed(&self, commit: &str) -> Result<Vec<String>> {
        Ok(self.lock()?.snapshot(commit)?.changed.clone())
    }

    async fn commits_after(&self, commit: &str) -> Result<Vec<String>> {
        let state = self.lock()?;
        let mut out = Vec::new();
        for id in state.ancestry() {
            if id == commit {
                return Ok(out);
            }
            out.push(id);
        }
        Err(DnaCommitError::Vcs(format!(
            "commit {commit} is not on branch {}",
            state.current
        )))
    }

    async fn find_trailer(&self, trailer: &str) -> Result<Option<String>> {
        let state = self.lock()?;
        Ok(state.ancestry().into_iter().find(|id| {
            state
                .commits
                .get(id)
                .is_some_and(|s| s.message.lines().any(|line| line.trim() == trailer))
        }))
    }

    async fn parent(&self, commit: &str) -> Result<Option<String>> {
        Ok(self.lock()?.snapshot(commit)?.parent.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, contents: &str) -> ArtifactFile {
        ArtifactFile {
            path: path.into(),
            contents: contents.into(),
        }
    }

    async fn vcs_on_branch() -> MemoryVcs {
        let vcs = MemoryVcs::new(TrunkGuard::default());
        vcs.create_branch("dna-auto/evolution").await.unwrap();
        vcs
    }

    #[tokio::test]
    async fn trunk_is_refused() {
        let vcs = MemoryVcs::new(TrunkGuard::default());
        assert!(matches!(
            vcs.create_branch("main").await,
            Err(DnaCommitError::TrunkWriteForbidden { .. })
        ));
        // Still on main from construction: commits there are refused too.
        vcs.write_artifact(&[file("a.txt", "x")]).await.unwrap_err();
        assert!(vcs.commit("sneaky").await.is_err());
        assert!(vcs.branch_tree("main").unwrap().is_empty());
    }

    #[tokio::test]
    async fn revert_restores_parent_tree() {
        let vcs = vcs_on_branch().await;
        vcs.write_artifact(&[file("voice/app.py", "v1\n")]).await.unwrap();
        vcs.commit("base").await.unwrap();
        let before = vcs.tree().unwrap();

        vcs.write_artifact(&[file("voice/app.py", "v2\n"), file("voice/new.py", "n\n")])
            .await
            .unwrap();
        let c = vcs.commit("change").await.unwrap();
        assert_eq!(vcs.files_changed(&c).await.unwrap().len(), 2);

        let outcome = vcs.revert(&c).await.unwrap();
        assert!(matches!(outcome, RevertOutcome::Clean(_)));
        assert_eq!(vcs.tree().unwrap(), before);
    }

    #[tokio::test]
    async fn overlapping_later_commit_conflicts() {
        let vcs = vcs_on_branch().await;
        vcs.write_artifact(&[file("a.py", "1")]).await.unwrap();
        let first = vcs.commit("first").await.unwrap();
        vcs.write_artifact(&[file("a.py", "2")]).await.unwrap();
        let second = vcs.commit("second").await.unwrap();

        assert_eq!(vcs.commits_after(&first).await.unwrap(), vec![second]);
        assert!(matches!(
            vcs.revert(&first).await.unwrap(),
            RevertOutcome::Conflict(_)
        ));
        assert_eq!(vcs.tree().unwrap()["a.py"], "2");
    }

    #[tokio::test]
    async fn discard_drops_staged_files() {
        let vcs = vcs_on_branch().await;
        vcs.write_artifact(&[file("stray.py", "x")]).await.unwrap();
        vcs.discard().await.unwrap();
        vcs.write_artifact(&[file("kept.py", "y")]).await.unwrap();
        let c = vcs.commit("kept only").await.unwrap();
        assert_eq!(vcs.files_changed(&c).await.unwrap(), vec!["kept.py"]);
    }

    #[tokio::test]
    async fn trailer_lookup_matches_whole_lines() {
        let vcs = vcs_on_branch().await;
        vcs.write_artifact(&[file("a.py", "1")]).await.unwrap();
        let first = vcs.commit("Add a\n\nDNA-commit-Item: abc").await.unwrap();
        vcs.write_artifact(&[file("b.py", "1")]).await.unwrap();
        let second = vcs.commit("Add b\n\nDNA-commit-Item: abcd").await.unwrap();

        assert_eq!(vcs.find_trailer("DNA-commit-Item: abc").await.unwrap(), Some(first.clone()));
        assert_eq!(vcs.find_trailer("DNA-commit-Item: abcd").await.unwrap(), Some(second.clone()));
        assert_eq!(vcs.find_trailer("DNA-commit-Item: zzz").await.unwrap(), None);
        assert_eq!(vcs.parent(&second).await.unwrap(), Some(first.clone()));
        assert_eq!(vcs.parent(&first).await.unwrap(), None);

        // Reverts carry only the subject, so the trailer is not repeated.
        vcs.revert(&second).await.unwrap();
        assert_eq!(vcs.find_trailer("DNA-commit-Item: abcd").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn empty_commit_is_an_error() {
        let vcs = vcs_on_branch().await;
        assert!(vcs.commit("nothing").await.is_err());
        assert_eq!(vcs.head().await.unwrap(), None);
    }
}
