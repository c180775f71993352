//! `git` command-line backend.
//!
//! Works on a dedicated worktree checked out on the automation branch, so the
//! operator's checkout is never touched. Nothing is ever pushed.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use dnacommit_shared::{AppConfig, ArtifactFile, DnaCommitError, Result, expand_home};

use crate::{RevertOutcome, TrunkGuard, VcsBackend, validate_artifact_path};

/// Git backend driving the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    repo: PathBuf,
    worktree: PathBuf,
    author_name: String,
    author_email: String,
    guard: TrunkGuard,
}

impl GitCli {
    pub fn new(repo: impl Into<PathBuf>, worktree: impl Into<PathBuf>, author: &str, guard: TrunkGuard) -> Self {
        let (author_name, author_email) = parse_author(author);
        Self {
            repo: repo.into(),
            worktree: worktree.into(),
            author_name,
            author_email,
            guard,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            expand_home(&config.repository.path),
            expand_home(&config.repository.worktree),
            &config.repository.author,
            TrunkGuard::from_config(config),
        )
    }

    pub fn worktree(&self) -> &Path {
        &self.worktree
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<std::process::Output> {
        debug!(cwd = %cwd.display(), ?args, "git");
        Command::new("git")
            .args(args)
            .current_dir(cwd)
            .env("GIT_AUTHOR_NAME", &self.author_name)
            .env("GIT_AUTHOR_EMAIL", &self.author_email)
            .env("GIT_COMMITTER_NAME", &self.author_name)
            .env("GIT_COMMITTER_EMAIL", &self.author_email)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DnaCommitError::Vcs(format!("failed to run git: {e}")))
    }

    /// Run git and return trimmed stdout, failing on a non-zero exit.
    async fn git_ok(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let out = self.git(cwd, args).await?;
        if !out.status.success() {
            return Err(DnaCommitError::Vcs(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    async fn current_branch(&self) -> Result<String> {
        self.git_ok(&self.worktree, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        let out = self
            .git(&self.repo, &["rev-parse", "--verify", "--quiet", &reference])
            .await?;
        Ok(out.status.success())
    }
}

#[async_trait]
impl VcsBackend for GitCli {
    fn name(&self) -> &str {
        "git"
    }

    #[instrument(skip_all, fields(branch = branch))]
    async fn create_branch(&self, branch: &str) -> Result<()> {
        self.guard.check(branch)?;

        if self.worktree.join(".git").exists() {
            if self.current_branch().await? != branch {
                self.git_ok(&self.worktree, &["checkout", branch]).await?;
            }
            return Ok(());
        }

        if let Some(parent) = self.worktree.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DnaCommitError::io(parent, e))?;
        }
        let worktree = self.worktree.to_string_lossy().to_string();
        if self.branch_exists(branch).await? {
            self.git_ok(&self.repo, &["worktree", "add", &worktree, branch])
                .await?;
        } else {
            self.git_ok(&self.repo, &["worktree", "add", "-b", branch, &worktree])
                .await?;
        }
        info!(worktree = %self.worktree.display(), "automation worktree ready");
        Ok(())
    }

    async fn write_artifact(&self, files: &[ArtifactFile]) -> Result<()> {
        for file in files {
            validate_artifact_path(&file.path)?;
        }
        self.guard.check(&self.current_branch().await?)?;

        for file in files {
            let target = self.worktree.join(&file.path);
            if let Some(dir) = target.parent() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| DnaCommitError::io(dir, e))?;
            }
            tokio::fs::write(&target, &file.contents)
                .await
                .map_err(|e| DnaCommitError::io(&target, e))?;
            self.git_ok(&self.worktree, &["add", "--", &file.path]).await?;
        }
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<String> {
        let branch = self.current_branch().await?;
        self.guard.check(&branch)?;
        self.git_ok(&self.worktree, &["commit", "--no-verify", "-m", message])
            .await?;
        let id = self.git_ok(&self.worktree, &["rev-parse", "HEAD"]).await?;
        info!(commit = %id, %branch, "committed");
        Ok(id)
    }

    async fn discard(&self) -> Result<()> {
        if self.head().await?.is_some() {
            self.git_ok(&self.worktree, &["reset", "-q", "--hard", "HEAD"])
                .await?;
        } else {
            self.git_ok(&self.worktree, &["rm", "-r", "-q", "--cached", "--ignore-unmatch", "."])
                .await?;
        }
        self.git_ok(&self.worktree, &["clean", "-f", "-d", "-q"]).await?;
        debug!(worktree = %self.worktree.display(), "worktree reset to head");
        Ok(())
    }

    async fn revert(&self, commit: &str) -> Result<RevertOutcome> {
        self.guard.check(&self.current_branch().await?)?;
        let out = self
            .git(&self.worktree, &["revert", "--no-edit", commit])
            .await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            warn!(%commit, error = %stderr, "revert failed, aborting");
            let _ = self.git(&self.worktree, &["revert", "--abort"]).await;
            return Ok(RevertOutcome::Conflict(stderr));
        }
        let id = self.git_ok(&self.worktree, &["rev-parse", "HEAD"]).await?;
        Ok(RevertOutcome::Clean(id))
    }

    async fn head(&self) -> Result<Option<String>> {
        let out = self
            .git(&self.worktree, &["rev-parse", "--verify", "--quiet", "HEAD"])
            .await?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    async fn files_changed(&self, commit: &str) -> Result<Vec<String>> {
        let out = self
            .git_ok(
                &self.worktree,
                &["diff-tree", "--root", "--no-commit-id", "--name-only", "-r", commit],
            )
            .await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    async fn commits_after(&self, commit: &str) -> Result<Vec<String>> {
        let range = format!("{commit}..HEAD");
        let out = self.git_ok(&self.worktree, &["rev-list", &range]).await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    async fn find_trailer(&self, trailer: &str) -> Result<Option<String>> {
        if self.head().await?.is_none() {
            return Ok(None);
        }
        let grep = format!("--grep={trailer}");
        let candidates = self
            .git_ok(&self.worktree, &["log", "--format=%H", "--fixed-strings", &grep])
            .await?;
        // --grep matches substrings; keep only whole-line trailers.
        for id in candidates.lines() {
            let body = self
                .git_ok(&self.worktree, &["log", "-1", "--format=%B", id])
                .await?;
            if body.lines().any(|line| line.trim() == trailer) {
                return Ok(Some(id.to_string()));
            }
        }
        Ok(None)
    }

    async fn parent(&self, commit: &str) -> Result<Option<String>> {
        let first_parent = format!("{commit}^");
        let out = self
            .git(&self.worktree, &["rev-parse", "--verify", "--quiet", &first_parent])
            .await?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }
}

/// Split `Name <email>` into its parts.
fn parse_author(author: &str) -> (String, String) {
    match (author.find('<'), author.rfind('>')) {
        (Some(open), Some(close)) if open < close => (
            author[..open].trim().to_string(),
            author[open + 1..close].trim().to_string(),
        ),
        _ => (author.trim().to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn author_parsing() {
        assert_eq!(
            parse_author("DNA-commit <dnacommit@localhost>"),
            ("DNA-commit".to_string(), "dnacommit@localhost".to_string())
        );
        assert_eq!(parse_author("bot"), ("bot".to_string(), String::new()));
    }

    async fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn trunk_branch_refused_before_touching_git() {
        let git = GitCli::new("/nonexistent", "/nonexistent-wt", "bot <b@x>", TrunkGuard::default());
        assert!(matches!(
            git.create_branch("master").await,
            Err(DnaCommitError::TrunkWriteForbidden { .. })
        ));
    }

    #[tokio::test]
    async fn commit_and_revert_on_worktree() {
        if !git_available().await {
            return;
        }
        let root = std::env::temp_dir().join(format!("dnacommit-git-{}", uuid::Uuid::now_v7()));
        let repo = root.join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let git = GitCli::new(&repo, root.join("wt"), "bot <bot@localhost>", TrunkGuard::default());

        git.git_ok(&repo, &["init", "-q"]).await.unwrap();
        std::fs::write(repo.join("README.md"), "hello\n").unwrap();
        git.git_ok(&repo, &["add", "README.md"]).await.unwrap();
        git.git_ok(&repo, &["commit", "-q", "-m", "init"]).await.unwrap();

        git.create_branch("dna-auto/evolution").await.unwrap();
        let base = git.head().await.unwrap().unwrap();
        git.write_artifact(&[ArtifactFile {
            path: "voice/webrtc.py".into(),
            contents: "import aiortc\n".into(),
        }])
        .await
        .unwrap();
        let commit = git.commit("Add aiortc transport").await.unwrap();

        assert_eq!(git.files_changed(&commit).await.unwrap(), vec!["voice/webrtc.py"]);
        assert_eq!(git.commits_after(&base).await.unwrap(), vec![commit.clone()]);

        assert!(matches!(git.revert(&commit).await.unwrap(), RevertOutcome::Clean(_)));
        assert!(!git.worktree().join("voice/webrtc.py").exists());
        // The operator's checkout stays on its original branch.
        let operator = git
            .git_ok(&repo, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .unwrap();
        assert_ne!(operator, "dna-auto/evolution");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn failed_write_does_not_leak_into_next_commit() {
        if !git_available().await {
            return;
        }
        let root = std::env::temp_dir().join(format!("dnacommit-git-{}", uuid::Uuid::now_v7()));
        let repo = root.join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let git = GitCli::new(&repo, root.join("wt"), "bot <bot@localhost>", TrunkGuard::default());

        git.git_ok(&repo, &["init", "-q"]).await.unwrap();
        std::fs::write(repo.join(".gitignore"), "*.log\n").unwrap();
        git.git_ok(&repo, &["add", ".gitignore"]).await.unwrap();
        git.git_ok(&repo, &["commit", "-q", "-m", "init"]).await.unwrap();
        git.create_branch("dna-auto/evolution").await.unwrap();

        // The ignored second file makes `git add` fail after the first is staged.
        let failed = git
            .write_artifact(&[
                ArtifactFile {
                    path: "item1.py".into(),
                    contents: "one\n".into(),
                },
                ArtifactFile {
                    path: "item1.log".into(),
                    contents: "noise\n".into(),
                },
            ])
            .await;
        assert!(failed.is_err());
        git.discard().await.unwrap();
        assert!(!git.worktree().join("item1.py").exists());

        git.write_artifact(&[ArtifactFile {
            path: "item2.py".into(),
            contents: "two\n".into(),
        }])
        .await
        .unwrap();
        let commit = git.commit("Add item2\n\nDNA-commit-Item: item2").await.unwrap();
        assert_eq!(git.files_changed(&commit).await.unwrap(), vec!["item2.py"]);

        assert_eq!(
            git.find_trailer("DNA-commit-Item: item2").await.unwrap(),
            Some(commit.clone())
        );
        assert_eq!(git.find_trailer("DNA-commit-Item: item").await.unwrap(), None);
        assert!(git.parent(&commit).await.unwrap().is_some());

        let _ = std::fs::remove_dir_all(&root);
    }
}
