use dnacommit_shared::{AppConfig, BUILTIN_TRUNK_BRANCHES, DnaCommitError, Result};
use tracing::error;

/// Refuses writes to trunk branches.
///
/// `main`, `master` and `trunk` are always protected; configuration can only
/// add names.
#[derive(Debug, Clone, Default)]
pub struct TrunkGuard {
    extra: Vec<String>,
}

impl TrunkGuard {
    pub fn new(extra: impl IntoIterator<Item = String>) -> Self {
        Self {
            extra: extra.into_iter().collect(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.repository.trunk_branches.iter().cloned())
    }

    pub fn is_trunk(&self, branch: &str) -> bool {
        let name = branch.strip_prefix("refs/heads/").unwrap_or(branch);
        BUILTIN_TRUNK_BRANCHES.contains(&name) || self.extra.iter().any(|b| b == name)
    }

    pub fn check(&self, branch: &str) -> Result<()> {
        if self.is_trunk(branch) {
            error!(branch, "blocked write to trunk branch");
            return Err(DnaCommitError::TrunkWriteForbidden {
                branch: branch.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_cannot_be_removed() {
        let guard = TrunkGuard::new(vec!["release".to_string()]);
        assert!(guard.is_trunk("main"));
        assert!(guard.is_trunk("refs/heads/master"));
        assert!(guard.is_trunk("release"));
        assert!(!guard.is_trunk("dna-auto/evolution"));
        assert!(matches!(
            guard.check("trunk"),
            Err(DnaCommitError::TrunkWriteForbidden { .. })
        ));
    }
}
