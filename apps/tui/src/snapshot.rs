//! Point-in-time view of the store that the screens render.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dnacommit_shared::{
    Approval, KnowledgeItem, Result, RunRecord, Status, StrategyDelta, StrategyParams,
};
use dnacommit_storage::{ItemFilter, Storage};

/// Runs listed on the runs tab.
const RECENT_RUNS: usize = 20;

#[derive(Debug, Clone, Default)]
pub(crate) struct Snapshot {
    pub counts: BTreeMap<Status, u64>,
    pub pending: Vec<KnowledgeItem>,
    pub runs: Vec<RunRecord>,
    pub deltas: Vec<StrategyDelta>,
    pub strategy: Option<StrategyParams>,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub(crate) async fn load(store: &Storage) -> Result<Self> {
        let counts = store.count_by_status().await?;
        let pending = store
            .list(&ItemFilter::statuses(&[Status::ReviewPassed]).approval(Approval::Pending))
            .await?;
        let runs = store.list_runs(RECENT_RUNS).await?;
        let deltas = store.list_deltas(None).await?;
        let strategy = store.current_strategy().await?;
        tracing::debug!(runs = runs.len(), deltas = deltas.len(), "snapshot loaded");
        Ok(Self {
            counts,
            pending,
            runs,
            deltas,
            strategy,
            loaded_at: Some(Utc::now()),
        })
    }

    pub(crate) fn count(&self, status: Status) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub(crate) fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnacommit_shared::{Payload, RawCandidate, RunMode, Source};
    use uuid::Uuid;

    #[tokio::test]
    async fn loads_from_readonly_store() {
        let path = std::env::temp_dir().join(format!("dna_tui_{}.db", Uuid::now_v7()));
        {
            let store = Storage::open(&path).await.unwrap();
            let candidate = RawCandidate {
                source: Source::RepoTrend,
                payload: Payload {
                    title: "voice pipeline".into(),
                    locator: "https://github.com/example/voice".into(),
                    content: String::new(),
                    query: None,
                    metadata: serde_json::Value::Null,
                },
            };
            store
                .put(&KnowledgeItem::collected(candidate, Utc::now()))
                .await
                .unwrap();
            store
                .insert_run(&RunRecord::start(RunMode::Collect, Utc::now()))
                .await
                .unwrap();
        }

        let store = Storage::open_readonly(&path).await.unwrap();
        let snapshot = Snapshot::load(&store).await.unwrap();
        assert_eq!(snapshot.count(Status::Collected), 1);
        assert_eq!(snapshot.total(), 1);
        assert_eq!(snapshot.runs.len(), 1);
        assert!(snapshot.pending.is_empty());
        assert!(snapshot.loaded_at.is_some());
    }
}
