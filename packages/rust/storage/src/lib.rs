//! Turso Embedded / libSQL Knowledge Store.
//!
//! The [`Storage`] struct wraps a libSQL database holding every discovered
//! item and its lifecycle state, the per-item transition audit trail,
//! generated artifacts, run history and the adaptive strategy tables.
//!
//! **Access rules:**
//! - Orchestrator / CLI: read-write (sole writer) via [`Storage::open`]
//! - Dashboard: read-only via [`Storage::open_readonly`]
//!
//! All status changes go through a compare-and-set on the stored status inside
//! a transaction, so two concurrent transitions of the same item produce
//! exactly one winner.

mod migrations;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use dnacommit_shared::{
    Approval, Artifact, ArtifactFile, ArtifactRef, CommitRef, DeltaStatus, DnaCommitError,
    Evaluation, ItemId, KnowledgeItem, Payload, Result, ReviewNotes, RunId, RunMode, RunOutcome,
    RunRecord, Source, Stage, StageCounts, Status, StrategyDelta, StrategyParams, TransitionKind,
    TransitionRecord,
};
use libsql::{Connection, Database, Transaction, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use uuid::Uuid;

const ITEM_COLUMNS: &str = "id, source, status, payload_json, evaluation_json, attempts, \
     artifact_ref, review_json, commit_json, approval, reason, created_at, \
     last_transition_at, deleted_at";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Mutex<Connection>,
    readonly: bool,
}

/// Query filter for [`Storage::list`].
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    /// Only items in one of these statuses (empty = any).
    pub statuses: Vec<Status>,
    /// Only items younger than this.
    pub max_age: Option<Duration>,
    /// Only items older than this.
    pub older_than: Option<Duration>,
    /// Include soft-deleted items.
    pub include_deleted: bool,
    pub source: Option<Source>,
    pub approval: Option<Approval>,
    pub limit: Option<usize>,
}

impl ItemFilter {
    pub fn statuses(statuses: &[Status]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Self::default()
        }
    }

    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age = Some(age);
        self
    }

    pub fn older_than(mut self, age: Duration) -> Self {
        self.older_than = Some(age);
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn approval(mut self, approval: Approval) -> Self {
        self.approval = Some(approval);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Fields written together with a status change. `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub evaluation: Option<Evaluation>,
    pub artifact_ref: Option<ArtifactRef>,
    pub review_notes: Option<ReviewNotes>,
    pub commit_ref: Option<CommitRef>,
    pub approval: Option<Approval>,
}

/// Aggregate counts returned by [`Storage::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Current item count per status (soft-deleted included).
    pub by_status: BTreeMap<Status, u64>,
    /// Items created within the window.
    pub collected: u64,
    /// Transitions into each status within the window.
    pub transitions: BTreeMap<Status, u64>,
    /// Retries recorded within the window.
    pub retries: u64,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DnaCommitError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn: Mutex::new(conn),
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode (dashboard).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DnaCommitError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn: Mutex::new(conn),
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;
        let conn = self.conn.lock().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    DnaCommitError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let conn = self.conn.lock().await;
        let result = conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(DnaCommitError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Item operations
    // -----------------------------------------------------------------------

    /// Insert a new item. Ids are never reused, even after purge.
    pub async fn put(&self, item: &KnowledgeItem) -> Result<()> {
        self.check_writable()?;
        if item.generated_artifact_ref.is_some() && !item.status.has_artifact() {
            return Err(DnaCommitError::validation(format!(
                "item {} in status {} cannot carry an artifact",
                item.id, item.status
            )));
        }

        let conn = self.conn.lock().await;
        if id_exists(&conn, &item.id).await? {
            return Err(DnaCommitError::DuplicateItem {
                id: item.id.clone(),
            });
        }

        conn.execute(
            "INSERT INTO items (id, source, status, payload_json, query, evaluation_json,
                aggregate, attempts, artifact_ref, review_json, commit_json, approval, reason,
                created_at, last_transition_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                item.id.as_str(),
                item.source.as_str(),
                item.status.as_str(),
                to_json(&item.payload)?,
                item.payload.query.as_deref(),
                opt_json(item.evaluation.as_ref())?,
                item.evaluation.map(|e| e.aggregate),
                i64::from(item.attempts),
                item.generated_artifact_ref.as_ref().map(|r| r.0.clone()),
                opt_json(item.review_notes.as_ref())?,
                opt_json(item.commit_ref.as_ref())?,
                item.approval.as_str(),
                item.reason.as_deref(),
                item.created_at.timestamp_millis(),
                item.last_transition_at.timestamp_millis(),
                item.deleted_at.map(|d| d.timestamp_millis()),
            ],
        )
        .await
        .map_err(storage_err)?;

        tracing::debug!(item_id = %item.id, source = %item.source, "item stored");
        Ok(())
    }

    /// Get an item by id (soft-deleted items included).
    pub async fn get(&self, id: &ItemId) -> Result<Option<KnowledgeItem>> {
        let conn = self.conn.lock().await;
        fetch_item(&conn, id).await
    }

    /// Get an item by id, failing with `NotFound` when absent.
    pub async fn require(&self, id: &ItemId) -> Result<KnowledgeItem> {
        self.get(id).await?.ok_or_else(|| DnaCommitError::NotFound {
            id: id.to_string(),
        })
    }

    /// Whether the id has ever been stored (live, soft-deleted or purged).
    pub async fn contains(&self, id: &ItemId) -> Result<bool> {
        let conn = self.conn.lock().await;
        id_exists(&conn, id).await
    }

    /// List items matching `filter`, oldest first.
    pub async fn list(&self, filter: &ItemFilter) -> Result<Vec<KnowledgeItem>> {
        let now = Utc::now();
        // Only enum names and integers are interpolated.
        let mut clauses: Vec<String> = Vec::new();
        if !filter.statuses.is_empty() {
            let set = filter
                .statuses
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            clauses.push(format!("status IN ({set})"));
        }
        if !filter.include_deleted {
            clauses.push(format!("status != '{}'", Status::Deleted.as_str()));
        }
        if let Some(age) = filter.max_age {
            clauses.push(format!("created_at > {}", (now - age).timestamp_millis()));
        }
        if let Some(age) = filter.older_than {
            clauses.push(format!("created_at < {}", (now - age).timestamp_millis()));
        }
        if let Some(source) = filter.source {
            clauses.push(format!("source = '{}'", source.as_str()));
        }
        if let Some(approval) = filter.approval {
            clauses.push(format!("approval = '{}'", approval.as_str()));
        }

        let mut sql = format!("SELECT {ITEM_COLUMNS} FROM items");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at, id");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.conn.lock().await;
        let mut rows = conn.query(&sql, params![]).await.map_err(storage_err)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_item(&row)?);
        }
        Ok(results)
    }

    /// Transition an item from whatever status it is in now.
    pub async fn update_status(
        &self,
        id: &ItemId,
        to: Status,
        reason: &str,
    ) -> Result<KnowledgeItem> {
        let current = self.require(id).await?;
        self.update_status_from(id, current.status, to, reason, TransitionPatch::default())
            .await
    }

    /// Compare-and-set transition: succeeds only if the stored status is still
    /// `expected` and `expected -> to` is a lifecycle edge. The status change
    /// and its audit row are written in one transaction.
    pub async fn update_status_from(
        &self,
        id: &ItemId,
        expected: Status,
        to: Status,
        reason: &str,
        patch: TransitionPatch,
    ) -> Result<KnowledgeItem> {
        self.check_writable()?;
        if patch.artifact_ref.is_some() && !to.has_artifact() {
            return Err(DnaCommitError::validation(format!(
                "status {to} cannot carry an artifact"
            )));
        }

        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(storage_err)?;
        let outcome = transition_in(&tx, id, expected, to, reason, &patch).await;
        finish(tx, outcome).await?;

        tracing::info!(item_id = %id, from = %expected, to = %to, reason, "status transition");

        fetch_item(&conn, id)
            .await?
            .ok_or_else(|| DnaCommitError::NotFound { id: id.to_string() })
    }

    /// Record a failed attempt at the current stage without changing status.
    /// Returns the new attempt count.
    pub async fn record_retry(&self, id: &ItemId, expected: Status, reason: &str) -> Result<u32> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(storage_err)?;
        let outcome = retry_in(&tx, id, expected, reason).await;
        let attempts = finish(tx, outcome).await?;

        tracing::warn!(
            item_id = %id,
            status = %expected,
            attempts,
            reason,
            "attempt failed, will retry"
        );
        Ok(attempts)
    }

    /// Change the manual-approval flag of a `review_passed` item.
    pub async fn set_approval(&self, id: &ItemId, approval: Approval, reason: &str) -> Result<()> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(storage_err)?;
        let outcome = approval_in(&tx, id, approval, reason).await;
        finish(tx, outcome).await?;

        tracing::info!(item_id = %id, approval = approval.as_str(), reason, "approval updated");
        Ok(())
    }

    /// Soft-delete an item. Returns `false` if it was already deleted.
    pub async fn soft_delete(&self, id: &ItemId, reason: &str) -> Result<bool> {
        let current = self.require(id).await?;
        if current.status == Status::Deleted {
            return Ok(false);
        }
        let result = self
            .update_status_from(
                id,
                current.status,
                Status::Deleted,
                reason,
                TransitionPatch::default(),
            )
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(DnaCommitError::InvalidTransition { from, .. }) if from == Status::Deleted => {
                // Lost a race against another delete.
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Physically remove items soft-deleted longer ago than `older_than`,
    /// with their artifacts. A tombstone keeps each id reserved.
    pub async fn purge(&self, older_than: Duration) -> Result<u64> {
        self.check_writable()?;
        let now = Utc::now();
        let cutoff = (now - older_than).timestamp_millis();

        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(storage_err)?;
        let outcome = purge_in(&tx, now, cutoff).await;
        let purged = finish(tx, outcome).await?;

        tracing::info!(purged, "purged soft-deleted items");
        Ok(purged)
    }

    /// Audit trail of one item, oldest first.
    pub async fn history(&self, id: &ItemId) -> Result<Vec<TransitionRecord>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT item_id, kind, from_status, to_status, reason, at
                 FROM transitions WHERE item_id = ?1 ORDER BY id",
                params![id.as_str()],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let kind: String = row.get(1).map_err(storage_err)?;
            results.push(TransitionRecord {
                item_id: ItemId(row.get::<String>(0).map_err(storage_err)?),
                kind: parse_kind(&kind)?,
                from: row.get::<String>(2).map_err(storage_err)?.parse()?,
                to: row.get::<String>(3).map_err(storage_err)?.parse()?,
                reason: row.get(4).map_err(storage_err)?,
                at: from_millis(row.get(5).map_err(storage_err)?)?,
            });
        }
        Ok(results)
    }

    /// Current item count per status.
    pub async fn count_by_status(&self) -> Result<BTreeMap<Status, u64>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT status, COUNT(*) FROM items GROUP BY status", params![])
            .await
            .map_err(storage_err)?;

        let mut counts = BTreeMap::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let status: Status = row.get::<String>(0).map_err(storage_err)?.parse()?;
            counts.insert(status, row.get::<u64>(1).map_err(storage_err)?);
        }
        Ok(counts)
    }

    /// Aggregate counts over the trailing `window`.
    pub async fn stats(&self, window: Duration) -> Result<StoreStats> {
        let since = (Utc::now() - window).timestamp_millis();
        let by_status = self.count_by_status().await?;

        let conn = self.conn.lock().await;
        let collected = query_count(
            &conn,
            "SELECT COUNT(*) FROM items WHERE created_at >= ?1",
            since,
        )
        .await?;
        let retries = query_count(
            &conn,
            "SELECT COUNT(*) FROM transitions WHERE kind = 'retry' AND at >= ?1",
            since,
        )
        .await?;

        let mut rows = conn
            .query(
                "SELECT to_status, COUNT(*) FROM transitions
                 WHERE kind IN ('transition', 'delete') AND at >= ?1
                 GROUP BY to_status",
                params![since],
            )
            .await
            .map_err(storage_err)?;
        let mut transitions = BTreeMap::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let status: Status = row.get::<String>(0).map_err(storage_err)?.parse()?;
            transitions.insert(status, row.get::<u64>(1).map_err(storage_err)?);
        }

        Ok(StoreStats {
            by_status,
            collected,
            transitions,
            retries,
        })
    }

    // -----------------------------------------------------------------------
    // Artifact operations
    // -----------------------------------------------------------------------

    /// Store a generated artifact.
    pub async fn put_artifact(&self, artifact: &Artifact) -> Result<()> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO artifacts (artifact_ref, item_id, files_json, commit_message, summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                artifact.artifact_ref.0.as_str(),
                artifact.item_id.as_str(),
                to_json(&artifact.files)?,
                artifact.commit_message.as_str(),
                artifact.summary.as_str(),
                Utc::now().timestamp_millis(),
            ],
        )
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    /// Load a stored artifact.
    pub async fn get_artifact(&self, artifact_ref: &ArtifactRef) -> Result<Option<Artifact>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT artifact_ref, item_id, files_json, commit_message, summary
                 FROM artifacts WHERE artifact_ref = ?1",
                params![artifact_ref.0.as_str()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => {
                let files: Vec<ArtifactFile> =
                    from_json(&row.get::<String>(2).map_err(storage_err)?)?;
                Ok(Some(Artifact {
                    artifact_ref: ArtifactRef(row.get(0).map_err(storage_err)?),
                    item_id: ItemId(row.get(1).map_err(storage_err)?),
                    files,
                    commit_message: row.get(3).map_err(storage_err)?,
                    summary: row.get(4).map_err(storage_err)?,
                }))
            }
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Run records
    // -----------------------------------------------------------------------

    /// Insert a run record at run start.
    pub async fn insert_run(&self, run: &RunRecord) -> Result<()> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO run_records (run_id, mode, started_at, ended_at, stages_json, outcome_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.run_id.to_string(),
                run.mode.as_str(),
                run.started_at.timestamp_millis(),
                run.ended_at.map(|d| d.timestamp_millis()),
                to_json(&run.stage_results)?,
                to_json(&run.outcome)?,
            ],
        )
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    /// Overwrite the counts, end time and outcome of a run record.
    pub async fn update_run(&self, run: &RunRecord) -> Result<()> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE run_records SET ended_at = ?1, stages_json = ?2, outcome_json = ?3
                 WHERE run_id = ?4",
                params![
                    run.ended_at.map(|d| d.timestamp_millis()),
                    to_json(&run.stage_results)?,
                    to_json(&run.outcome)?,
                    run.run_id.to_string(),
                ],
            )
            .await
            .map_err(storage_err)?;
        if affected == 0 {
            return Err(DnaCommitError::NotFound {
                id: run.run_id.to_string(),
            });
        }
        Ok(())
    }

    /// The `limit` most recent runs, newest first.
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT run_id, mode, started_at, ended_at, stages_json, outcome_json
                 FROM run_records ORDER BY started_at DESC, run_id DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_run(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Strategy
    // -----------------------------------------------------------------------

    /// Latest strategy parameters, if any version has been saved.
    pub async fn current_strategy(&self) -> Result<Option<StrategyParams>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT version, keywords_json, repo_topics_json, acceptance_threshold
                 FROM strategy_params ORDER BY version DESC LIMIT 1",
                params![],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(StrategyParams {
                version: row.get(0).map_err(storage_err)?,
                keywords: from_json(&row.get::<String>(1).map_err(storage_err)?)?,
                repo_topics: from_json(&row.get::<String>(2).map_err(storage_err)?)?,
                acceptance_threshold: row.get(3).map_err(storage_err)?,
            })),
            None => Ok(None),
        }
    }

    /// Save a new strategy version (seed or manual).
    pub async fn save_strategy(&self, params: &StrategyParams) -> Result<()> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        insert_strategy(&conn, params, None).await
    }

    /// Persist a freshly proposed delta.
    pub async fn insert_delta(&self, delta: &StrategyDelta) -> Result<()> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO strategy_deltas (id, status, body_json, created_at, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                delta.id.to_string(),
                delta.status.as_str(),
                to_json(delta)?,
                delta.created_at.timestamp_millis(),
                delta.applied_at.map(|d| d.timestamp_millis()),
            ],
        )
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    pub async fn get_delta(&self, id: Uuid) -> Result<Option<StrategyDelta>> {
        let conn = self.conn.lock().await;
        fetch_delta(&conn, id).await
    }

    /// Deltas, newest first, optionally filtered by status.
    pub async fn list_deltas(&self, status: Option<DeltaStatus>) -> Result<Vec<StrategyDelta>> {
        let conn = self.conn.lock().await;
        let mut rows = match status {
            Some(s) => conn
                .query(
                    "SELECT body_json FROM strategy_deltas WHERE status = ?1
                     ORDER BY created_at DESC, id DESC",
                    params![s.as_str()],
                )
                .await
                .map_err(storage_err)?,
            None => conn
                .query(
                    "SELECT body_json FROM strategy_deltas ORDER BY created_at DESC, id DESC",
                    params![],
                )
                .await
                .map_err(storage_err)?,
        };

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(from_json(&row.get::<String>(0).map_err(storage_err)?)?);
        }
        Ok(results)
    }

    /// Mark a proposed delta applied and save the resulting parameters, atomically.
    pub async fn apply_delta(&self, delta: &StrategyDelta, params: &StrategyParams) -> Result<()> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(storage_err)?;

        let outcome = async {
            finish_delta(&tx, delta, DeltaStatus::Applied).await?;
            insert_strategy(&tx, params, Some(delta.id)).await
        }
        .await;
        finish(tx, outcome).await?;

        tracing::info!(delta_id = %delta.id, version = params.version, "strategy delta applied");
        Ok(())
    }

    /// Mark a proposed delta dismissed.
    pub async fn dismiss_delta(&self, delta: &StrategyDelta) -> Result<()> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        finish_delta(&conn, delta, DeltaStatus::Dismissed).await?;
        tracing::info!(delta_id = %delta.id, "strategy delta dismissed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn storage_err(e: impl std::fmt::Display) -> DnaCommitError {
    DnaCommitError::Storage(e.to_string())
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| DnaCommitError::Storage(format!("encode: {e}")))
}

fn opt_json<T: Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value.map(to_json).transpose()
}

fn from_json<T: DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| DnaCommitError::Storage(format!("decode: {e}")))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DnaCommitError::Storage(format!("invalid timestamp: {ms}")))
}

fn parse_kind(s: &str) -> Result<TransitionKind> {
    match s {
        "transition" => Ok(TransitionKind::Transition),
        "retry" => Ok(TransitionKind::Retry),
        "delete" => Ok(TransitionKind::Delete),
        "approval" => Ok(TransitionKind::Approval),
        other => Err(DnaCommitError::Storage(format!(
            "unknown transition kind '{other}'"
        ))),
    }
}

/// Commit on success, roll back on failure.
async fn finish<T>(tx: Transaction, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => {
            tx.commit().await.map_err(storage_err)?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "transaction rollback failed");
            }
            Err(e)
        }
    }
}

async fn transition_in(
    conn: &Connection,
    id: &ItemId,
    expected: Status,
    to: Status,
    reason: &str,
    patch: &TransitionPatch,
) -> Result<()> {
    let current = fetch_item(conn, id)
        .await?
        .ok_or_else(|| DnaCommitError::NotFound { id: id.to_string() })?;
    if current.status != expected || !expected.can_transition_to(to) {
        return Err(DnaCommitError::InvalidTransition {
            id: id.clone(),
            from: current.status,
            to,
        });
    }
    if to == Status::Committed {
        check_commit_preconditions(&current, patch)?;
    }

    let now = Utc::now();
    let deleted_at = (to == Status::Deleted).then(|| now.timestamp_millis());
    let affected = conn
        .execute(
            "UPDATE items SET
                status = ?1,
                attempts = 0,
                reason = ?2,
                last_transition_at = ?3,
                evaluation_json = COALESCE(?4, evaluation_json),
                aggregate = COALESCE(?5, aggregate),
                artifact_ref = COALESCE(?6, artifact_ref),
                review_json = COALESCE(?7, review_json),
                commit_json = COALESCE(?8, commit_json),
                approval = COALESCE(?9, approval),
                deleted_at = COALESCE(?10, deleted_at)
             WHERE id = ?11 AND status = ?12",
            params![
                to.as_str(),
                reason,
                now.timestamp_millis(),
                opt_json(patch.evaluation.as_ref())?,
                patch.evaluation.map(|e| e.aggregate),
                patch.artifact_ref.as_ref().map(|r| r.0.clone()),
                opt_json(patch.review_notes.as_ref())?,
                opt_json(patch.commit_ref.as_ref())?,
                patch.approval.map(|a| a.as_str()),
                deleted_at,
                id.as_str(),
                expected.as_str(),
            ],
        )
        .await
        .map_err(storage_err)?;

    // Another writer moved the item first.
    if affected == 0 {
        return Err(DnaCommitError::InvalidTransition {
            id: id.clone(),
            from: expected,
            to,
        });
    }

    let kind = if to == Status::Deleted {
        TransitionKind::Delete
    } else {
        TransitionKind::Transition
    };
    insert_audit(conn, id, kind, expected, to, reason, now).await
}

async fn retry_in(conn: &Connection, id: &ItemId, expected: Status, reason: &str) -> Result<u32> {
    let affected = conn
        .execute(
            "UPDATE items SET attempts = attempts + 1, reason = ?1
             WHERE id = ?2 AND status = ?3",
            params![reason, id.as_str(), expected.as_str()],
        )
        .await
        .map_err(storage_err)?;
    let current = fetch_item(conn, id)
        .await?
        .ok_or_else(|| DnaCommitError::NotFound { id: id.to_string() })?;
    if affected == 0 {
        return Err(DnaCommitError::InvalidTransition {
            id: id.clone(),
            from: current.status,
            to: expected,
        });
    }

    insert_audit(
        conn,
        id,
        TransitionKind::Retry,
        expected,
        expected,
        reason,
        Utc::now(),
    )
    .await?;
    Ok(current.attempts)
}

async fn approval_in(
    conn: &Connection,
    id: &ItemId,
    approval: Approval,
    reason: &str,
) -> Result<()> {
    let affected = conn
        .execute(
            "UPDATE items SET approval = ?1, reason = ?2 WHERE id = ?3 AND status = ?4",
            params![
                approval.as_str(),
                reason,
                id.as_str(),
                Status::ReviewPassed.as_str()
            ],
        )
        .await
        .map_err(storage_err)?;
    if affected == 0 {
        let from = fetch_item(conn, id)
            .await?
            .map(|i| i.status)
            .ok_or_else(|| DnaCommitError::NotFound { id: id.to_string() })?;
        return Err(DnaCommitError::InvalidTransition {
            id: id.clone(),
            from,
            to: Status::ReviewPassed,
        });
    }

    insert_audit(
        conn,
        id,
        TransitionKind::Approval,
        Status::ReviewPassed,
        Status::ReviewPassed,
        reason,
        Utc::now(),
    )
    .await
}

async fn purge_in(conn: &Connection, now: DateTime<Utc>, cutoff: i64) -> Result<u64> {
    let deleted = Status::Deleted.as_str();
    conn.execute(
        "INSERT OR IGNORE INTO tombstones (id, purged_at)
         SELECT id, ?1 FROM items WHERE status = ?2 AND deleted_at <= ?3",
        params![now.timestamp_millis(), deleted, cutoff],
    )
    .await
    .map_err(storage_err)?;
    conn.execute(
        "DELETE FROM artifacts WHERE item_id IN
            (SELECT id FROM items WHERE status = ?1 AND deleted_at <= ?2)",
        params![deleted, cutoff],
    )
    .await
    .map_err(storage_err)?;
    conn.execute(
        "DELETE FROM items WHERE status = ?1 AND deleted_at <= ?2",
        params![deleted, cutoff],
    )
    .await
    .map_err(storage_err)
}

/// `committed` requires a passing review and an accepted evaluation.
fn check_commit_preconditions(current: &KnowledgeItem, patch: &TransitionPatch) -> Result<()> {
    let review_passed = patch
        .review_notes
        .as_ref()
        .or(current.review_notes.as_ref())
        .is_some_and(|n| n.passed);
    let accepted = current.evaluation.is_some_and(|e| e.accepted);
    if review_passed && accepted {
        Ok(())
    } else {
        Err(DnaCommitError::validation(format!(
            "item {} lacks a passing review or an accepted evaluation",
            current.id
        )))
    }
}

async fn id_exists(conn: &Connection, id: &ItemId) -> Result<bool> {
    let mut rows = conn
        .query(
            "SELECT 1 FROM items WHERE id = ?1
             UNION ALL SELECT 1 FROM tombstones WHERE id = ?1",
            params![id.as_str()],
        )
        .await
        .map_err(storage_err)?;
    Ok(rows.next().await.map_err(storage_err)?.is_some())
}

async fn fetch_item(conn: &Connection, id: &ItemId) -> Result<Option<KnowledgeItem>> {
    let mut rows = conn
        .query(
            &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"),
            params![id.as_str()],
        )
        .await
        .map_err(storage_err)?;

    match rows.next().await.map_err(storage_err)? {
        Some(row) => Ok(Some(row_to_item(&row)?)),
        None => Ok(None),
    }
}

async fn insert_audit(
    conn: &Connection,
    id: &ItemId,
    kind: TransitionKind,
    from: Status,
    to: Status,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO transitions (item_id, kind, from_status, to_status, reason, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.as_str(),
            kind.as_str(),
            from.as_str(),
            to.as_str(),
            reason,
            at.timestamp_millis()
        ],
    )
    .await
    .map_err(storage_err)?;
    Ok(())
}

async fn query_count(conn: &Connection, sql: &str, since: i64) -> Result<u64> {
    let mut rows = conn.query(sql, params![since]).await.map_err(storage_err)?;
    match rows.next().await.map_err(storage_err)? {
        Some(row) => row.get::<u64>(0).map_err(storage_err),
        None => Ok(0),
    }
}

async fn insert_strategy(
    conn: &Connection,
    params: &StrategyParams,
    delta_id: Option<Uuid>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO strategy_params
            (version, keywords_json, repo_topics_json, acceptance_threshold, delta_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            params.version,
            to_json(&params.keywords)?,
            to_json(&params.repo_topics)?,
            params.acceptance_threshold,
            delta_id.map(|d| d.to_string()),
            Utc::now().timestamp_millis(),
        ],
    )
    .await
    .map_err(storage_err)?;
    Ok(())
}

async fn fetch_delta(conn: &Connection, id: Uuid) -> Result<Option<StrategyDelta>> {
    let mut rows = conn
        .query(
            "SELECT body_json FROM strategy_deltas WHERE id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(storage_err)?;
    match rows.next().await.map_err(storage_err)? {
        Some(row) => Ok(Some(from_json(&row.get::<String>(0).map_err(storage_err)?)?)),
        None => Ok(None),
    }
}

/// Move a delta out of `proposed`. Fails if it already left that state.
async fn finish_delta(conn: &Connection, delta: &StrategyDelta, status: DeltaStatus) -> Result<()> {
    let now = Utc::now();
    let mut body = delta.clone();
    body.status = status;
    if status == DeltaStatus::Applied {
        body.applied_at = Some(now);
    }

    let affected = conn
        .execute(
            "UPDATE strategy_deltas SET status = ?1, body_json = ?2, applied_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                status.as_str(),
                to_json(&body)?,
                body.applied_at.map(|d| d.timestamp_millis()),
                delta.id.to_string(),
                DeltaStatus::Proposed.as_str(),
            ],
        )
        .await
        .map_err(storage_err)?;
    if affected == 0 {
        return Err(DnaCommitError::validation(format!(
            "strategy delta {} is not pending",
            delta.id
        )));
    }
    Ok(())
}

/// Convert a database row (selected with [`ITEM_COLUMNS`]) to a [`KnowledgeItem`].
fn row_to_item(row: &libsql::Row) -> Result<KnowledgeItem> {
    let source: String = row.get(1).map_err(storage_err)?;
    let status: String = row.get(2).map_err(storage_err)?;
    let payload: Payload = from_json(&row.get::<String>(3).map_err(storage_err)?)?;
    let evaluation = match row.get::<String>(4).ok() {
        Some(s) => Some(from_json::<Evaluation>(&s)?),
        None => None,
    };
    let review_notes = match row.get::<String>(7).ok() {
        Some(s) => Some(from_json::<ReviewNotes>(&s)?),
        None => None,
    };
    let commit_ref = match row.get::<String>(8).ok() {
        Some(s) => Some(from_json::<CommitRef>(&s)?),
        None => None,
    };
    let approval: String = row.get(9).map_err(storage_err)?;

    Ok(KnowledgeItem {
        id: ItemId(row.get(0).map_err(storage_err)?),
        source: source.parse()?,
        payload,
        status: status.parse()?,
        evaluation,
        attempts: row.get::<u32>(5).map_err(storage_err)?,
        generated_artifact_ref: row.get::<String>(6).ok().map(ArtifactRef),
        review_notes,
        commit_ref,
        approval: approval.parse()?,
        reason: row.get::<String>(10).ok(),
        created_at: from_millis(row.get(11).map_err(storage_err)?)?,
        last_transition_at: from_millis(row.get(12).map_err(storage_err)?)?,
        deleted_at: match row.get::<i64>(13).ok() {
            Some(ms) => Some(from_millis(ms)?),
            None => None,
        },
    })
}

fn row_to_run(row: &libsql::Row) -> Result<RunRecord> {
    let run_id: String = row.get(0).map_err(storage_err)?;
    let mode: String = row.get(1).map_err(storage_err)?;
    let stage_results: BTreeMap<Stage, StageCounts> =
        from_json(&row.get::<String>(4).map_err(storage_err)?)?;
    let outcome: RunOutcome = from_json(&row.get::<String>(5).map_err(storage_err)?)?;

    Ok(RunRecord {
        run_id: run_id
            .parse::<RunId>()
            .map_err(|e| DnaCommitError::Storage(format!("invalid run id: {e}")))?,
        mode: mode.parse::<RunMode>()?,
        started_at: from_millis(row.get(2).map_err(storage_err)?)?,
        ended_at: match row.get::<i64>(3).ok() {
            Some(ms) => Some(from_millis(ms)?),
            None => None,
        },
        stage_results,
        outcome,
    })
}
