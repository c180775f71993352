//! SQL migration definitions for the DNA-commit Knowledge Store.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: items, transitions, artifacts, tombstones, run_records",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Knowledge items (timestamps are unix milliseconds)
CREATE TABLE IF NOT EXISTS items (
    id                 TEXT PRIMARY KEY,
    source             TEXT NOT NULL,
    status             TEXT NOT NULL,
    payload_json       TEXT NOT NULL,
    query              TEXT,
    evaluation_json    TEXT,
    aggregate          REAL,
    attempts           INTEGER NOT NULL DEFAULT 0,
    artifact_ref       TEXT,
    review_json        TEXT,
    commit_json        TEXT,
    approval           TEXT NOT NULL DEFAULT 'automatic',
    reason             TEXT,
    created_at         INTEGER NOT NULL,
    last_transition_at INTEGER NOT NULL,
    deleted_at         INTEGER
);

CREATE INDEX IF NOT EXISTS idx_items_status ON items(status);
CREATE INDEX IF NOT EXISTS idx_items_created ON items(created_at);

-- Append-only audit trail of every status change, retry, delete and approval
CREATE TABLE IF NOT EXISTS transitions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id     TEXT NOT NULL,
    kind        TEXT NOT NULL,
    from_status TEXT NOT NULL,
    to_status   TEXT NOT NULL,
    reason      TEXT NOT NULL,
    at          INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transitions_item ON transitions(item_id);
CREATE INDEX IF NOT EXISTS idx_transitions_at ON transitions(at);

-- Generated artifacts
CREATE TABLE IF NOT EXISTS artifacts (
    artifact_ref   TEXT PRIMARY KEY,
    item_id        TEXT NOT NULL,
    files_json     TEXT NOT NULL,
    commit_message TEXT NOT NULL,
    summary        TEXT NOT NULL,
    created_at     INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_artifacts_item ON artifacts(item_id);

-- Ids of purged items, never reusable
CREATE TABLE IF NOT EXISTS tombstones (
    id        TEXT PRIMARY KEY,
    purged_at INTEGER NOT NULL
);

-- Orchestrator run history
CREATE TABLE IF NOT EXISTS run_records (
    run_id      TEXT PRIMARY KEY,
    mode        TEXT NOT NULL,
    started_at  INTEGER NOT NULL,
    ended_at    INTEGER,
    stages_json TEXT NOT NULL,
    outcome_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_run_records_started ON run_records(started_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Adaptive strategy: versioned params and proposed deltas",
            sql: r#"
CREATE TABLE IF NOT EXISTS strategy_params (
    version              INTEGER PRIMARY KEY,
    keywords_json        TEXT NOT NULL,
    repo_topics_json     TEXT NOT NULL,
    acceptance_threshold REAL NOT NULL,
    delta_id             TEXT,
    created_at           INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS strategy_deltas (
    id         TEXT PRIMARY KEY,
    status     TEXT NOT NULL,
    body_json  TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    applied_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_strategy_deltas_status ON strategy_deltas(status);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
