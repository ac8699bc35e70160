//! SQL migration definitions for the Leadscope database.
//!
//! Migrations are forward-only and applied in order on database open.

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
            description: "Evidence cache keyed by normalized entity name",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per entity; last validated write wins
CREATE TABLE IF NOT EXISTS evidence_cache (
    entity_key         TEXT PRIMARY KEY,
    entity_name        TEXT NOT NULL,
    raw_text           TEXT NOT NULL,
    formatted_text     TEXT NOT NULL,
    content_hash       TEXT NOT NULL,
    verified           INTEGER NOT NULL DEFAULT 0,
    confidence         REAL NOT NULL DEFAULT 0,
    validation_message TEXT NOT NULL DEFAULT '',
    issues_json        TEXT NOT NULL DEFAULT '[]',
    credits_used       INTEGER NOT NULL DEFAULT 0,
    cached_at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_evidence_verified ON evidence_cache(verified, cached_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Run bookkeeping: runs, entity_events, analysis_results",
            sql: r#"
CREATE TABLE IF NOT EXISTS runs (
    id           TEXT PRIMARY KEY,
    name         TEXT NOT NULL,
    state        TEXT NOT NULL,
    entity_count INTEGER NOT NULL,
    counts_json  TEXT NOT NULL DEFAULT '{}',
    costs_json   TEXT NOT NULL DEFAULT '{}',
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

-- Append-only status log
CREATE TABLE IF NOT EXISTS entity_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    entity_name TEXT NOT NULL,
    status      TEXT NOT NULL,
    message     TEXT,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entity_events_run ON entity_events(run_id);

-- Append-only scored results
CREATE TABLE IF NOT EXISTS analysis_results (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    entity_name TEXT NOT NULL,
    total_score INTEGER NOT NULL,
    tier        TEXT NOT NULL,
    source      TEXT NOT NULL,
    result_json TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_analysis_results_run ON analysis_results(run_id);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
