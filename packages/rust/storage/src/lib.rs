//! Evidence cache and run persistence for Leadscope.
//!
//! Two narrow traits separate callers from storage internals:
//! - [`EvidenceStore`]: verified evidence shared across runs, keyed by
//!   normalized entity name
//! - [`RunRecorder`]: append-only per-run status and result log
//!
//! [`Storage`] implements both over a local libSQL database;
//! [`MemoryStore`] implements both in process for tests and `--in-memory` runs.

mod memory;
mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadscope_shared::{
    AnalysisResult, CostTotals, EntityStatus, EvidenceRecord, LeadscopeError, Result, RunId,
    RunState, StatusCounts,
};
use libsql::{Connection, Database, params};

pub use memory::MemoryStore;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Cross-run evidence cache.
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    /// Insert or replace the record stored under `record.entity_key`.
    async fn upsert_evidence(&self, record: &EvidenceRecord) -> Result<()>;

    /// Most recent verified record for a normalized entity key.
    async fn find_latest_verified(&self, entity_key: &str) -> Result<Option<EvidenceRecord>>;
}

/// Append-only log of what happened during a run.
#[async_trait]
pub trait RunRecorder: Send + Sync {
    async fn create_run(&self, run_id: &RunId, name: &str, entity_count: usize) -> Result<()>;

    async fn record_status(
        &self,
        run_id: &RunId,
        entity_name: &str,
        status: EntityStatus,
        message: Option<&str>,
    ) -> Result<()>;

    async fn record_result(&self, run_id: &RunId, result: &AnalysisResult) -> Result<()>;

    /// Overwrite the run row's state, counters, and cost totals.
    async fn update_run(
        &self,
        run_id: &RunId,
        state: RunState,
        counts: &StatusCounts,
        costs: &CostTotals,
    ) -> Result<()>;
}

/// A persisted run row.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub name: String,
    pub state: RunState,
    pub entity_count: usize,
    pub counts: StatusCounts,
    pub costs: CostTotals,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One appended status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub entity_name: String,
    pub status: EntityStatus,
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// libSQL storage
// ---------------------------------------------------------------------------

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LeadscopeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LeadscopeError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| LeadscopeError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database for inspection (`leadscope cache show`).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LeadscopeError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| LeadscopeError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        LeadscopeError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 on a fresh database.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(LeadscopeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run inspection
    // -----------------------------------------------------------------------

    /// Fetch a run row by ID.
    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, state, entity_count, counts_json, costs_json, created_at, updated_at
                 FROM runs WHERE id = ?1",
                params![run_id.to_string()],
            )
            .await
            .map_err(|e| LeadscopeError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(LeadscopeError::Storage(e.to_string())),
        }
    }

    /// Status transitions recorded for a run, oldest first.
    pub async fn list_events(&self, run_id: &RunId) -> Result<Vec<StatusEvent>> {
        let mut rows = self
            .conn
            .query(
                "SELECT entity_name, status, message FROM entity_events
                 WHERE run_id = ?1 ORDER BY id",
                params![run_id.to_string()],
            )
            .await
            .map_err(|e| LeadscopeError::Storage(e.to_string()))?;

        let mut events = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| LeadscopeError::Storage(e.to_string()))?
        {
            let status = text_col(&row, 1)?;
            events.push(StatusEvent {
                entity_name: text_col(&row, 0)?,
                status: parse_status(&status)?,
                message: row.get::<String>(2).ok(),
            });
        }
        Ok(events)
    }

    /// Analysis results recorded for a run, in arrival order.
    pub async fn list_results(&self, run_id: &RunId) -> Result<Vec<AnalysisResult>> {
        let mut rows = self
            .conn
            .query(
                "SELECT result_json FROM analysis_results WHERE run_id = ?1 ORDER BY id",
                params![run_id.to_string()],
            )
            .await
            .map_err(|e| LeadscopeError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| LeadscopeError::Storage(e.to_string()))?
        {
            let json = text_col(&row, 0)?;
            let result = serde_json::from_str(&json)
                .map_err(|e| LeadscopeError::parse(format!("corrupt result row: {e}")))?;
            results.push(result);
        }
        Ok(results)
    }
}

#[async_trait]
impl EvidenceStore for Storage {
    async fn upsert_evidence(&self, record: &EvidenceRecord) -> Result<()> {
        self.check_writable()?;
        let issues_json = serde_json::to_string(&record.issues)
            .map_err(|e| LeadscopeError::Storage(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO evidence_cache (entity_key, entity_name, raw_text, formatted_text, content_hash,
                                             verified, confidence, validation_message, issues_json,
                                             credits_used, cached_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(entity_key) DO UPDATE SET
                   entity_name = excluded.entity_name,
                   raw_text = excluded.raw_text,
                   formatted_text = excluded.formatted_text,
                   content_hash = excluded.content_hash,
                   verified = excluded.verified,
                   confidence = excluded.confidence,
                   validation_message = excluded.validation_message,
                   issues_json = excluded.issues_json,
                   credits_used = excluded.credits_used,
                   cached_at = excluded.cached_at",
                params![
                    record.entity_key.as_str(),
                    record.entity_name.as_str(),
                    record.raw_text.as_str(),
                    record.formatted_text.as_str(),
                    record.content_hash.as_str(),
                    i64::from(record.verified),
                    record.confidence,
                    record.validation_message.as_str(),
                    issues_json,
                    record.credits_used as i64,
                    record.cached_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| LeadscopeError::Storage(e.to_string()))?;
        tracing::debug!(entity = %record.entity_key, "evidence upserted");
        Ok(())
    }

    async fn find_latest_verified(&self, entity_key: &str) -> Result<Option<EvidenceRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT entity_name, entity_key, raw_text, formatted_text, content_hash, verified,
                        confidence, validation_message, issues_json, credits_used, cached_at
                 FROM evidence_cache
                 WHERE entity_key = ?1 AND verified = 1
                 ORDER BY cached_at DESC
                 LIMIT 1",
                params![entity_key],
            )
            .await
            .map_err(|e| LeadscopeError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_evidence(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(LeadscopeError::Storage(e.to_string())),
        }
    }
}

#[async_trait]
impl RunRecorder for Storage {
    async fn create_run(&self, run_id: &RunId, name: &str, entity_count: usize) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO runs (id, name, state, entity_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id.to_string(),
                    name,
                    RunState::Running.as_str(),
                    entity_count as i64,
                    now.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| LeadscopeError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn record_status(
        &self,
        run_id: &RunId,
        entity_name: &str,
        status: EntityStatus,
        message: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO entity_events (run_id, entity_name, status, message, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id.to_string(),
                    entity_name,
                    status.as_str(),
                    message,
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| LeadscopeError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn record_result(&self, run_id: &RunId, result: &AnalysisResult) -> Result<()> {
        self.check_writable()?;
        let json =
            serde_json::to_string(result).map_err(|e| LeadscopeError::Storage(e.to_string()))?;
        let source = if result.is_fallback() {
            "fallback"
        } else {
            "classifier"
        };
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO analysis_results (run_id, entity_name, total_score, tier, source, result_json, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id.to_string(),
                    result.entity_name.as_str(),
                    i64::from(result.total_score),
                    result.tier.as_str(),
                    source,
                    json,
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| LeadscopeError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn update_run(
        &self,
        run_id: &RunId,
        state: RunState,
        counts: &StatusCounts,
        costs: &CostTotals,
    ) -> Result<()> {
        self.check_writable()?;
        let counts_json =
            serde_json::to_string(counts).map_err(|e| LeadscopeError::Storage(e.to_string()))?;
        let costs_json =
            serde_json::to_string(costs).map_err(|e| LeadscopeError::Storage(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE runs SET state = ?1, counts_json = ?2, costs_json = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    state.as_str(),
                    counts_json,
                    costs_json,
                    now.as_str(),
                    run_id.to_string()
                ],
            )
            .await
            .map_err(|e| LeadscopeError::Storage(e.to_string()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

fn text_col(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx)
        .map_err(|e| LeadscopeError::Storage(e.to_string()))
}

fn int_col(row: &libsql::Row, idx: i32) -> Result<i64> {
    row.get::<i64>(idx)
        .map_err(|e| LeadscopeError::Storage(e.to_string()))
}

fn real_col(row: &libsql::Row, idx: i32) -> Result<f64> {
    row.get::<f64>(idx)
        .map_err(|e| LeadscopeError::Storage(e.to_string()))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LeadscopeError::parse(format!("invalid date {s:?}: {e}")))
}

fn parse_status(s: &str) -> Result<EntityStatus> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| LeadscopeError::parse(format!("unknown entity status: {s}")))
}

fn row_to_evidence(row: &libsql::Row) -> Result<EvidenceRecord> {
    let issues_json = text_col(row, 8)?;
    let cached_at = text_col(row, 10)?;
    Ok(EvidenceRecord {
        entity_name: text_col(row, 0)?,
        entity_key: text_col(row, 1)?,
        raw_text: text_col(row, 2)?,
        formatted_text: text_col(row, 3)?,
        content_hash: text_col(row, 4)?,
        verified: int_col(row, 5)? != 0,
        confidence: real_col(row, 6)?,
        validation_message: text_col(row, 7)?,
        issues: serde_json::from_str(&issues_json).unwrap_or_default(),
        credits_used: int_col(row, 9)?.max(0) as u64,
        cached_at: parse_timestamp(&cached_at)?,
    })
}

fn row_to_run(row: &libsql::Row) -> Result<RunRecord> {
    let state = text_col(row, 2)?;
    let counts_json = text_col(row, 4)?;
    let costs_json = text_col(row, 5)?;
    let created_at = text_col(row, 6)?;
    let updated_at = text_col(row, 7)?;
    Ok(RunRecord {
        run_id: text_col(row, 0)?,
        name: text_col(row, 1)?,
        state: RunState::parse(&state)
            .ok_or_else(|| LeadscopeError::parse(format!("unknown run state: {state}")))?,
        entity_count: int_col(row, 3)?.max(0) as usize,
        counts: serde_json::from_str(&counts_json).unwrap_or_default(),
        costs: serde_json::from_str(&costs_json).unwrap_or_default(),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
