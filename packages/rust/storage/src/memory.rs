//! In-process store used by tests and `leadscope run --in-memory`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use leadscope_shared::{
    AnalysisResult, CostTotals, EntityStatus, EvidenceRecord, LeadscopeError, Result, RunId,
    RunState, StatusCounts,
};

use crate::{EvidenceStore, RunRecord, RunRecorder, StatusEvent};

#[derive(Default)]
struct Inner {
    evidence: HashMap<String, EvidenceRecord>,
    runs: HashMap<String, RunRecord>,
    events: HashMap<String, Vec<StatusEvent>>,
    results: HashMap<String, Vec<AnalysisResult>>,
    evidence_writes: usize,
}

/// Mutex-guarded maps with the same semantics as [`crate::Storage`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| LeadscopeError::Storage("memory store lock poisoned".into()))
    }

    /// Number of `upsert_evidence` calls seen so far.
    pub fn evidence_writes(&self) -> usize {
        self.lock().map(|g| g.evidence_writes).unwrap_or(0)
    }

    pub fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        Ok(self.lock()?.runs.get(&run_id.to_string()).cloned())
    }

    pub fn list_events(&self, run_id: &RunId) -> Result<Vec<StatusEvent>> {
        Ok(self
            .lock()?
            .events
            .get(&run_id.to_string())
            .cloned()
            .unwrap_or_default())
    }

    pub fn list_results(&self, run_id: &RunId) -> Result<Vec<AnalysisResult>> {
        Ok(self
            .lock()?
            .results
            .get(&run_id.to_string())
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl EvidenceStore for MemoryStore {
    async fn upsert_evidence(&self, record: &EvidenceRecord) -> Result<()> {
        let mut inner = self.lock()?;
        inner.evidence_writes += 1;
        inner
            .evidence
            .insert(record.entity_key.clone(), record.clone());
        Ok(())
    }

    async fn find_latest_verified(&self, entity_key: &str) -> Result<Option<EvidenceRecord>> {
        Ok(self
            .lock()?
            .evidence
            .get(entity_key)
            .filter(|r| r.verified)
            .cloned())
    }
}

#[async_trait]
impl RunRecorder for MemoryStore {
    async fn create_run(&self, run_id: &RunId, name: &str, entity_count: usize) -> Result<()> {
        let now = Utc::now();
        let key = run_id.to_string();
        let mut inner = self.lock()?;
        if inner.runs.contains_key(&key) {
            return Err(LeadscopeError::Storage(format!("run {key} already exists")));
        }
        inner.runs.insert(
            key.clone(),
            RunRecord {
                run_id: key,
                name: name.to_string(),
                state: RunState::Running,
                entity_count,
                counts: StatusCounts::default(),
                costs: CostTotals::default(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn record_status(
        &self,
        run_id: &RunId,
        entity_name: &str,
        status: EntityStatus,
        message: Option<&str>,
    ) -> Result<()> {
        self.lock()?
            .events
            .entry(run_id.to_string())
            .or_default()
            .push(StatusEvent {
                entity_name: entity_name.to_string(),
                status,
                message: message.map(str::to_string),
            });
        Ok(())
    }

    async fn record_result(&self, run_id: &RunId, result: &AnalysisResult) -> Result<()> {
        self.lock()?
            .results
            .entry(run_id.to_string())
            .or_default()
            .push(result.clone());
        Ok(())
    }

    async fn update_run(
        &self,
        run_id: &RunId,
        state: RunState,
        counts: &StatusCounts,
        costs: &CostTotals,
    ) -> Result<()> {
        let key = run_id.to_string();
        let mut inner = self.lock()?;
        let run = inner
            .runs
            .get_mut(&key)
            .ok_or_else(|| LeadscopeError::Storage(format!("run {key} not found")))?;
        run.state = state;
        run.counts = *counts;
        run.costs = *costs;
        run.updated_at = Utc::now();
        Ok(())
    }
}
