//! Two-phase batch run: resolve evidence for every entity, then score the
//! resolved ones in sequential batches.
//!
//! Entity failures are recorded and never abort the run. Cancellation is
//! cooperative through [`JobHandle::cancel`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use leadscope_llm::ChatProvider;
use leadscope_search::SearchProvider;
use leadscope_shared::{
    AnalysisResult, CostTotals, EntityStatus, EvidenceRecord, PipelineConfig, Result, RunId,
    RunState, StatusCounts,
};
use leadscope_storage::{EvidenceStore, RunRecorder};

use crate::cache::{CacheCoordinator, CoordinatorSettings, Resolution, ResolutionFailure};
use crate::costs::CostTracker;
use crate::fetcher::{FetchSettings, Fetcher};
use crate::scoring::{ScoringEngine, ScoringError, ScoringSettings};
use crate::validator::{Validator, ValidatorSettings};

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

/// One entity's progress through a run.
#[derive(Debug, Clone)]
pub struct EntityEntry {
    pub name: String,
    pub status: EntityStatus,
    pub error: Option<String>,
    /// Verified evidence, once Phase 1 succeeds.
    pub evidence: Option<EvidenceRecord>,
    pub from_cache: bool,
    pub result: Option<AnalysisResult>,
}

impl EntityEntry {
    fn new(name: String) -> Self {
        Self {
            name,
            status: EntityStatus::Pending,
            error: None,
            evidence: None,
            from_cache: false,
            result: None,
        }
    }
}

struct JobState {
    entries: Vec<EntityEntry>,
    last_activity: Instant,
    finished: bool,
}

struct JobInner {
    run_id: RunId,
    name: String,
    cancelled: AtomicBool,
    state: Mutex<JobState>,
}

/// Shared view of a run. Cheap to clone; all clones observe the same job.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<JobInner>,
}

impl JobHandle {
    fn new(name: &str, entities: Vec<String>) -> Self {
        Self {
            inner: Arc::new(JobInner {
                run_id: RunId::new(),
                name: name.to_string(),
                cancelled: AtomicBool::new(false),
                state: Mutex::new(JobState {
                    entries: entities.into_iter().map(EntityEntry::new).collect(),
                    last_activity: Instant::now(),
                    finished: false,
                }),
            }),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.inner.run_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Request cancellation. Irreversible: no entity starts work afterwards.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            info!(run_id = %self.inner.run_id, "cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn entries(&self) -> Vec<EntityEntry> {
        self.lock().entries.clone()
    }

    /// Status counts, recomputed from the entries.
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in &self.lock().entries {
            counts.add(entry.status);
        }
        counts
    }

    /// Time since the last status transition.
    pub fn idle_for(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }

    /// Whether an unfinished run has made no progress for longer than `threshold`.
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let state = self.lock();
        !state.finished && state.last_activity.elapsed() > threshold
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn indices_with(&self, status: EntityStatus) -> Vec<usize> {
        self.lock()
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status == status)
            .map(|(i, _)| i)
            .collect()
    }

    /// Apply a transition if legal. Returns the entity name when it was applied.
    fn transition(&self, index: usize, next: EntityStatus, error: Option<String>) -> Option<String> {
        let mut state = self.lock();
        let entry = state.entries.get_mut(index)?;
        if !entry.status.can_transition_to(next) {
            warn!(
                entity = %entry.name,
                from = %entry.status,
                to = %next,
                "ignoring illegal status transition"
            );
            return None;
        }
        entry.status = next;
        if error.is_some() {
            entry.error = error;
        }
        let name = entry.name.clone();
        state.last_activity = Instant::now();
        Some(name)
    }

    fn update<F: FnOnce(&mut EntityEntry)>(&self, index: usize, f: F) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(index) {
            f(entry);
        }
    }

    fn finish(&self) {
        self.lock().finished = true;
    }
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Callbacks for surfacing run progress.
pub trait ProgressReporter: Send + Sync {
    fn phase(&self, name: &str, entities: usize);
    fn entity_resolved(&self, name: &str, from_cache: bool);
    fn entity_failed(&self, name: &str, message: &str);
    fn entity_scored(&self, result: &AnalysisResult);
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless and test runs.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str, _entities: usize) {}
    fn entity_resolved(&self, _name: &str, _from_cache: bool) {}
    fn entity_failed(&self, _name: &str, _message: &str) {}
    fn entity_scored(&self, _result: &AnalysisResult) {}
    fn done(&self, _summary: &RunSummary) {}
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: RunId,
    pub state: RunState,
    pub counts: StatusCounts,
    pub costs: CostTotals,
    /// Scored results in input order.
    pub results: Vec<AnalysisResult>,
    /// `(entity, message)` for every failed entity, in input order.
    pub failures: Vec<(String, String)>,
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    coordinator: Arc<CacheCoordinator>,
    scorer: Arc<ScoringEngine>,
    recorder: Arc<dyn RunRecorder>,
    costs: Arc<CostTracker>,
    fetch_concurrency: usize,
    batch_size: usize,
}

impl Orchestrator {
    pub fn new(
        coordinator: CacheCoordinator,
        scorer: ScoringEngine,
        recorder: Arc<dyn RunRecorder>,
        fetch_concurrency: usize,
        batch_size: usize,
    ) -> Self {
        let costs = coordinator.costs().clone();
        Self {
            coordinator: Arc::new(coordinator),
            scorer: Arc::new(scorer),
            recorder,
            costs,
            fetch_concurrency: fetch_concurrency.max(1),
            batch_size: batch_size.max(1),
        }
    }

    /// Wire every stage from one validated configuration.
    pub fn from_config(
        config: &PipelineConfig,
        search: Arc<dyn SearchProvider>,
        validator_llm: Arc<dyn ChatProvider>,
        scoring_llm: Arc<dyn ChatProvider>,
        store: Arc<dyn EvidenceStore>,
        recorder: Arc<dyn RunRecorder>,
    ) -> Result<Self> {
        config.validate()?;
        let coordinator = CacheCoordinator::new(
            store,
            Fetcher::new(search, FetchSettings::from(config)),
            Validator::new(validator_llm, ValidatorSettings::from(config)),
            CoordinatorSettings::from(config),
            Arc::new(CostTracker::new()),
        );
        let scorer = ScoringEngine::new(scoring_llm, ScoringSettings::from(config));
        Ok(Self::new(
            coordinator,
            scorer,
            recorder,
            config.fetch_concurrency,
            config.batch_size,
        ))
    }

    /// Create a job with every entity PENDING. Nothing runs until [`Self::run`].
    pub fn start_job(&self, name: &str, entities: Vec<String>) -> JobHandle {
        JobHandle::new(name, entities)
    }

    /// Run both phases to completion or cancellation.
    #[instrument(skip_all, fields(run_id = %handle.run_id(), name = %handle.name()))]
    pub async fn run(
        &self,
        handle: &JobHandle,
        progress: &dyn ProgressReporter,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let run_id = handle.run_id().clone();
        let total = handle.lock().entries.len();
        self.recorder
            .create_run(&run_id, handle.name(), total)
            .await?;
        info!(entities = total, "run started");

        // --- Phase 1: resolve evidence ---
        progress.phase("Resolving evidence", total);
        self.resolve_all(handle, progress).await;

        if handle.is_cancelled() {
            self.cancel_remaining(handle).await;
        }

        // --- Phase 2: score in batches ---
        let resolved: Vec<usize> = handle
            .indices_with(EntityStatus::Resolving)
            .into_iter()
            .filter(|&i| handle.lock().entries[i].evidence.is_some())
            .collect();
        progress.phase("Scoring", resolved.len());
        for (batch_no, batch) in resolved.chunks(self.batch_size).enumerate() {
            if handle.is_cancelled() {
                debug!(batch = batch_no, "cancelled before batch");
                break;
            }
            self.score_batch(handle, batch, progress).await;
            self.checkpoint(handle, RunState::Running).await;
        }

        if handle.is_cancelled() {
            self.cancel_remaining(handle).await;
        }

        let state = if handle.is_cancelled() {
            RunState::Cancelled
        } else {
            RunState::Completed
        };
        handle.finish();
        self.checkpoint(handle, state).await;

        let summary = self.summarize(handle, state, started.elapsed());
        info!(
            state = state.as_str(),
            completed = summary.counts.completed,
            failed = summary.counts.failed,
            cancelled = summary.counts.cancelled,
            credits = summary.costs.search_credits,
            "run finished"
        );
        progress.done(&summary);
        Ok(summary)
    }

    async fn resolve_all(&self, handle: &JobHandle, progress: &dyn ProgressReporter) {
        let semaphore = Arc::new(Semaphore::new(self.fetch_concurrency));
        let mut tasks = JoinSet::new();

        for index in handle.indices_with(EntityStatus::Pending) {
            let semaphore = semaphore.clone();
            let coordinator = self.coordinator.clone();
            let recorder = self.recorder.clone();
            let handle = handle.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                if handle.is_cancelled() {
                    return None;
                }
                let name = handle.transition(index, EntityStatus::Resolving, None)?;
                record(&*recorder, &handle, &name, EntityStatus::Resolving, None).await;
                let outcome = coordinator.resolve(&name).await;
                Some((index, outcome))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some((index, outcome))) => {
                    self.on_resolved(handle, index, outcome, progress).await
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "resolution task failed"),
            }
        }

        // A panicked task leaves its entity RESOLVING with no evidence.
        for index in handle.indices_with(EntityStatus::Resolving) {
            if handle.lock().entries[index].evidence.is_none() {
                self.fail(handle, index, "resolution task aborted".into(), progress)
                    .await;
            }
        }
    }

    async fn on_resolved(
        &self,
        handle: &JobHandle,
        index: usize,
        outcome: std::result::Result<Resolution, ResolutionFailure>,
        progress: &dyn ProgressReporter,
    ) {
        match outcome {
            Ok(resolution) => {
                let name = handle.lock().entries[index].name.clone();
                let from_cache = resolution.from_cache;
                handle.update(index, |entry| {
                    entry.from_cache = from_cache;
                    entry.evidence = Some(resolution.record);
                });
                progress.entity_resolved(&name, from_cache);
            }
            Err(failure) => {
                let message = if failure.issues.is_empty() {
                    failure.message
                } else {
                    format!("{} ({})", failure.message, failure.issues.join("; "))
                };
                self.fail(handle, index, message, progress).await;
            }
        }
    }

    async fn score_batch(&self, handle: &JobHandle, batch: &[usize], progress: &dyn ProgressReporter) {
        let mut tasks = JoinSet::new();
        for &index in batch {
            let Some(evidence) = handle.lock().entries[index].evidence.clone() else {
                continue;
            };
            let Some(name) = handle.transition(index, EntityStatus::Scoring, None) else {
                continue;
            };
            record(&*self.recorder, handle, &name, EntityStatus::Scoring, None).await;
            let scorer = self.scorer.clone();
            tasks.spawn(async move {
                let outcome = scorer.score(&name, &evidence.formatted_text).await;
                (index, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => self.on_scored(handle, index, outcome, progress).await,
                Err(e) => warn!(error = %e, "scoring task failed"),
            }
        }

        for &index in batch {
            if handle.lock().entries[index].status == EntityStatus::Scoring {
                self.fail(handle, index, "scoring task aborted".into(), progress)
                    .await;
            }
        }
    }

    async fn on_scored(
        &self,
        handle: &JobHandle,
        index: usize,
        outcome: std::result::Result<AnalysisResult, ScoringError>,
        progress: &dyn ProgressReporter,
    ) {
        match outcome {
            Ok(result) => {
                self.costs.add_scoring_tokens(result.tokens_used);
                if let Err(e) = self.recorder.record_result(handle.run_id(), &result).await {
                    warn!(entity = %result.entity_name, error = %e, "failed to record result");
                }
                handle.update(index, |entry| entry.result = Some(result.clone()));
                if let Some(name) = handle.transition(index, EntityStatus::Completed, None) {
                    record(&*self.recorder, handle, &name, EntityStatus::Completed, None).await;
                }
                progress.entity_scored(&result);
            }
            Err(e) => {
                self.costs.add_scoring_tokens(e.tokens_used);
                self.fail(handle, index, e.message, progress).await;
            }
        }
    }

    async fn fail(
        &self,
        handle: &JobHandle,
        index: usize,
        message: String,
        progress: &dyn ProgressReporter,
    ) {
        if let Some(name) = handle.transition(index, EntityStatus::Failed, Some(message.clone())) {
            info!(entity = %name, %message, "entity failed");
            record(&*self.recorder, handle, &name, EntityStatus::Failed, Some(&message)).await;
            progress.entity_failed(&name, &message);
        }
    }

    /// Every non-terminal entity becomes CANCELLED.
    async fn cancel_remaining(&self, handle: &JobHandle) {
        let pending: Vec<usize> = handle
            .lock()
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.status.is_terminal())
            .map(|(i, _)| i)
            .collect();
        for index in pending {
            if let Some(name) = handle.transition(index, EntityStatus::Cancelled, None) {
                record(&*self.recorder, handle, &name, EntityStatus::Cancelled, None).await;
            }
        }
    }

    async fn checkpoint(&self, handle: &JobHandle, state: RunState) {
        let counts = handle.counts();
        let costs = self.costs.snapshot();
        if let Err(e) = self
            .recorder
            .update_run(handle.run_id(), state, &counts, &costs)
            .await
        {
            warn!(error = %e, "failed to update run record");
        }
    }

    fn summarize(&self, handle: &JobHandle, state: RunState, elapsed: Duration) -> RunSummary {
        let entries = handle.entries();
        let mut counts = StatusCounts::default();
        let mut results = Vec::new();
        let mut failures = Vec::new();
        for entry in entries {
            counts.add(entry.status);
            if let Some(result) = entry.result {
                results.push(result);
            }
            if entry.status == EntityStatus::Failed {
                failures.push((entry.name, entry.error.unwrap_or_default()));
            }
        }
        RunSummary {
            run_id: handle.run_id().clone(),
            state,
            counts,
            costs: self.costs.snapshot(),
            results,
            failures,
            elapsed,
        }
    }
}

/// Append a status event; recorder failures are logged, not propagated.
async fn record(
    recorder: &dyn RunRecorder,
    handle: &JobHandle,
    entity_name: &str,
    status: EntityStatus,
    message: Option<&str>,
) {
    if let Err(e) = recorder
        .record_status(handle.run_id(), entity_name, status, message)
        .await
    {
        warn!(entity = %entity_name, error = %e, "failed to record status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::instant_settings;
    use crate::retry::Backoff;
    use crate::testing::{FakeChat, FakeSearch, entity_in, good_hits, reply};
    use leadscope_llm::ChatError;
    use leadscope_shared::{PriorityTier, ScoreSource};
    use leadscope_storage::MemoryStore;

    const SCORES: &str = r#"{"tier": "D", "reasoning": "Builds its own perception models.", "scores": {"gpu_use_case": 35, "scale_budget": 25, "growth_signals": 7, "confidence": 10}}"#;

    struct Harness {
        search: Arc<FakeSearch>,
        validator: Arc<FakeChat>,
        scorer: Arc<FakeChat>,
        store: Arc<MemoryStore>,
    }

    impl Harness {
        fn new(names: &[&str]) -> Self {
            Self::with_search(names, FakeSearch::new())
        }

        fn with_search(names: &[&str], search: FakeSearch) -> Self {
            let search = Arc::new(search);
            for name in names {
                search.respond(name, good_hits(name));
            }
            let validator = Arc::new(FakeChat::new(|req| match entity_in(req).as_str() {
                "FakeCo" => reply(r#"{"is_valid": true, "confidence": 0.2, "message": "placeholder organization"}"#),
                _ => reply(r#"{"is_valid": true, "confidence": 0.8, "message": "matches"}"#),
            }));
            let scorer = Arc::new(FakeChat::new(|req| match entity_in(req).as_str() {
                "Broken" => Err(ChatError::Status {
                    status: 500,
                    body: "model crashed".into(),
                }),
                "Garbled" => reply("no idea"),
                _ => reply(SCORES),
            }));
            Self {
                search,
                validator,
                scorer,
                store: Arc::new(MemoryStore::new()),
            }
        }

        fn orchestrator(&self, batch_size: usize) -> Orchestrator {
            self.orchestrator_with(4, batch_size)
        }

        fn orchestrator_with(&self, fetch_concurrency: usize, batch_size: usize) -> Orchestrator {
            let fetch = FetchSettings {
                backoff: Backoff::new(Duration::ZERO),
                ..FetchSettings::default()
            };
            let coordinator = CacheCoordinator::new(
                self.store.clone(),
                Fetcher::new(self.search.clone(), fetch),
                Validator::new(self.validator.clone(), ValidatorSettings::default()),
                instant_settings(),
                Arc::new(CostTracker::new()),
            );
            let scorer = ScoringEngine::new(self.scorer.clone(), ScoringSettings::default());
            Orchestrator::new(
                coordinator,
                scorer,
                self.store.clone(),
                fetch_concurrency,
                batch_size,
            )
        }

        async fn run(&self, entities: &[&str], batch_size: usize) -> (JobHandle, RunSummary) {
            let orchestrator = self.orchestrator(batch_size);
            let handle = orchestrator.start_job(
                "test",
                entities.iter().map(|s| s.to_string()).collect(),
            );
            let summary = orchestrator.run(&handle, &SilentProgress).await.unwrap();
            (handle, summary)
        }
    }

    #[tokio::test]
    async fn fresh_entity_is_fetched_validated_persisted_and_scored() {
        let h = Harness::new(&["Acme"]);
        let (handle, summary) = h.run(&["Acme"], 10).await;

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.counts.completed, 1);
        assert_eq!(h.search.calls(), 1);
        assert_eq!(h.validator.calls(), 1);
        assert_eq!(h.store.evidence_writes(), 1);
        assert_eq!(h.scorer.calls(), 1);

        let result = &summary.results[0];
        assert_eq!(result.source, ScoreSource::Classifier);
        assert_eq!(result.scores.len(), 4);
        assert_eq!(result.total_score, 77);
        assert_eq!(result.tier, PriorityTier::Hot);

        let entry = &handle.entries()[0];
        assert!(!entry.from_cache);
        assert_eq!(entry.status, EntityStatus::Completed);

        let events: Vec<EntityStatus> = h
            .store
            .list_events(handle.run_id())
            .unwrap()
            .into_iter()
            .map(|e| e.status)
            .collect();
        assert_eq!(
            events,
            vec![EntityStatus::Resolving, EntityStatus::Scoring, EntityStatus::Completed]
        );
        assert_eq!(h.store.list_results(handle.run_id()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_run_reuses_cache_but_scores_fresh() {
        let h = Harness::new(&["Acme"]);
        let (first, _) = h.run(&["Acme"], 10).await;
        let (second, summary) = h.run(&["Acme"], 10).await;

        assert_eq!(h.search.calls(), 1);
        assert_eq!(h.validator.calls(), 1);
        assert_eq!(h.scorer.calls(), 2);
        assert_eq!(summary.costs.cache_hits, 1);
        assert_eq!(summary.costs.search_credits, 0);

        let before = first.entries()[0].evidence.clone().unwrap();
        let after = second.entries()[0].evidence.clone().unwrap();
        assert!(second.entries()[0].from_cache);
        assert_eq!(before.formatted_text, after.formatted_text);
        assert_eq!(before.content_hash, after.content_hash);
    }

    #[tokio::test]
    async fn rejected_entity_fails_without_scoring() {
        let h = Harness::new(&["FakeCo"]);
        let (handle, summary) = h.run(&["FakeCo"], 10).await;

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.counts.failed, 1);
        assert_eq!(h.search.calls_for("FakeCo"), 2);
        assert_eq!(h.validator.calls(), 2);
        assert_eq!(h.store.evidence_writes(), 0);
        assert_eq!(h.scorer.calls(), 0);

        let entry = &handle.entries()[0];
        assert_eq!(entry.status, EntityStatus::Failed);
        assert!(entry.error.as_deref().unwrap().contains("placeholder organization"));
        assert_eq!(summary.failures[0].0, "FakeCo");
    }

    #[tokio::test]
    async fn entity_failures_do_not_abort_the_run() {
        let h = Harness::new(&["Acme", "Broken", "Garbled", "Initech"]);
        let (handle, summary) = h.run(&["Acme", "Broken", "Ghost", "Garbled", "Initech"], 2).await;

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.counts.completed, 3);
        assert_eq!(summary.counts.failed, 2);
        assert_eq!(summary.counts.total(), 5);

        let entries = handle.entries();
        assert_eq!(
            entries[1].error.as_deref(),
            Some("provider returned HTTP 500: model crashed")
        );
        assert_eq!(entries[2].status, EntityStatus::Failed);
        let garbled = entries[3].result.as_ref().unwrap();
        assert_eq!(garbled.source, ScoreSource::Fallback);
        assert_eq!(garbled.total_score, 17);

        let names: Vec<&str> = summary.results.iter().map(|r| r.entity_name.as_str()).collect();
        assert_eq!(names, vec!["Acme", "Garbled", "Initech"]);

        let run = h.store.get_run(handle.run_id()).unwrap().unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.counts, summary.counts);
        assert_eq!(run.costs.scoring_tokens, summary.costs.scoring_tokens);
        assert_eq!(summary.costs.scoring_tokens, 3 * 120);
    }

    #[tokio::test]
    async fn cancel_before_run_starts_nothing() {
        let h = Harness::new(&["Acme", "Initech"]);
        let orchestrator = h.orchestrator(10);
        let handle = orchestrator.start_job("test", vec!["Acme".into(), "Initech".into()]);
        handle.cancel();

        let summary = orchestrator.run(&handle, &SilentProgress).await.unwrap();
        assert_eq!(summary.state, RunState::Cancelled);
        assert_eq!(summary.counts.cancelled, 2);
        assert_eq!(h.search.calls(), 0);
        assert_eq!(h.scorer.calls(), 0);
        assert!(!handle.is_stalled(Duration::ZERO));
    }

    /// Cancels the job as soon as the first entity is scored.
    struct CancelAfterFirst(JobHandle);

    impl ProgressReporter for CancelAfterFirst {
        fn phase(&self, _name: &str, _entities: usize) {}
        fn entity_resolved(&self, _name: &str, _from_cache: bool) {}
        fn entity_failed(&self, _name: &str, _message: &str) {}
        fn entity_scored(&self, _result: &AnalysisResult) {
            self.0.cancel();
        }
        fn done(&self, _summary: &RunSummary) {}
    }

    #[tokio::test]
    async fn cancel_between_batches_stops_later_batches() {
        let h = Harness::new(&["Acme", "Initech", "Globex"]);
        let orchestrator = h.orchestrator(1);
        let handle = orchestrator.start_job(
            "test",
            vec!["Acme".into(), "Initech".into(), "Globex".into()],
        );

        let summary = orchestrator
            .run(&handle, &CancelAfterFirst(handle.clone()))
            .await
            .unwrap();

        assert_eq!(summary.state, RunState::Cancelled);
        assert_eq!(summary.counts.completed, 1);
        assert_eq!(summary.counts.cancelled, 2);
        assert_eq!(h.scorer.calls(), 1);

        // Nothing leaves a terminal state once cancelled.
        for entry in handle.entries() {
            assert!(entry.status.is_terminal());
        }
        assert!(handle.is_cancelled());
    }

    /// Cancels the job when the first entity resolves, noting how many status
    /// events had been recorded at that moment.
    struct CancelOnFirstResolve {
        handle: JobHandle,
        store: Arc<MemoryStore>,
        events_at_cancel: Mutex<Option<usize>>,
    }

    impl ProgressReporter for CancelOnFirstResolve {
        fn phase(&self, _name: &str, _entities: usize) {}
        fn entity_resolved(&self, _name: &str, _from_cache: bool) {
            let mut seen = self.events_at_cancel.lock().unwrap();
            if seen.is_none() {
                let recorded = self.store.list_events(self.handle.run_id()).unwrap().len();
                *seen = Some(recorded);
                self.handle.cancel();
            }
        }
        fn entity_failed(&self, _name: &str, _message: &str) {}
        fn entity_scored(&self, _result: &AnalysisResult) {}
        fn done(&self, _summary: &RunSummary) {}
    }

    #[tokio::test]
    async fn cancel_during_resolution_starts_no_new_entities() {
        let names = ["Alpha", "Bravo", "Charlie", "Delta", "Echo"];
        let h = Harness::with_search(
            &names,
            FakeSearch::new().with_delay(Duration::from_millis(10)),
        );
        let orchestrator = h.orchestrator_with(1, 10);
        let handle = orchestrator.start_job("test", names.iter().map(|n| n.to_string()).collect());
        let reporter = CancelOnFirstResolve {
            handle: handle.clone(),
            store: h.store.clone(),
            events_at_cancel: Mutex::new(None),
        };

        let summary = orchestrator.run(&handle, &reporter).await.unwrap();
        assert_eq!(summary.state, RunState::Cancelled);
        assert_eq!(summary.counts.completed, 0);
        assert_eq!(h.scorer.calls(), 0);
        // At most the entity already holding the next permit was in flight.
        assert!(h.search.calls() <= 2, "searches: {}", h.search.calls());
        assert!(summary.counts.cancelled >= names.len() - 2);

        let events = h.store.list_events(handle.run_id()).unwrap();
        let cut = reporter.events_at_cancel.lock().unwrap().expect("an entity resolved");
        assert!(
            events[cut..]
                .iter()
                .all(|e| e.status != EntityStatus::Resolving),
            "entity started after cancel: {:?}",
            &events[cut..]
        );
        for name in names {
            let statuses: Vec<EntityStatus> = events
                .iter()
                .filter(|e| e.entity_name == name)
                .map(|e| e.status)
                .collect();
            assert_eq!(statuses.last(), Some(&EntityStatus::Cancelled), "{name}: {statuses:?}");
            assert_eq!(
                statuses.iter().filter(|s| **s == EntityStatus::Cancelled).count(),
                1
            );
        }
        for entry in handle.entries() {
            assert_eq!(entry.status, EntityStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn fetch_concurrency_caps_in_flight_searches() {
        let names = ["Alpha", "Bravo", "Charlie", "Delta", "Echo", "Foxtrot", "Golf", "Hotel"];
        let h = Harness::with_search(
            &names,
            FakeSearch::new().with_delay(Duration::from_millis(20)),
        );
        let orchestrator = h.orchestrator_with(3, 10);
        let handle = orchestrator.start_job("test", names.iter().map(|n| n.to_string()).collect());

        let summary = orchestrator.run(&handle, &SilentProgress).await.unwrap();
        assert_eq!(summary.counts.completed, names.len());
        assert_eq!(h.search.calls(), names.len());
        assert_eq!(h.search.peak_in_flight(), 3);
    }

    #[tokio::test]
    async fn stall_detection_tracks_activity() {
        let h = Harness::new(&["Acme"]);
        let orchestrator = h.orchestrator(10);
        let handle = orchestrator.start_job("test", vec!["Acme".into()]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_stalled(Duration::from_millis(5)));
        assert!(!handle.is_stalled(Duration::from_secs(300)));

        orchestrator.run(&handle, &SilentProgress).await.unwrap();
        assert!(!handle.is_stalled(Duration::ZERO));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let h = Harness::new(&[]);
        let config = PipelineConfig {
            batch_size: 0,
            ..PipelineConfig::default()
        };
        let result = Orchestrator::from_config(
            &config,
            h.search.clone(),
            h.validator.clone(),
            h.scorer.clone(),
            h.store.clone(),
            h.store.clone(),
        );
        assert!(result.is_err());
    }
}
