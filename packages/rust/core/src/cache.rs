//! Cache coordinator: resolves an entity name to verified evidence, reusing
//! the cross-run cache when it can and fetching otherwise.
//!
//! ```text
//! CacheLookup --hit--> Accepted
//! CacheLookup --miss--> Fetch
//! Fetch --ok--> Validate        Fetch --error--> Backoff | Failed
//! Validate --accept--> Persist --> Accepted
//! Validate --reject--> Backoff (attempts remain) | Failed
//! Backoff --> Fetch
//! ```
//!
//! Failed resolutions write nothing.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use leadscope_shared::{EvidenceRecord, PipelineConfig, normalize_entity_name};
use leadscope_storage::EvidenceStore;

use crate::costs::CostTracker;
use crate::fetcher::{FetchError, Fetcher, RawEvidence};
use crate::retry::Backoff;
use crate::validator::{ValidationOutcome, Validator};

/// Verified evidence for one entity.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub record: EvidenceRecord,
    pub from_cache: bool,
    /// Fetch+validate attempts made; 0 on a cache hit.
    pub attempts: u32,
}

/// Why an entity could not be resolved.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ResolutionFailure {
    pub message: String,
    pub issues: Vec<String>,
    pub attempts: u32,
}

impl ResolutionFailure {
    fn new(message: impl Into<String>, issues: Vec<String>, attempts: u32) -> Self {
        Self {
            message: message.into(),
            issues,
            attempts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Minimum validator confidence for acceptance (inclusive).
    pub threshold: f64,
    /// Total fetch+validate attempts per resolution.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl From<&PipelineConfig> for CoordinatorSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            threshold: config.validation_threshold,
            max_attempts: config.max_validation_retries.max(1),
            backoff: Backoff::new(config.validation_backoff),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

enum State {
    CacheLookup,
    Fetch { attempt: u32 },
    Validate { attempt: u32, evidence: RawEvidence },
    Backoff { attempt: u32 },
    Persist { attempt: u32, record: EvidenceRecord },
}

pub struct CacheCoordinator {
    store: Arc<dyn EvidenceStore>,
    fetcher: Fetcher,
    validator: Validator,
    settings: CoordinatorSettings,
    costs: Arc<CostTracker>,
}

impl CacheCoordinator {
    pub fn new(
        store: Arc<dyn EvidenceStore>,
        fetcher: Fetcher,
        validator: Validator,
        settings: CoordinatorSettings,
        costs: Arc<CostTracker>,
    ) -> Self {
        Self {
            store,
            fetcher,
            validator,
            settings,
            costs,
        }
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn costs(&self) -> &Arc<CostTracker> {
        &self.costs
    }

    #[instrument(skip_all, fields(entity = %entity_name))]
    pub async fn resolve(&self, entity_name: &str) -> Result<Resolution, ResolutionFailure> {
        let entity_key = normalize_entity_name(entity_name);
        if entity_key.is_empty() {
            return Err(ResolutionFailure::new("entity name is empty", Vec::new(), 0));
        }

        let max_attempts = self.settings.max_attempts;
        let mut credits_spent = 0u64;
        let mut state = State::CacheLookup;

        loop {
            state = match state {
                State::CacheLookup => match self.store.find_latest_verified(&entity_key).await {
                    Ok(Some(record)) => {
                        self.costs.cache_hit();
                        debug!(confidence = record.confidence, "evidence cache hit");
                        return Ok(Resolution {
                            record,
                            from_cache: true,
                            attempts: 0,
                        });
                    }
                    Ok(None) => {
                        self.costs.cache_miss();
                        State::Fetch { attempt: 1 }
                    }
                    Err(e) => {
                        warn!(error = %e, "evidence cache lookup failed, fetching instead");
                        self.costs.cache_miss();
                        State::Fetch { attempt: 1 }
                    }
                },

                State::Fetch { attempt } => match self.fetcher.fetch(entity_name).await {
                    Ok(evidence) => {
                        self.costs
                            .add_fetch(u64::from(evidence.attempts), evidence.credits_used);
                        credits_spent += evidence.credits_used;
                        State::Validate { attempt, evidence }
                    }
                    Err(e) => {
                        self.costs
                            .add_fetch(u64::from(e.attempts()), e.credits_used());
                        credits_spent += e.credits_used();
                        if e.is_retryable() && attempt < max_attempts {
                            warn!(attempt, error = %e, "evidence fetch failed, retrying");
                            State::Backoff { attempt }
                        } else {
                            warn!(attempt, error = %e, "evidence fetch failed");
                            return Err(fetch_failure(&e, attempt));
                        }
                    }
                },

                State::Validate { attempt, evidence } => {
                    let outcome = self
                        .validator
                        .validate(entity_name, &evidence.formatted_text)
                        .await;
                    self.costs.add_validator_tokens(outcome.tokens_used);

                    if outcome.is_accepted(self.settings.threshold) {
                        let record =
                            verified_record(entity_key.clone(), evidence, &outcome, credits_spent);
                        State::Persist { attempt, record }
                    } else {
                        info!(
                            attempt,
                            confidence = outcome.confidence,
                            message = %outcome.message,
                            "evidence rejected"
                        );
                        if attempt < max_attempts {
                            State::Backoff { attempt }
                        } else {
                            return Err(ResolutionFailure::new(
                                outcome.message,
                                outcome.issues,
                                attempt,
                            ));
                        }
                    }
                }

                State::Backoff { attempt } => {
                    self.settings.backoff.sleep(attempt - 1).await;
                    State::Fetch {
                        attempt: attempt + 1,
                    }
                }

                State::Persist { attempt, record } => {
                    if let Err(e) = self.store.upsert_evidence(&record).await {
                        warn!(error = %e, "failed to persist verified evidence");
                        return Err(ResolutionFailure::new(
                            format!("failed to persist evidence: {e}"),
                            Vec::new(),
                            attempt,
                        ));
                    }
                    info!(
                        attempt,
                        confidence = record.confidence,
                        credits = record.credits_used,
                        "evidence verified"
                    );
                    return Ok(Resolution {
                        record,
                        from_cache: false,
                        attempts: attempt,
                    });
                }
            };
        }
    }
}

fn fetch_failure(error: &FetchError, attempt: u32) -> ResolutionFailure {
    ResolutionFailure::new(error.to_string(), Vec::new(), attempt)
}

fn verified_record(
    entity_key: String,
    evidence: RawEvidence,
    outcome: &ValidationOutcome,
    credits_spent: u64,
) -> EvidenceRecord {
    EvidenceRecord {
        entity_name: evidence.entity_name,
        entity_key,
        raw_text: evidence.raw_text,
        formatted_text: evidence.formatted_text,
        content_hash: evidence.content_hash,
        verified: true,
        confidence: outcome.confidence,
        validation_message: outcome.message.clone(),
        issues: outcome.issues.clone(),
        credits_used: credits_spent,
        cached_at: Utc::now(),
    }
}

/// Settings with no waiting between attempts.
#[cfg(test)]
pub(crate) fn instant_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        backoff: Backoff::new(std::time::Duration::ZERO),
        ..CoordinatorSettings::default()
    }
}
