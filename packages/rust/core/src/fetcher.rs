//! Evidence fetcher: one entity name in, size-bounded markdown evidence out.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use leadscope_search::{
    SearchDepth, SearchError, SearchHit, SearchProvider, SearchRequest, build_query,
    format_results, truncate_structured,
};
use leadscope_shared::PipelineConfig;

use crate::retry::Backoff;

/// Formatted evidence for one entity, not yet validated.
#[derive(Debug, Clone)]
pub struct RawEvidence {
    pub entity_name: String,
    /// JSON array of the hits the evidence was built from.
    pub raw_text: String,
    /// Markdown evidence, at most `max_evidence_bytes` long.
    pub formatted_text: String,
    /// SHA-256 hex of `formatted_text`.
    pub content_hash: String,
    pub hit_count: usize,
    pub credits_used: u64,
    pub attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("no search results above relevance {min_relevance} for {entity}")]
    NoResults {
        entity: String,
        min_relevance: f64,
        credits_used: u64,
        attempts: u32,
    },

    #[error("search failed after {attempts} attempt(s): {source}")]
    Provider {
        #[source]
        source: SearchError,
        credits_used: u64,
        attempts: u32,
    },

    #[error("fetcher unavailable: {0}")]
    Unavailable(String),
}

impl FetchError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::NoResults { attempts, .. } | Self::Provider { attempts, .. } => *attempts,
            Self::Unavailable(_) => 0,
        }
    }

    pub fn credits_used(&self) -> u64 {
        match self {
            Self::NoResults { credits_used, .. } | Self::Provider { credits_used, .. } => {
                *credits_used
            }
            Self::Unavailable(_) => 0,
        }
    }

    /// Whether a later, independent fetch could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { source, .. } => source.is_transient(),
            Self::NoResults { .. } | Self::Unavailable(_) => false,
        }
    }
}

/// Fetcher tunables.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub max_results: u32,
    pub min_relevance: f64,
    pub search_depth: SearchDepth,
    pub domain_guesses: bool,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub max_evidence_bytes: usize,
    pub concurrency: usize,
}

impl From<&PipelineConfig> for FetchSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_results: config.max_results,
            min_relevance: config.min_relevance,
            search_depth: SearchDepth::from_config(&config.search_depth),
            domain_guesses: config.domain_guesses,
            timeout: config.fetch_timeout,
            max_attempts: config.fetch_max_attempts.max(1),
            backoff: Backoff::new(config.fetch_retry_base),
            max_evidence_bytes: config.max_evidence_bytes,
            concurrency: config.fetch_concurrency.max(1),
        }
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

/// Bounded-concurrency wrapper around a [`SearchProvider`].
pub struct Fetcher {
    provider: Arc<dyn SearchProvider>,
    settings: FetchSettings,
    permits: Arc<Semaphore>,
}

impl Fetcher {
    pub fn new(provider: Arc<dyn SearchProvider>, settings: FetchSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.concurrency));
        Self {
            provider,
            settings,
            permits,
        }
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Fetch and format evidence for `entity_name`, retrying transient
    /// provider errors with exponential backoff.
    #[instrument(skip_all, fields(entity = %entity_name))]
    pub async fn fetch(&self, entity_name: &str) -> Result<RawEvidence, FetchError> {
        let request = SearchRequest {
            query: build_query(entity_name, self.settings.domain_guesses),
            max_results: self.settings.max_results,
            search_depth: self.settings.search_depth,
            include_raw_content: true,
        };

        let mut credits_used = 0u64;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|e| FetchError::Unavailable(e.to_string()))?;
                match tokio::time::timeout(self.settings.timeout, self.provider.search(&request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(SearchError::Timeout),
                }
            };

            match outcome {
                Ok(response) => {
                    credits_used += response.credits_used;
                    debug!(
                        attempt,
                        provider_secs = response.response_time,
                        "search responded"
                    );
                    return self.build_evidence(entity_name, response.hits, credits_used, attempt);
                }
                Err(e) if e.is_transient() && attempt < self.settings.max_attempts => {
                    let delay = self.settings.backoff.delay(attempt - 1);
                    warn!(
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "transient search error, retrying"
                    );
                    self.settings.backoff.sleep(attempt - 1).await;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "search failed");
                    return Err(FetchError::Provider {
                        source: e,
                        credits_used,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    fn build_evidence(
        &self,
        entity_name: &str,
        hits: Vec<SearchHit>,
        credits_used: u64,
        attempts: u32,
    ) -> Result<RawEvidence, FetchError> {
        let total = hits.len();
        let mut hits: Vec<SearchHit> = hits
            .into_iter()
            .filter(|h| h.score >= self.settings.min_relevance)
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));

        if hits.is_empty() {
            return Err(FetchError::NoResults {
                entity: entity_name.to_string(),
                min_relevance: self.settings.min_relevance,
                credits_used,
                attempts,
            });
        }

        let formatted = format_results(entity_name, &hits);
        let formatted_text = truncate_structured(&formatted, self.settings.max_evidence_bytes);
        if formatted_text.len() < formatted.len() {
            debug!(
                original = formatted.len(),
                kept = formatted_text.len(),
                "evidence truncated"
            );
        }
        let raw_text = raw_hits_json(&hits);

        info!(
            hits = hits.len(),
            dropped = total - hits.len(),
            credits = credits_used,
            bytes = formatted_text.len(),
            "evidence fetched"
        );

        Ok(RawEvidence {
            entity_name: entity_name.to_string(),
            raw_text,
            content_hash: content_hash(&formatted_text),
            formatted_text,
            hit_count: hits.len(),
            credits_used,
            attempts,
        })
    }
}

/// The kept hits as JSON, or empty (with a warning) if they cannot be encoded.
fn raw_hits_json(hits: &[SearchHit]) -> String {
    match serde_json::to_string(hits) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "raw hits could not be serialized; storing formatted evidence only");
            String::new()
        }
    }
}

/// SHA-256 hex digest of evidence text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSearch, hit};

    fn settings() -> FetchSettings {
        FetchSettings {
            backoff: Backoff::new(Duration::ZERO),
            ..FetchSettings::default()
        }
    }

    #[tokio::test]
    async fn filters_and_sorts_by_relevance() {
        let search = Arc::new(FakeSearch::new());
        search.respond(
            "Acme",
            vec![
                hit("https://low.example", 0.2, "irrelevant"),
                hit("https://mid.example", 0.5, "Acme news"),
                hit("https://acme.com", 0.95, "Acme home"),
            ],
        );
        let fetcher = Fetcher::new(search.clone(), settings());

        let evidence = fetcher.fetch("Acme").await.expect("fetch ok");
        assert_eq!(evidence.hit_count, 2);
        assert_eq!(evidence.credits_used, 2);
        assert_eq!(evidence.attempts, 1);
        let home = evidence.formatted_text.find("https://acme.com").unwrap();
        let mid = evidence.formatted_text.find("https://mid.example").unwrap();
        assert!(home < mid);
        assert!(!evidence.formatted_text.contains("low.example"));
        assert_eq!(evidence.content_hash, content_hash(&evidence.formatted_text));

        let query = search.queries().pop().unwrap();
        assert!(query.starts_with("\"Acme\""));
        assert!(query.contains("acme.com"));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let search = Arc::new(FakeSearch::new());
        search.fail_times("Acme", 2, || SearchError::RateLimited);
        search.respond("Acme", vec![hit("https://acme.com", 0.9, "Acme")]);
        let fetcher = Fetcher::new(search.clone(), settings());

        let evidence = fetcher.fetch("Acme").await.expect("third attempt succeeds");
        assert_eq!(evidence.attempts, 3);
        assert_eq!(search.calls(), 3);
    }

    #[tokio::test]
    async fn transient_errors_exhaust_after_max_attempts() {
        let search = Arc::new(FakeSearch::new());
        search.fail_times("Acme", 10, || SearchError::Timeout);
        let fetcher = Fetcher::new(search.clone(), settings());

        let err = fetcher.fetch("Acme").await.unwrap_err();
        assert_eq!(err.attempts(), 3);
        assert!(err.is_retryable());
        assert_eq!(search.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let search = Arc::new(FakeSearch::new());
        search.fail_times("Acme", 10, || SearchError::Unauthorized(401));
        let fetcher = Fetcher::new(search.clone(), settings());

        let err = fetcher.fetch("Acme").await.unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn empty_results_are_an_error_that_still_costs_credits() {
        let search = Arc::new(FakeSearch::new());
        search.respond("Ghost", vec![hit("https://x.example", 0.1, "noise")]);
        let fetcher = Fetcher::new(search, settings());

        let err = fetcher.fetch("Ghost").await.unwrap_err();
        assert!(matches!(err, FetchError::NoResults { .. }));
        assert_eq!(err.credits_used(), 2);
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let search = Arc::new(FakeSearch::new().with_delay(Duration::from_millis(200)));
        search.respond("Acme", vec![hit("https://acme.com", 0.9, "Acme")]);
        let fetcher = Fetcher::new(
            search,
            FetchSettings {
                timeout: Duration::from_millis(20),
                max_attempts: 2,
                ..settings()
            },
        );

        let err = fetcher.fetch("Acme").await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Provider {
                source: SearchError::Timeout,
                attempts: 2,
                ..
            }
        ));
    }

    #[test]
    fn raw_hits_survive_non_finite_scores() {
        let mut odd = hit("https://odd.example", 0.5, "Acme body");
        odd.score = f64::NAN;
        let json = raw_hits_json(&[hit("https://acme.com", 0.9, "Acme home"), odd]);
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1]["url"], "https://odd.example");
        assert!(parsed[1]["score"].is_null());
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_bound() {
        let search = Arc::new(FakeSearch::new().with_delay(Duration::from_millis(20)));
        let names = ["Alpha", "Bravo", "Charlie", "Delta", "Echo", "Foxtrot"];
        for name in names {
            search.respond(name, vec![hit("https://x.example", 0.9, name)]);
        }
        let fetcher = Arc::new(Fetcher::new(
            search.clone(),
            FetchSettings {
                concurrency: 2,
                ..settings()
            },
        ));

        let mut tasks = tokio::task::JoinSet::new();
        for name in names {
            let fetcher = fetcher.clone();
            tasks.spawn(async move { fetcher.fetch(name).await });
        }
        while let Some(joined) = tasks.join_next().await {
            assert!(joined.unwrap().is_ok());
        }
        assert_eq!(search.calls(), names.len());
        assert_eq!(search.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn evidence_is_bounded() {
        let search = Arc::new(FakeSearch::new());
        let body = "Acme ships robots to warehouses. ".repeat(5_000);
        search.respond(
            "Acme",
            (0..10)
                .map(|i| hit(&format!("https://s{i}.example"), 0.9, &body))
                .collect(),
        );
        let fetcher = Fetcher::new(
            search,
            FetchSettings {
                max_evidence_bytes: 100_000,
                ..settings()
            },
        );

        let evidence = fetcher.fetch("Acme").await.unwrap();
        assert!(evidence.formatted_text.len() <= 100_000);
        assert!(evidence.formatted_text.contains("[truncated: original "));
    }
}
