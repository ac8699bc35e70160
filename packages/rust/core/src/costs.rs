//! Run-wide cost counters, updated concurrently by pipeline stages.

use std::sync::atomic::{AtomicU64, Ordering};

use leadscope_shared::{CostTotals, search_cost_usd};

#[derive(Debug, Default)]
pub struct CostTracker {
    search_credits: AtomicU64,
    fetch_attempts: AtomicU64,
    validator_tokens: AtomicU64,
    scoring_tokens: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fetch(&self, attempts: u64, credits: u64) {
        self.fetch_attempts.fetch_add(attempts, Ordering::Relaxed);
        self.search_credits.fetch_add(credits, Ordering::Relaxed);
    }

    pub fn add_validator_tokens(&self, tokens: u64) {
        self.validator_tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn add_scoring_tokens(&self, tokens: u64) {
        self.scoring_tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CostTotals {
        let search_credits = self.search_credits.load(Ordering::Relaxed);
        CostTotals {
            search_credits,
            search_cost_usd: search_cost_usd(search_credits),
            fetch_attempts: self.fetch_attempts.load(Ordering::Relaxed),
            validator_tokens: self.validator_tokens.load(Ordering::Relaxed),
            scoring_tokens: self.scoring_tokens.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}
