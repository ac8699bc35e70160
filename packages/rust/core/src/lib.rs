//! Enrichment pipeline stages and the batch orchestrator for Leadscope.
//!
//! Data flows one way: [`pipeline::Orchestrator`] drives
//! [`cache::CacheCoordinator`] (which owns the [`fetcher::Fetcher`] and
//! [`validator::Validator`]) and then [`scoring::ScoringEngine`].

pub mod cache;
pub mod costs;
pub mod fetcher;
pub mod pipeline;
pub mod retry;
pub mod scoring;
pub mod validator;

#[cfg(test)]
mod testing;

pub use cache::{CacheCoordinator, CoordinatorSettings, Resolution, ResolutionFailure};
pub use costs::CostTracker;
pub use fetcher::{FetchError, FetchSettings, Fetcher, RawEvidence, content_hash};
pub use pipeline::{
    EntityEntry, JobHandle, Orchestrator, ProgressReporter, RunSummary, SilentProgress,
};
pub use retry::Backoff;
pub use scoring::{
    ClassifierOutcome, ScoringEngine, ScoringError, ScoringSettings, fallback_result, interpret,
};
pub use validator::{ValidationOutcome, Validator, ValidatorSettings};
