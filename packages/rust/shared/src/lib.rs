//! Shared types, error model, and configuration for Leadscope.
//!
//! This crate is the foundation depended on by all other Leadscope crates.
//! It provides:
//! - [`LeadscopeError`]: the unified error type
//! - Domain types ([`EvidenceRecord`], [`AnalysisResult`], [`EntityStatus`], [`RunId`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ClassifierConfig, PipelineConfig, PipelineSection, SearchConfig, TierBoundaries,
    config_dir, config_file_path, init_config, load_config, load_config_from, validate_api_keys,
};
pub use error::{LeadscopeError, Result};
pub use types::{
    AnalysisResult, CostTotals, Dimension, EntityStatus, EvidenceRecord, PriorityTier, RunId, RunState,
    ScoreSource, StatusCounts, normalize_entity_name, search_cost_usd,
};
