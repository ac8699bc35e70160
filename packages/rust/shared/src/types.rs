//! Core domain types for Leadscope runs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TierBoundaries;

/// Cost in USD of a single search provider credit.
pub const SEARCH_COST_PER_CREDIT: f64 = 0.008;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Entity names
// ---------------------------------------------------------------------------

/// Normalize an entity name for cache lookup: trim, collapse whitespace, lowercase.
pub fn normalize_entity_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// EvidenceRecord
// ---------------------------------------------------------------------------

/// The most recent verified evidence for an entity, shared across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// Entity name as submitted.
    pub entity_name: String,
    /// Normalized lookup key (see [`normalize_entity_name`]).
    pub entity_key: String,
    /// Serialized provider results the evidence was formatted from.
    pub raw_text: String,
    /// Size-bounded evidence text handed to the classifier.
    pub formatted_text: String,
    /// SHA-256 of `formatted_text`.
    pub content_hash: String,
    /// Whether the evidence passed validation.
    pub verified: bool,
    /// Validator confidence in `[0, 1]`.
    pub confidence: f64,
    /// Validator summary message.
    pub validation_message: String,
    /// Validator issue list (may be non-empty on accepted evidence).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    /// Search credits spent producing this record.
    pub credits_used: u64,
    /// When the record was written.
    pub cached_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Scoring dimensions and tiers
// ---------------------------------------------------------------------------

/// A scoring dimension. Every [`AnalysisResult`] carries all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    GpuUseCase,
    ScaleBudget,
    GrowthSignals,
    Confidence,
}

impl Dimension {
    /// All dimensions, in reporting order.
    pub const ALL: [Dimension; 4] = [
        Dimension::GpuUseCase,
        Dimension::ScaleBudget,
        Dimension::GrowthSignals,
        Dimension::Confidence,
    ];

    /// JSON key used in classifier responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GpuUseCase => "gpu_use_case",
            Self::ScaleBudget => "scale_budget",
            Self::GrowthSignals => "growth_signals",
            Self::Confidence => "confidence",
        }
    }

    /// Maximum points for the dimension.
    pub fn max_points(&self) -> u32 {
        match self {
            Self::GpuUseCase => 50,
            Self::ScaleBudget => 30,
            Self::GrowthSignals => 10,
            Self::Confidence => 10,
        }
    }

    /// Conservative value substituted when the classifier output is unusable.
    ///
    /// Mirrors the "unknown" guidance given to the classifier: unknown use
    /// case, unknown funding, no growth signals, low confidence.
    pub fn fallback_points(&self) -> u32 {
        match self {
            Self::GpuUseCase => 5,
            Self::ScaleBudget => 10,
            Self::GrowthSignals => 0,
            Self::Confidence => 2,
        }
    }

    /// The complete fallback score set.
    pub fn fallback_scores() -> BTreeMap<Dimension, u32> {
        Self::ALL
            .iter()
            .map(|d| (*d, d.fallback_points()))
            .collect()
    }
}

/// Final priority bucket derived from the total score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PriorityTier {
    Hot,
    Warm,
    Watch,
    Cold,
}

impl PriorityTier {
    /// Classify a total score against the configured lower bounds.
    pub fn from_score(total: u32, bounds: &TierBoundaries) -> Self {
        if total >= bounds.hot {
            Self::Hot
        } else if total >= bounds.warm {
            Self::Warm
        } else if total >= bounds.watch {
            Self::Watch
        } else {
            Self::Cold
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "HOT",
            Self::Warm => "WARM",
            Self::Watch => "WATCH",
            Self::Cold => "COLD",
        }
    }

    /// Operator-facing next step for the tier.
    pub fn recommended_action(&self) -> &'static str {
        match self {
            Self::Hot => "High-priority outreach: strong infrastructure needs with budget",
            Self::Warm => "Worth qualifying: potential needs, investigate further",
            Self::Watch => "Monitor: may develop needs as they grow",
            Self::Cold => "Low priority: minimal or unverified needs",
        }
    }
}

impl std::fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an [`AnalysisResult`]'s scores came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    /// Parsed from a complete classifier response.
    Classifier,
    /// Deterministic defaults substituted for a malformed response.
    Fallback,
}

// ---------------------------------------------------------------------------
// AnalysisResult
// ---------------------------------------------------------------------------

/// Scored classification for one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub entity_name: String,
    /// One entry per [`Dimension`], never partial.
    pub scores: BTreeMap<Dimension, u32>,
    /// Sum of `scores`.
    pub total_score: u32,
    pub tier: PriorityTier,
    /// Use-case label reported by the classifier (e.g. `S`, `E`, `UNKNOWN`).
    pub classifier_tier: String,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signals_positive: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signals_negative: Vec<String>,
    pub source: ScoreSource,
    /// Classifier tokens consumed, including any payload-shrinking retry.
    pub tokens_used: u64,
    /// Why fallback scores were used, if they were.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalysisResult {
    /// Build a result from a complete score map, deriving total and tier.
    pub fn new(
        entity_name: impl Into<String>,
        scores: BTreeMap<Dimension, u32>,
        bounds: &TierBoundaries,
        source: ScoreSource,
    ) -> Self {
        let total_score = scores.values().sum();
        Self {
            entity_name: entity_name.into(),
            scores,
            total_score,
            tier: PriorityTier::from_score(total_score, bounds),
            classifier_tier: "UNKNOWN".into(),
            reasoning: String::new(),
            description: None,
            signals_positive: Vec::new(),
            signals_negative: Vec::new(),
            source,
            tokens_used: 0,
            error: None,
        }
    }

    /// Score for a single dimension.
    pub fn score(&self, dimension: Dimension) -> u32 {
        self.scores.get(&dimension).copied().unwrap_or(0)
    }

    pub fn is_fallback(&self) -> bool {
        self.source == ScoreSource::Fallback
    }
}

// ---------------------------------------------------------------------------
// Run bookkeeping
// ---------------------------------------------------------------------------

/// Per-entity lifecycle state within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Pending,
    Resolving,
    Scoring,
    Completed,
    Failed,
    Cancelled,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Scoring => "scoring",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: EntityStatus) -> bool {
        use EntityStatus::*;
        matches!(
            (self, next),
            (Pending, Resolving)
                | (Resolving, Scoring)
                | (Resolving, Failed)
                | (Scoring, Completed)
                | (Scoring, Failed)
                | (Pending | Resolving | Scoring, Cancelled)
        )
    }
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a stored state string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Count of entities per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub resolving: usize,
    pub scoring: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: EntityStatus) {
        match status {
            EntityStatus::Pending => self.pending += 1,
            EntityStatus::Resolving => self.resolving += 1,
            EntityStatus::Scoring => self.scoring += 1,
            EntityStatus::Completed => self.completed += 1,
            EntityStatus::Failed => self.failed += 1,
            EntityStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.resolving + self.scoring + self.completed + self.failed + self.cancelled
    }
}

/// Aggregated external-resource usage for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostTotals {
    /// Search provider credits consumed (rejected attempts included).
    pub search_credits: u64,
    /// Estimated search spend in USD.
    pub search_cost_usd: f64,
    /// Fetch attempts made against the search provider.
    pub fetch_attempts: u64,
    /// Tokens consumed by evidence validation.
    pub validator_tokens: u64,
    /// Tokens consumed by scoring.
    pub scoring_tokens: u64,
    /// Entities resolved from the evidence cache.
    pub cache_hits: u64,
    /// Entities that required a fresh fetch.
    pub cache_misses: u64,
}

/// Estimate search spend in USD from consumed credits.
pub fn search_cost_usd(credits: u64) -> f64 {
    credits as f64 * SEARCH_COST_PER_CREDIT
}
