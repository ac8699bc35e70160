//! Provider-neutral search types and the [`SearchProvider`] trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// How thoroughly the provider searches. Determines credit cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchDepth {
    Basic,
    Advanced,
}

impl SearchDepth {
    /// Provider credits charged per request at this depth.
    pub fn credits(&self) -> u64 {
        match self {
            Self::Basic => 1,
            Self::Advanced => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Advanced => "advanced",
        }
    }

    /// Parse a config value, defaulting unknown strings to `Advanced`.
    pub fn from_config(s: &str) -> Self {
        if s.eq_ignore_ascii_case("basic") {
            Self::Basic
        } else {
            Self::Advanced
        }
    }
}

/// A single search request.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub max_results: u32,
    pub search_depth: SearchDepth,
    /// Ask the provider for full page bodies in addition to snippets.
    pub include_raw_content: bool,
}

/// One ranked result returned by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    #[serde(default)]
    pub title: String,
    /// Provider snippet.
    #[serde(default)]
    pub content: String,
    /// Relevance in `[0, 1]`.
    #[serde(default)]
    pub score: f64,
    /// Full page body, when requested and available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<String>,
}

impl SearchHit {
    /// Body text to show the classifier: raw content when present, else the snippet.
    pub fn body(&self) -> &str {
        match self.raw_content.as_deref() {
            Some(raw) if !raw.trim().is_empty() => raw,
            _ => &self.content,
        }
    }
}

/// Results of one search call.
#[derive(Debug, Clone, Default)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// Credits charged for this call.
    pub credits_used: u64,
    /// Provider-reported response time in seconds, if any.
    pub response_time: Option<f64>,
}

/// Errors a search provider can report.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("search request timed out")]
    Timeout,

    #[error("search provider rate limited the request")]
    RateLimited,

    #[error("search provider rejected credentials (HTTP {0})")]
    Unauthorized(u16),

    #[error("search provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("search transport error: {0}")]
    Transport(String),

    #[error("invalid search response: {0}")]
    InvalidResponse(String),
}

impl SearchError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::RateLimited | Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Unauthorized(_) | Self::InvalidResponse(_) => false,
        }
    }
}

/// A black-box search service.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError>;
}
