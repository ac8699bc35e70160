//! Tavily-compatible search client.
//!
//! `POST {base}/search` with bearer auth. Provider-synthesized answers are
//! never requested and never deserialized.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use leadscope_shared::{LeadscopeError, Result};

use crate::provider::{SearchError, SearchHit, SearchProvider, SearchRequest, SearchResponse};

/// User-Agent string for provider requests.
const USER_AGENT: &str = concat!("Leadscope/", env!("CARGO_PKG_VERSION"));

#[derive(Serialize)]
struct SearchBody<'a> {
    query: &'a str,
    max_results: u32,
    search_depth: &'a str,
    include_raw_content: bool,
    include_answer: bool,
}

#[derive(Deserialize)]
struct SearchReply {
    #[serde(default)]
    results: Vec<SearchHit>,
    #[serde(default)]
    response_time: Option<serde_json::Value>,
}

/// HTTP client for a Tavily-compatible search API.
pub struct TavilyClient {
    client: Client,
    endpoint: Url,
    api_key: String,
}

impl TavilyClient {
    /// Build a client for `base_url` (e.g. `https://api.tavily.com`).
    pub fn new(base_url: &str, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| LeadscopeError::config(format!("invalid search base_url {base_url}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join("search")
            .map_err(|e| LeadscopeError::config(format!("invalid search endpoint: {e}")))?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| LeadscopeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl SearchProvider for TavilyClient {
    #[instrument(skip_all, fields(query = %request.query))]
    async fn search(
        &self,
        request: &SearchRequest,
    ) -> std::result::Result<SearchResponse, SearchError> {
        let body = SearchBody {
            query: &request.query,
            max_results: request.max_results,
            search_depth: request.search_depth.as_str(),
            include_raw_content: request.include_raw_content,
            include_answer: false,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => SearchError::RateLimited,
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    SearchError::Unauthorized(status.as_u16())
                }
                StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => SearchError::Timeout,
                _ => SearchError::Status {
                    status: status.as_u16(),
                    body: text.chars().take(500).collect(),
                },
            });
        }

        let reply: SearchReply = response
            .json()
            .await
            .map_err(|e| SearchError::InvalidResponse(e.to_string()))?;

        let response_time = reply.response_time.as_ref().and_then(|v| match v {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        });

        debug!(results = reply.results.len(), "search returned");

        Ok(SearchResponse {
            hits: reply.results,
            credits_used: request.search_depth.credits(),
            response_time,
        })
    }
}

fn classify_transport(e: reqwest::Error) -> SearchError {
    if e.is_timeout() {
        SearchError::Timeout
    } else {
        SearchError::Transport(e.to_string())
    }
}
