//! In-process fakes for the search and chat providers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use leadscope_llm::{ChatError, ChatProvider, ChatRequest, ChatResponse};
use leadscope_search::{SearchError, SearchHit, SearchProvider, SearchRequest, SearchResponse};

type ErrorFactory = Box<dyn Fn() -> SearchError + Send + Sync>;

#[derive(Default)]
struct SearchScript {
    failures_left: u32,
    failure: Option<ErrorFactory>,
    hits: Vec<SearchHit>,
    calls: usize,
}

/// Scripted search provider keyed by the quoted phrase at the start of the query.
#[derive(Default)]
pub struct FakeSearch {
    scripts: Mutex<HashMap<String, SearchScript>>,
    queries: Mutex<Vec<String>>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn respond(&self, name: &str, hits: Vec<SearchHit>) {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.entry(name.to_string()).or_default().hits = hits;
    }

    pub fn fail_times<F>(&self, name: &str, times: u32, error: F)
    where
        F: Fn() -> SearchError + Send + Sync + 'static,
    {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(name.to_string()).or_default();
        script.failures_left = times;
        script.failure = Some(Box::new(error));
    }

    pub fn calls(&self) -> usize {
        self.queries.lock().unwrap().len()
    }

    pub fn calls_for(&self, name: &str) -> usize {
        self.scripts
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.calls)
            .unwrap_or(0)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    /// Most `search` calls ever running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight count even when a timeout drops the call.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn quoted_phrase(query: &str) -> String {
    query
        .split('"')
        .nth(1)
        .unwrap_or(query)
        .to_string()
}

#[async_trait]
impl SearchProvider for FakeSearch {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        self.queries.lock().unwrap().push(request.query.clone());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let _running = InFlight(&self.in_flight);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let name = quoted_phrase(&request.query);
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(name).or_default();
        script.calls += 1;
        if script.failures_left > 0 {
            script.failures_left -= 1;
            if let Some(failure) = &script.failure {
                return Err(failure());
            }
        }
        Ok(SearchResponse {
            hits: script.hits.clone(),
            credits_used: request.search_depth.credits(),
            response_time: Some(0.1),
        })
    }
}

pub fn hit(url: &str, score: f64, body: &str) -> SearchHit {
    SearchHit {
        url: url.to_string(),
        title: format!("Page at {url}"),
        content: body.chars().take(200).collect(),
        score,
        raw_content: Some(body.to_string()),
    }
}

type Responder = Box<dyn Fn(&ChatRequest) -> Result<ChatResponse, ChatError> + Send + Sync>;

/// Chat provider answering every request through a closure.
pub struct FakeChat {
    responder: Responder,
    requests: Mutex<Vec<ChatRequest>>,
}

impl FakeChat {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&ChatRequest) -> Result<ChatResponse, ChatError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatProvider for FakeChat {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        self.requests.lock().unwrap().push(request.clone());
        (self.responder)(request)
    }
}

/// A successful completion worth 120 tokens.
pub fn reply(text: &str) -> Result<ChatResponse, ChatError> {
    Ok(ChatResponse {
        text: text.to_string(),
        tokens_in: 100,
        tokens_out: 20,
        model: "fake-model".into(),
        latency_ms: 1,
    })
}

/// Entity named on the `Entity:` line of a request's user message.
pub fn entity_in(request: &ChatRequest) -> String {
    request
        .messages
        .iter()
        .flat_map(|m| m.content.lines())
        .find_map(|line| line.strip_prefix("Entity: "))
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Formatter-shaped evidence with at least `words` content words about `name`.
pub fn evidence_text(name: &str, words: usize) -> String {
    let sentence = format!("{name} builds robotics software for warehouse automation teams.");
    let per_sentence = sentence.split_whitespace().count();
    let repeats = words.div_ceil(per_sentence).max(1);
    let body = vec![sentence; repeats].join(" ");
    format!(
        "# Search Results for: {name}\n\n## Source 1: {name} home\nURL: https://example.com\nRelevance: 0.90\n\n{body}\n"
    )
}

/// Hits whose bodies mention `name` often enough to pass local prechecks.
pub fn good_hits(name: &str) -> Vec<SearchHit> {
    let body = format!("{name} trains large models on GPU clusters and raised a Series B. ")
        .repeat(12);
    vec![
        hit("https://news.example/1", 0.92, &body),
        hit("https://blog.example/2", 0.71, &body),
    ]
}
