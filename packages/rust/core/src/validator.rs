//! Evidence validator: cheap checks that the fetched evidence is about the
//! entity and substantive enough to be worth scoring.
//!
//! Rejection is a value ([`ValidationOutcome`]), never an error.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, instrument, warn};

use leadscope_llm::{ChatError, ChatMessage, ChatProvider, ChatRequest, extract_json_object};
use leadscope_search::{RESULTS_HEADER, core_name};
use leadscope_shared::PipelineConfig;

const VALIDATION_SYSTEM_PROMPT: &str = r#"You check whether web search evidence is usable for researching a specific organization.

Judge the evidence on these points:
1. It is about the named organization, not a different one with a similar name.
2. It contains substantive information about what the organization does.
3. It is not dominated by spam, parked domains, domain-for-sale pages, or placeholder text.
4. The organization name itself does not look like a placeholder or test entry (e.g. "Test Company", "Example Inc", "FakeCo").
5. The match is more than incidental keyword overlap.

Respond with a single JSON object and nothing else:
{"is_valid": true|false, "confidence": 0.0-1.0, "message": "one sentence", "issues": ["short issue", ...]}"#;

/// Verdict on one piece of evidence.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    pub message: String,
    pub issues: Vec<String>,
    pub tokens_used: u64,
}

impl ValidationOutcome {
    fn rejected(message: impl Into<String>, issues: Vec<String>, tokens_used: u64) -> Self {
        Self {
            is_valid: false,
            confidence: 0.0,
            message: message.into(),
            issues,
            tokens_used,
        }
    }

    /// Acceptance rule: valid and at least `threshold` confident (inclusive).
    pub fn is_accepted(&self, threshold: f64) -> bool {
        self.is_valid && self.confidence >= threshold
    }
}

#[derive(Debug, Clone)]
pub struct ValidatorSettings {
    pub model: String,
    pub prefix_chars: usize,
    pub min_words: usize,
    pub timeout: Duration,
    pub max_tokens: u32,
}

impl From<&PipelineConfig> for ValidatorSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            model: config.validation_model.clone(),
            prefix_chars: config.validation_prefix_chars,
            min_words: config.min_words,
            timeout: config.validation_timeout,
            max_tokens: 512,
        }
    }
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

#[derive(Deserialize)]
struct Verdict {
    is_valid: bool,
    confidence: f64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    issues: Vec<String>,
}

pub struct Validator {
    provider: Arc<dyn ChatProvider>,
    settings: ValidatorSettings,
}

impl Validator {
    pub fn new(provider: Arc<dyn ChatProvider>, settings: ValidatorSettings) -> Self {
        Self { provider, settings }
    }

    #[instrument(skip_all, fields(entity = %entity_name))]
    pub async fn validate(&self, entity_name: &str, formatted_text: &str) -> ValidationOutcome {
        if let Some(outcome) = precheck(entity_name, formatted_text, self.settings.min_words) {
            debug!(message = %outcome.message, "evidence rejected locally");
            return outcome;
        }

        let prefix: String = formatted_text
            .chars()
            .take(self.settings.prefix_chars)
            .collect();
        let request = ChatRequest {
            model: self.settings.model.clone(),
            messages: vec![
                ChatMessage::system(VALIDATION_SYSTEM_PROMPT),
                ChatMessage::user(format!(
                    "Entity: {entity_name}\n\nEvidence (first {} characters):\n{prefix}",
                    self.settings.prefix_chars
                )),
            ],
            temperature: 0.0,
            top_p: 1.0,
            max_tokens: self.settings.max_tokens,
        };

        let response =
            match tokio::time::timeout(self.settings.timeout, self.provider.complete(&request))
                .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return unavailable(e),
                Err(_) => return unavailable(ChatError::Timeout),
            };

        let tokens = response.total_tokens();
        match parse_verdict(&response.text) {
            Ok(verdict) => {
                let confidence = if verdict.confidence.is_finite() {
                    verdict.confidence.clamp(0.0, 1.0)
                } else {
                    0.0
                };
                debug!(is_valid = verdict.is_valid, confidence, "validator verdict");
                ValidationOutcome {
                    is_valid: verdict.is_valid,
                    confidence,
                    message: verdict.message,
                    issues: verdict.issues,
                    tokens_used: tokens,
                }
            }
            Err(reason) => {
                warn!(%reason, "unparseable validator response");
                ValidationOutcome::rejected(
                    "validator response could not be parsed",
                    vec![reason],
                    tokens,
                )
            }
        }
    }
}

fn unavailable(e: ChatError) -> ValidationOutcome {
    warn!(error = %e, "validator call failed");
    ValidationOutcome::rejected("validator unavailable", vec![e.to_string()], 0)
}

fn parse_verdict(text: &str) -> Result<Verdict, String> {
    let json = extract_json_object(text).ok_or_else(|| "no JSON object in response".to_string())?;
    serde_json::from_str(json).map_err(|e| format!("invalid verdict JSON: {e}"))
}

/// Words outside the markdown scaffolding added by the formatter.
fn content_word_count(text: &str) -> usize {
    text.lines()
        .filter(|line| {
            let line = line.trim_start();
            !(line.starts_with('#')
                || line.starts_with("URL:")
                || line.starts_with("Relevance:")
                || line.starts_with("[truncated:"))
        })
        .map(|line| line.split_whitespace().count())
        .sum()
}

/// Whether the evidence names the entity, by core name or compact slug.
/// The formatter's own header line does not count.
fn mentions_entity(entity_name: &str, text: &str) -> bool {
    let core = core_name(entity_name);
    if core.is_empty() {
        return true;
    }
    let haystack = text
        .lines()
        .filter(|line| !line.starts_with(RESULTS_HEADER))
        .collect::<Vec<_>>()
        .join("\n")
        .to_lowercase();
    if haystack.contains(&core) {
        return true;
    }
    let compact: String = core.chars().filter(|c| c.is_alphanumeric()).collect();
    !compact.is_empty() && haystack.contains(&compact)
}

/// Local rejections that need no provider call.
fn precheck(entity_name: &str, text: &str, min_words: usize) -> Option<ValidationOutcome> {
    let words = content_word_count(text);
    if words < min_words {
        return Some(ValidationOutcome::rejected(
            format!("evidence too thin: {words} words, need {min_words}"),
            vec!["insufficient content".into()],
            0,
        ));
    }
    if !mentions_entity(entity_name, text) {
        return Some(ValidationOutcome::rejected(
            format!("evidence never mentions \"{}\"", core_name(entity_name)),
            vec!["entity name absent from evidence".into()],
            0,
        ));
    }
    None
}
