//! Scoring engine: turns verified evidence into a scored classification.
//!
//! A response that cannot be interpreted is not a failure: the entity gets
//! the deterministic fallback score set instead. Only provider errors fail
//! an entity.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use leadscope_llm::{ChatError, ChatMessage, ChatProvider, ChatRequest, extract_json_object};
use leadscope_search::truncate_structured;
use leadscope_shared::{AnalysisResult, Dimension, PipelineConfig, ScoreSource, TierBoundaries};

const SCORING_SYSTEM_PROMPT: &str = r#"You assess how much GPU compute an organization is likely to need, using ONLY the evidence provided in the user message.

Ground rules:
- Do not use prior knowledge about the organization. If a fact is not in the evidence, treat it as unknown.
- If the evidence does not clearly establish what this organization actually does, or it may describe a different organization with a similar name, answer use_case_tier "UNKNOWN" with low scores.
- Marketing claims of being "AI-powered" are not evidence of model training.

Use-case tiers:
- S: trains foundation models from scratch.
- A: large-scale post-training (RLHF, DPO, custom alignment) of base models.
- B: serves AI products to millions of users on self-hosted inference.
- C: sells GPU, training or inference infrastructure to other AI companies.
- D: GPU-heavy domain with evidence of in-house models (autonomous vehicles, robotics, video AI, drug discovery, weather, quantitative trading).
- E: calls third-party model APIs or shows no evidence of its own training or inference.
- UNKNOWN: the evidence is insufficient to tell.

Scores:
- gpu_use_case (0-50): S 50, A 45, B 45, C 45, D 35, E 10, UNKNOWN 5.
- scale_budget (0-30): funding over $100M 30, $50-100M 25, $20-50M 20, $10-20M 15, $5-10M 10, under $5M 5, unknown 10.
- growth_signals (0-10): rapid growth +4, hiring ML or infrastructure roles +3, recent funding or expansion +3.
- confidence (0-10): multiple clear sources 10, some information 5, little or uncertain 2.

Respond with a single JSON object and nothing else:
{
  "description": "one or two sentences on what the organization does",
  "gpu_analysis": {
    "use_case_tier": "S|A|B|C|D|E|UNKNOWN",
    "reasoning": "two or three sentences citing the evidence",
    "signals_positive": ["..."],
    "signals_negative": ["..."]
  },
  "scores": {"gpu_use_case": 0, "scale_budget": 0, "growth_signals": 0, "confidence": 0}
}"#;

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// What one classifier call produced.
#[derive(Debug, Clone)]
pub enum ClassifierOutcome {
    /// Every required field was present and usable.
    Scored(AnalysisResult),
    /// The response arrived but could not be used as-is.
    Malformed {
        /// Dimensions that did parse, kept for diagnostics only.
        partial: BTreeMap<Dimension, u32>,
        reason: String,
    },
    ProviderError(ChatError),
}

/// A scoring call that failed at the provider. Carries the provider's text verbatim.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ScoringError {
    pub message: String,
    pub tokens_used: u64,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ScoringSettings {
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    /// Evidence bound; a payload rejection retries at half of it.
    pub max_evidence_bytes: usize,
    pub tiers: TierBoundaries,
}

impl From<&PipelineConfig> for ScoringSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            model: config.scoring_model.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
            timeout: config.scoring_timeout,
            max_evidence_bytes: config.max_evidence_bytes,
            tiers: config.tiers,
        }
    }
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ScoringEngine {
    provider: Arc<dyn ChatProvider>,
    settings: ScoringSettings,
}

impl ScoringEngine {
    pub fn new(provider: Arc<dyn ChatProvider>, settings: ScoringSettings) -> Self {
        Self { provider, settings }
    }

    /// Score one entity. Malformed classifier output yields a fallback
    /// result; provider errors are returned.
    #[instrument(skip_all, fields(entity = %entity_name))]
    pub async fn score(
        &self,
        entity_name: &str,
        evidence: &str,
    ) -> Result<AnalysisResult, ScoringError> {
        let (mut outcome, mut tokens) = self.classify(entity_name, evidence).await;

        let payload_rejected = matches!(
            &outcome,
            ClassifierOutcome::ProviderError(e) if e.is_payload_rejection()
        );
        if payload_rejected {
            // Never resend the same payload: halve the bound and only retry if that cut something.
            let bound = (self.settings.max_evidence_bytes / 2).min(evidence.len() / 2);
            let smaller = truncate_structured(evidence, bound);
            if smaller.len() < evidence.len() {
                warn!(
                    original = evidence.len(),
                    retry_bytes = smaller.len(),
                    "classifier rejected payload, retrying with smaller evidence"
                );
                let (retry, retry_tokens) = self.classify(entity_name, &smaller).await;
                outcome = retry;
                tokens += retry_tokens;
            }
        }

        match outcome {
            ClassifierOutcome::Scored(mut result) => {
                result.tokens_used = tokens;
                info!(
                    total = result.total_score,
                    tier = %result.tier,
                    tokens,
                    "entity scored"
                );
                Ok(result)
            }
            ClassifierOutcome::Malformed { partial, reason } => {
                warn!(
                    %reason,
                    parsed_dimensions = partial.len(),
                    "malformed classifier output, using fallback scores"
                );
                let mut result = fallback_result(entity_name, &self.settings.tiers, &reason);
                result.tokens_used = tokens;
                Ok(result)
            }
            ClassifierOutcome::ProviderError(e) => {
                warn!(error = %e, "scoring failed");
                Err(ScoringError {
                    message: e.to_string(),
                    tokens_used: tokens,
                })
            }
        }
    }

    async fn classify(&self, entity_name: &str, evidence: &str) -> (ClassifierOutcome, u64) {
        let request = ChatRequest {
            model: self.settings.model.clone(),
            messages: vec![
                ChatMessage::system(SCORING_SYSTEM_PROMPT),
                ChatMessage::user(format!(
                    "Entity: {entity_name}\n\nEvidence:\n{evidence}\n\nReturn the JSON object for {entity_name}."
                )),
            ],
            temperature: self.settings.temperature,
            top_p: self.settings.top_p,
            max_tokens: self.settings.max_tokens,
        };

        match tokio::time::timeout(self.settings.timeout, self.provider.complete(&request)).await {
            Ok(Ok(response)) => {
                debug!(latency_ms = response.latency_ms, "classifier responded");
                let tokens = response.total_tokens();
                (
                    interpret(entity_name, &response.text, &self.settings.tiers),
                    tokens,
                )
            }
            Ok(Err(e)) => (ClassifierOutcome::ProviderError(e), 0),
            Err(_) => (ClassifierOutcome::ProviderError(ChatError::Timeout), 0),
        }
    }
}

// ---------------------------------------------------------------------------
// Interpretation
// ---------------------------------------------------------------------------

/// Interpret raw classifier text. Pure: no I/O, no clock.
pub fn interpret(entity_name: &str, text: &str, tiers: &TierBoundaries) -> ClassifierOutcome {
    let Some(json) = extract_json_object(text) else {
        return malformed(BTreeMap::new(), "no JSON object in classifier response");
    };
    let value: Value = match serde_json::from_str(json) {
        Ok(v) => v,
        Err(e) => return malformed(BTreeMap::new(), format!("invalid JSON: {e}")),
    };

    let scores_obj = value.get("scores");
    let mut scores = BTreeMap::new();
    let mut missing = Vec::new();
    for dimension in Dimension::ALL {
        let raw = scores_obj.and_then(|s| {
            s.get(dimension.as_str()).or_else(|| match dimension {
                Dimension::GrowthSignals => s.get("timing_urgency"),
                _ => None,
            })
        });
        match raw.and_then(points) {
            Some(p) => {
                scores.insert(dimension, p.min(dimension.max_points()));
            }
            None => missing.push(dimension.as_str()),
        }
    }
    if !missing.is_empty() {
        return malformed(scores, format!("missing scores: {}", missing.join(", ")));
    }

    let analysis = value.get("gpu_analysis");
    let field = |key: &str, alias: &str| {
        value
            .get(key)
            .or_else(|| analysis.and_then(|a| a.get(alias)))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let Some(classifier_tier) = field("tier", "use_case_tier") else {
        return malformed(scores, "missing tier");
    };
    let Some(reasoning) = field("reasoning", "reasoning") else {
        return malformed(scores, "missing reasoning");
    };

    let description = value
        .get("description")
        .or_else(|| value.get("research").and_then(|r| r.get("description")))
        .and_then(Value::as_str)
        .map(str::to_string);
    let signals = |key: &str| {
        value
            .get(key)
            .or_else(|| analysis.and_then(|a| a.get(key)))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut result = AnalysisResult::new(entity_name, scores, tiers, ScoreSource::Classifier);
    result.classifier_tier = classifier_tier.to_uppercase();
    result.reasoning = reasoning;
    result.description = description;
    result.signals_positive = signals("signals_positive");
    result.signals_negative = signals("signals_negative");
    ClassifierOutcome::Scored(result)
}

/// Non-negative whole points from a JSON number or numeric string.
fn points(value: &Value) -> Option<u32> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then(|| n.max(0.0).round() as u32)
}

fn malformed(partial: BTreeMap<Dimension, u32>, reason: impl Into<String>) -> ClassifierOutcome {
    ClassifierOutcome::Malformed {
        partial,
        reason: reason.into(),
    }
}

/// The deterministic result used when classifier output is unusable.
pub fn fallback_result(entity_name: &str, tiers: &TierBoundaries, reason: &str) -> AnalysisResult {
    let mut result = AnalysisResult::new(
        entity_name,
        Dimension::fallback_scores(),
        tiers,
        ScoreSource::Fallback,
    );
    result.reasoning = format!(
        "Classifier output could not be used ({reason}); conservative default scores were applied."
    );
    result.error = Some(reason.to_string());
    result
}
