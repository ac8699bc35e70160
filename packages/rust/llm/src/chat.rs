//! Chat protocol types and the [`ChatProvider`] trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A single completion request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

/// Completion text plus usage accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub model: String,
    pub latency_ms: u64,
}

impl ChatResponse {
    pub fn total_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}

/// Classified provider failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatError {
    /// HTTP 413, or a 400 that names the context window.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("provider call timed out")]
    Timeout,

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ChatError {
    /// Whether a smaller prompt might succeed where this one failed.
    pub fn is_payload_rejection(&self) -> bool {
        matches!(self, Self::PayloadTooLarge(_) | Self::BadRequest(_))
    }

    /// Classify an HTTP 400 body: context-window complaints become
    /// [`ChatError::PayloadTooLarge`].
    pub fn from_bad_request(body: &str) -> Self {
        let lower = body.to_lowercase();
        let mentions_size = ["context length", "context_length", "maximum context", "too large", "too_large", "too long"]
            .iter()
            .any(|needle| lower.contains(needle));
        if mentions_size {
            Self::PayloadTooLarge(body.to_string())
        } else {
            Self::BadRequest(body.to_string())
        }
    }
}

/// A black-box chat-completion service.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_classification() {
        assert!(matches!(
            ChatError::from_bad_request("This model's maximum context length is 8192 tokens"),
            ChatError::PayloadTooLarge(_)
        ));
        assert!(matches!(
            ChatError::from_bad_request("invalid value for temperature"),
            ChatError::BadRequest(_)
        ));
    }

    #[test]
    fn payload_rejection_kinds() {
        assert!(ChatError::PayloadTooLarge("x".into()).is_payload_rejection());
        assert!(ChatError::BadRequest("x".into()).is_payload_rejection());
        assert!(!ChatError::Timeout.is_payload_rejection());
        assert!(!ChatError::RateLimited.is_payload_rejection());
        assert!(
            !ChatError::Status {
                status: 500,
                body: String::new()
            }
            .is_payload_rejection()
        );
    }

    #[test]
    fn request_serializes_roles_lowercase() {
        let request = ChatRequest {
            model: "m".into(),
            messages: vec![ChatMessage::system("s"), ChatMessage::user("u")],
            temperature: 0.3,
            top_p: 0.9,
            max_tokens: 100,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["max_tokens"], 100);
    }
}
