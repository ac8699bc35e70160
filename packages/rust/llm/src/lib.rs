//! Chat-completion provider access for Leadscope.
//!
//! Both the evidence validator and the scoring engine talk to an
//! OpenAI-compatible endpoint through the [`ChatProvider`] trait.

pub mod chat;
pub mod json;
pub mod openai;

pub use chat::{ChatError, ChatMessage, ChatProvider, ChatRequest, ChatResponse, Role};
pub use json::extract_json_object;
pub use openai::OpenAiCompatClient;
