//! OpenAI-compatible `chat/completions` client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use leadscope_shared::{LeadscopeError, Result};

use crate::chat::{ChatError, ChatProvider, ChatRequest, ChatResponse};

const USER_AGENT: &str = concat!("Leadscope/", env!("CARGO_PKG_VERSION"));

#[derive(Deserialize)]
struct CompletionReply {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// HTTP client for any OpenAI-compatible inference endpoint.
pub struct OpenAiCompatClient {
    client: Client,
    endpoint: Url,
    api_key: String,
}

impl OpenAiCompatClient {
    /// Build a client for `base_url` (e.g. `https://api.example.com/v1/`).
    pub fn new(base_url: &str, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url).map_err(|e| {
            LeadscopeError::config(format!("invalid classifier base_url {base_url}: {e}"))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join("chat/completions")
            .map_err(|e| LeadscopeError::config(format!("invalid classifier endpoint: {e}")))?;

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
impl ChatProvider for OpenAiCompatClient {
    #[instrument(skip_all, fields(model = %request.model))]
    async fn complete(
        &self,
        request: &ChatRequest,
    ) -> std::result::Result<ChatResponse, ChatError> {
        let started = Instant::now();
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChatError::Timeout
                } else {
                    ChatError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(1_000).collect();
            return Err(match status {
                StatusCode::PAYLOAD_TOO_LARGE => ChatError::PayloadTooLarge(body),
                StatusCode::BAD_REQUEST => ChatError::from_bad_request(&body),
                StatusCode::TOO_MANY_REQUESTS => ChatError::RateLimited,
                StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ChatError::Timeout,
                _ => ChatError::Status {
                    status: status.as_u16(),
                    body,
                },
            });
        }

        let reply: CompletionReply = response
            .json()
            .await
            .map_err(|e| ChatError::InvalidResponse(e.to_string()))?;

        let text = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ChatError::InvalidResponse("response has no message content".into()))?;

        let (tokens_in, tokens_out) = reply
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));
        let latency_ms = started.elapsed().as_millis() as u64;

        debug!(tokens_in, tokens_out, latency_ms, "completion received");

        Ok(ChatResponse {
            text,
            tokens_in,
            tokens_out,
            model: reply.model.unwrap_or_else(|| request.model.clone()),
            latency_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatMessage;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ChatRequest {
        ChatRequest {
            model: "test-model".into(),
            messages: vec![ChatMessage::system("sys"), ChatMessage::user("hello")],
            temperature: 0.3,
            top_p: 0.9,
            max_tokens: 256,
        }
    }

    async fn client_for(server: &MockServer) -> OpenAiCompatClient {
        OpenAiCompatClient::new(&format!("{}/v1", server.uri()), "sk-test", Duration::from_secs(5))
            .unwrap()
    }

    #[tokio::test]
    async fn completion_parses_text_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({"model": "test-model", "top_p": 0.9})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "test-model",
                "choices": [{"message": {"role": "assistant", "content": "{\"ok\": true}"}}],
                "usage": {"prompt_tokens": 120, "completion_tokens": 30, "total_tokens": 150}
            })))
            .mount(&server)
            .await;

        let response = client_for(&server).await.complete(&request()).await.unwrap();
        assert_eq!(response.text, "{\"ok\": true}");
        assert_eq!(response.total_tokens(), 150);
        assert_eq!(response.model, "test-model");
    }

    #[tokio::test]
    async fn status_413_is_payload_too_large() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(413).set_body_string("request entity too large"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.complete(&request()).await.unwrap_err();
        assert!(matches!(err, ChatError::PayloadTooLarge(_)));
        assert!(err.is_payload_rejection());
    }

    #[tokio::test]
    async fn context_length_400_is_payload_too_large() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "This model's maximum context length is 32768 tokens"}
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).await.complete(&request()).await.unwrap_err();
        assert!(matches!(err, ChatError::PayloadTooLarge(_)));
    }

    #[tokio::test]
    async fn server_error_keeps_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.complete(&request()).await.unwrap_err();
        assert_eq!(err.to_string(), "provider returned HTTP 502: upstream down");
        assert!(!err.is_payload_rejection());
    }

    #[tokio::test]
    async fn empty_choices_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let err = client_for(&server).await.complete(&request()).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client =
            OpenAiCompatClient::new(&server.uri(), "k", Duration::from_millis(50)).unwrap();
        let err = client.complete(&request()).await.unwrap_err();
        assert!(matches!(err, ChatError::Timeout));
    }
}
