//! Anthropic Messages Adapter
//!
//! `POST {base}/messages` with `stream: true`. System turns are lifted into
//! the top-level `system` field. The stream is a sequence of typed events:
//!
//! ```text
//! message_start → content_block_start → content_block_delta* →
//! content_block_stop → message_delta(stop_reason) → message_stop
//! ```
//!
//! with `ping` keep-alives and an `error` event that may arrive at any point.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::sse::{check_status, spawn_sse_pump, SseDecoder};
use super::traits::{
    FinishReason, GenerationRequest, NormalizedEvent, ProviderAdapter, ProviderError,
    ProviderErrorKind,
};
use super::ProviderKind;
use crate::credentials::ProviderCredential;
use crate::model::Role;

/// API version header value
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Adapter for the Anthropic messages API
pub struct AnthropicAdapter {
    client: reqwest::Client,
    url: String,
    credential: ProviderCredential,
    timeout: Duration,
}

impl AnthropicAdapter {
    /// Create an adapter rooted at `base_url`
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        credential: ProviderCredential,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            url: format!("{}/messages", base_url.trim_end_matches('/')),
            credential,
            timeout,
        }
    }

    fn body(request: &GenerationRequest) -> Value {
        let mut system = Vec::new();
        let mut messages = Vec::new();
        for turn in &request.turns {
            match turn.role {
                Role::System => system.push(turn.content.as_str()),
                role => messages.push(json!({ "role": role.as_str(), "content": turn.content })),
            }
        }

        // The API rejects a final assistant turn that ends in whitespace.
        if let Some(seed) = &request.continuation {
            let prefill = seed.trim_end();
            if !prefill.is_empty() {
                messages.push(json!({ "role": "assistant", "content": prefill }));
            }
        }

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": true,
        });
        if !system.is_empty() {
            body["system"] = Value::String(system.join("\n\n"));
        }
        body
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn open(
        &self,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<NormalizedEvent>, ProviderError> {
        tracing::debug!(model = %request.model, turns = request.turns.len(), "Opening Anthropic stream");
        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", self.credential.expose())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(self.timeout)
            .json(&Self::body(&request))
            .send()
            .await
            .map_err(|e| ProviderError::network(e.to_string()))?;
        let response = check_status(response).await?;
        Ok(spawn_sse_pump(response, MessagesDecoder::default()))
    }
}

/// Decoder for Anthropic message stream events
#[derive(Default)]
struct MessagesDecoder {
    stop_reason: Option<FinishReason>,
}

impl MessagesDecoder {
    fn classify(error: &Value) -> ProviderError {
        let error_type = error.get("type").and_then(Value::as_str).unwrap_or("");
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("provider reported an error");
        let (kind, retryable) = match error_type {
            "overloaded_error" => (ProviderErrorKind::Overloaded, true),
            "rate_limit_error" => (ProviderErrorKind::RateLimited, true),
            "api_error" => (ProviderErrorKind::Upstream, true),
            "authentication_error" | "permission_error" => (ProviderErrorKind::Auth, false),
            "invalid_request_error" => (ProviderErrorKind::InvalidRequest, false),
            _ => (ProviderErrorKind::Upstream, false),
        };
        ProviderError::new(kind, message, retryable)
    }
}

impl SseDecoder for MessagesDecoder {
    fn decode(&mut self, event: &str, data: &str) -> Vec<NormalizedEvent> {
        let Ok(payload) = serde_json::from_str::<Value>(data) else {
            tracing::debug!(event, "Skipping undecodable event");
            return Vec::new();
        };
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(event);

        match event_type {
            "content_block_delta" => {
                let delta = &payload["delta"];
                match delta.get("text").and_then(Value::as_str) {
                    Some(text) if !text.is_empty() => {
                        vec![NormalizedEvent::Token(text.to_string())]
                    }
                    _ => Vec::new(),
                }
            }
            "message_delta" => {
                if let Some(reason) = payload["delta"].get("stop_reason").and_then(Value::as_str) {
                    self.stop_reason = Some(FinishReason::from_provider(reason));
                }
                Vec::new()
            }
            "message_stop" => vec![NormalizedEvent::Done(
                self.stop_reason.unwrap_or(FinishReason::Stop),
            )],
            "error" => vec![NormalizedEvent::Error(Self::classify(&payload["error"]))],
            _ => Vec::new(),
        }
    }
}
