//! OpenAI Chat Completions Adapter
//!
//! `POST {base}/chat/completions` with `stream: true`. Each SSE `data:` line
//! carries a chunk whose `choices[0].delta.content` is the next piece of
//! text; `choices[0].finish_reason` arrives on the last chunk and the body
//! ends with `data: [DONE]`.
//!
//! The decoder here is shared with the Mistral adapter, which speaks the
//! same wire format.

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

/// Instruction appended after a partial assistant turn when resuming
const CONTINUE_PROMPT: &str =
    "Continue your previous reply exactly where it stopped. Do not repeat any text.";

/// Adapter for the OpenAI chat completions API
pub struct OpenAiAdapter {
    client: reqwest::Client,
    url: String,
    credential: ProviderCredential,
    timeout: Duration,
}

impl OpenAiAdapter {
    /// Create an adapter rooted at `base_url`
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        credential: ProviderCredential,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            credential,
            timeout,
        }
    }

    fn body(request: &GenerationRequest) -> Value {
        let mut messages = chat_messages(request);
        if let Some(seed) = &request.continuation {
            messages.push(json!({ "role": "assistant", "content": seed }));
            messages.push(json!({ "role": "user", "content": CONTINUE_PROMPT }));
        }
        chat_completions_body(request, messages)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn open(
        &self,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<NormalizedEvent>, ProviderError> {
        tracing::debug!(model = %request.model, turns = request.turns.len(), "Opening OpenAI stream");
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.credential.expose())
            .timeout(self.timeout)
            .json(&Self::body(&request))
            .send()
            .await
            .map_err(|e| ProviderError::network(e.to_string()))?;
        let response = check_status(response).await?;
        Ok(spawn_sse_pump(response, ChatCompletionsDecoder::default()))
    }
}

// ============================================================================
// Shared chat-completions wire format
// ============================================================================

/// Conversation turns in chat-completions shape
pub(crate) fn chat_messages(request: &GenerationRequest) -> Vec<Value> {
    request
        .turns
        .iter()
        .map(|turn| json!({ "role": turn.role.as_str(), "content": turn.content }))
        .collect()
}

/// Request body for a streaming chat-completions call
pub(crate) fn chat_completions_body(request: &GenerationRequest, messages: Vec<Value>) -> Value {
    json!({
        "model": request.model,
        "messages": messages,
        "stream": true,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
    })
}

/// Decoder for chat-completions chunks
#[derive(Default)]
pub(crate) struct ChatCompletionsDecoder {
    finish_reason: Option<FinishReason>,
}

impl SseDecoder for ChatCompletionsDecoder {
    fn decode(&mut self, _event: &str, data: &str) -> Vec<NormalizedEvent> {
        let data = data.trim();
        if data == "[DONE]" {
            return vec![NormalizedEvent::Done(
                self.finish_reason.unwrap_or(FinishReason::Stop),
            )];
        }

        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            tracing::debug!(len = data.len(), "Skipping undecodable chunk");
            return Vec::new();
        };

        if let Some(error) = chunk.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("provider reported an error");
            return vec![NormalizedEvent::Error(ProviderError::new(
                ProviderErrorKind::Upstream,
                message,
                false,
            ))];
        }

        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            return Vec::new();
        };

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(FinishReason::from_provider(reason));
        }

        match choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
        {
            Some(text) if !text.is_empty() => vec![NormalizedEvent::Token(text.to_string())],
            _ => Vec::new(),
        }
    }

    fn finish(&mut self) -> NormalizedEvent {
        match self.finish_reason {
            Some(reason) => NormalizedEvent::Done(reason),
            None => NormalizedEvent::Error(ProviderError::disconnected()),
        }
    }
}
