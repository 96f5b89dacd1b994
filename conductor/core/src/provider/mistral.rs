//! Mistral Chat Completions Adapter
//!
//! Same wire format as OpenAI. Continuation uses Mistral's assistant
//! `prefix` flag, so the model extends the partial reply in place.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::openai::{chat_completions_body, chat_messages, ChatCompletionsDecoder};
use super::sse::{check_status, spawn_sse_pump};
use super::traits::{GenerationRequest, NormalizedEvent, ProviderAdapter, ProviderError};
use super::ProviderKind;
use crate::credentials::ProviderCredential;

/// Adapter for the Mistral chat completions API
pub struct MistralAdapter {
    client: reqwest::Client,
    url: String,
    credential: ProviderCredential,
    timeout: Duration,
}

impl MistralAdapter {
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
            messages.push(json!({ "role": "assistant", "content": seed, "prefix": true }));
        }
        chat_completions_body(request, messages)
    }
}

#[async_trait]
impl ProviderAdapter for MistralAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mistral
    }

    async fn open(
        &self,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<NormalizedEvent>, ProviderError> {
        tracing::debug!(model = %request.model, turns = request.turns.len(), "Opening Mistral stream");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use crate::provider::traits::{ChatTurn, FinishReason};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_continuation_uses_prefix_flag() {
        let request = GenerationRequest::new("mistral-small-latest", vec![ChatTurn::new(Role::User, "hi")])
            .with_continuation("Once upon");
        let body = MistralAdapter::body(&request);
        let messages = body["messages"].as_array().unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"], "Once upon");
        assert_eq!(messages[1]["prefix"], true);
    }

    #[tokio::test]
    async fn test_open_streams_from_server() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Bonjour\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"model_length\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer m-key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;

        let adapter = MistralAdapter::new(
            reqwest::Client::new(),
            &server.uri(),
            ProviderCredential::new("m-key"),
            Duration::from_secs(5),
        );
        let mut rx = adapter
            .open(GenerationRequest::new("open-mistral-7b", vec![ChatTurn::new(Role::User, "salut")]))
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(NormalizedEvent::Token("Bonjour".into())));
        assert_eq!(rx.recv().await, Some(NormalizedEvent::Done(FinishReason::Length)));
        assert_eq!(rx.recv().await, None);
    }
}
