//! Shared SSE pump for HTTP adapters.

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Response;
use tokio::sync::mpsc;

use super::traits::{NormalizedEvent, ProviderError};
use super::ADAPTER_CHANNEL_CAPACITY;

/// Translates one provider's SSE events into normalized events
pub(crate) trait SseDecoder: Send + 'static {
    /// Decode one SSE event. May yield nothing (keep-alives, metadata).
    fn decode(&mut self, event: &str, data: &str) -> Vec<NormalizedEvent>;

    /// Called when the body ends before a terminal event was decoded
    fn finish(&mut self) -> NormalizedEvent {
        NormalizedEvent::Error(ProviderError::disconnected())
    }
}

/// Check the response status and turn non-success into a [`ProviderError`]
pub(crate) async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::from_status(status.as_u16(), &body))
}

/// Spawn a task that decodes `response` and forwards normalized events
///
/// The task stops at the first terminal event, or as soon as the receiver
/// is dropped, whichever comes first. Dropping the task drops the response
/// body and with it the upstream connection.
pub(crate) fn spawn_sse_pump<D: SseDecoder>(
    response: Response,
    mut decoder: D,
) -> mpsc::Receiver<NormalizedEvent> {
    let (tx, rx) = mpsc::channel(ADAPTER_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut events = Box::pin(response.bytes_stream().eventsource());

        loop {
            let next = tokio::select! {
                biased;
                () = tx.closed() => {
                    tracing::debug!("Receiver dropped, closing upstream stream");
                    return;
                }
                next = events.next() => next,
            };

            let outgoing = match next {
                Some(Ok(event)) => decoder.decode(&event.event, &event.data),
                Some(Err(e)) => vec![NormalizedEvent::Error(ProviderError::network(e.to_string()))],
                None => vec![decoder.finish()],
            };

            for event in outgoing {
                let terminal = event.is_terminal();
                if tx.send(event).await.is_err() || terminal {
                    return;
                }
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::traits::{FinishReason, ProviderErrorKind};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Emits every data payload as a token, `end` as done.
    struct EchoDecoder;

    impl SseDecoder for EchoDecoder {
        fn decode(&mut self, _event: &str, data: &str) -> Vec<NormalizedEvent> {
            match data {
                "end" => vec![NormalizedEvent::Done(FinishReason::Stop)],
                "skip" => Vec::new(),
                other => vec![NormalizedEvent::Token(other.to_string())],
            }
        }
    }

    async fn serve(body: &'static str) -> (MockServer, Response) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;
        let response = reqwest::Client::new()
            .get(format!("{}/sse", server.uri()))
            .send()
            .await
            .unwrap();
        (server, response)
    }

    async fn collect(mut rx: mpsc::Receiver<NormalizedEvent>) -> Vec<NormalizedEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_pump_stops_at_terminal_event() {
        let (_server, response) =
            serve("data: a\n\ndata: skip\n\ndata: b\n\ndata: end\n\ndata: late\n\n").await;

        let events = collect(spawn_sse_pump(response, EchoDecoder)).await;

        assert_eq!(
            events,
            vec![
                NormalizedEvent::Token("a".into()),
                NormalizedEvent::Token("b".into()),
                NormalizedEvent::Done(FinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn test_pump_reports_disconnect_without_terminal() {
        let (_server, response) = serve("data: a\n\n").await;

        let events = collect(spawn_sse_pump(response, EchoDecoder)).await;

        assert_eq!(events.len(), 2);
        match &events[1] {
            NormalizedEvent::Error(err) => {
                assert_eq!(err.kind, ProviderErrorKind::Disconnected);
                assert!(err.retryable);
            }
            other => panic!("expected disconnect error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_check_status_classifies_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;
        let response = reqwest::get(server.uri()).await.unwrap();

        let err = check_status(response).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::RateLimited);
        assert!(err.message.contains("slow down"));
    }
}
