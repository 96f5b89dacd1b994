//! Scripted Adapter
//!
//! A deterministic, in-memory [`ProviderAdapter`] that replays prepared
//! scripts. Used by tests and offline demos to drive sessions through exact
//! token sequences, failures, and pauses.
//!
//! Each call to [`ProviderAdapter::open`] consumes the next queued script.
//! A [`ScriptGate`] step blocks the script until the test opens the gate,
//! which makes interleavings like "abort after exactly two tokens"
//! reproducible.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::traits::{
    FinishReason, GenerationRequest, NormalizedEvent, ProviderAdapter, ProviderError,
    ProviderErrorKind, ProviderFactory,
};
use super::{ProviderKind, ADAPTER_CHANNEL_CAPACITY};
use crate::credentials::ProviderCredential;

/// A latch that holds a script until opened
#[derive(Clone, Debug)]
pub struct ScriptGate {
    state: Arc<watch::Sender<bool>>,
}

impl ScriptGate {
    /// Create a closed gate
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Release every script waiting on this gate
    pub fn open(&self) {
        self.state.send_replace(true);
    }

    /// Whether the gate has been opened
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for ScriptGate {
    fn default() -> Self {
        Self::new()
    }
}

/// One step of a script
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Emit a token
    Token(String),
    /// Emit `Done` and end the stream
    Done(FinishReason),
    /// Emit an error and end the stream
    Error(ProviderError),
    /// Fail `open` itself (only meaningful as the first step)
    FailOpen(ProviderError),
    /// Block until the gate is opened
    Wait(ScriptGate),
    /// Sleep before the next step
    Pause(Duration),
    /// End the stream without a terminal event
    Disconnect,
    /// Never emit anything again
    Hang,
}

/// Build a script that streams `tokens` then completes
#[must_use]
pub fn tokens(tokens: &[&str]) -> Vec<ScriptStep> {
    tokens
        .iter()
        .map(|t| ScriptStep::Token((*t).to_string()))
        .chain(std::iter::once(ScriptStep::Done(FinishReason::Stop)))
        .collect()
}

/// Deterministic adapter replaying queued scripts
pub struct ScriptedAdapter {
    kind: ProviderKind,
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    cancellations: Arc<AtomicUsize>,
}

impl ScriptedAdapter {
    /// Create an adapter with no scripts queued
    #[must_use]
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            cancellations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue a script, builder style
    #[must_use]
    pub fn with_script(self, script: Vec<ScriptStep>) -> Self {
        self.push_script(script);
        self
    }

    /// Queue a script for the next `open`
    pub fn push_script(&self, script: Vec<ScriptStep>) {
        self.scripts.lock().push_back(script);
    }

    /// Requests received so far, in order
    #[must_use]
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    /// Number of times `open` was called
    #[must_use]
    pub fn opened(&self) -> usize {
        self.requests.lock().len()
    }

    /// Number of streams that observed their receiver being dropped
    #[must_use]
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn open(
        &self,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<NormalizedEvent>, ProviderError> {
        self.requests.lock().push(request);
        let Some(script) = self.scripts.lock().pop_front() else {
            return Err(ProviderError::new(
                ProviderErrorKind::InvalidRequest,
                "no script queued",
                false,
            ));
        };
        if let Some(ScriptStep::FailOpen(err)) = script.first() {
            return Err(err.clone());
        }

        let (tx, rx) = mpsc::channel(ADAPTER_CHANNEL_CAPACITY);
        let cancellations = Arc::clone(&self.cancellations);

        tokio::spawn(async move {
            for step in script {
                let event = match step {
                    ScriptStep::Token(text) => NormalizedEvent::Token(text),
                    ScriptStep::Done(reason) => NormalizedEvent::Done(reason),
                    ScriptStep::Error(err) => NormalizedEvent::Error(err),
                    ScriptStep::Disconnect => return,
                    ScriptStep::FailOpen(_) => continue,
                    ScriptStep::Wait(gate) => {
                        tokio::select! {
                            biased;
                            () = tx.closed() => break,
                            () = gate.wait() => continue,
                        }
                    }
                    ScriptStep::Pause(delay) => {
                        tokio::select! {
                            biased;
                            () = tx.closed() => break,
                            () = tokio::time::sleep(delay) => continue,
                        }
                    }
                    ScriptStep::Hang => break,
                };
                let terminal = event.is_terminal();
                if tx.send(event).await.is_err() {
                    cancellations.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                if terminal {
                    return;
                }
            }
            // Hold the stream open until the consumer goes away.
            tx.closed().await;
            cancellations.fetch_add(1, Ordering::SeqCst);
        });

        Ok(rx)
    }
}

/// Factory handing out one scripted adapter for every provider
#[derive(Clone)]
pub struct ScriptedFactory {
    adapter: Arc<ScriptedAdapter>,
}

impl ScriptedFactory {
    /// Serve every provider from `adapter`
    #[must_use]
    pub fn new(adapter: Arc<ScriptedAdapter>) -> Self {
        Self { adapter }
    }

    /// The shared adapter
    #[must_use]
    pub fn scripted(&self) -> &Arc<ScriptedAdapter> {
        &self.adapter
    }
}

impl ProviderFactory for ScriptedFactory {
    fn adapter(
        &self,
        _kind: ProviderKind,
        _credential: ProviderCredential,
    ) -> Arc<dyn ProviderAdapter> {
        Arc::clone(&self.adapter) as Arc<dyn ProviderAdapter>
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use crate::provider::traits::ChatTurn;

    fn request() -> GenerationRequest {
        GenerationRequest::new("test", vec![ChatTurn::new(Role::User, "hi")])
    }

    #[tokio::test]
    async fn test_replays_script_in_order() {
        let adapter = ScriptedAdapter::new(ProviderKind::OpenAi).with_script(tokens(&["a", "b"]));
        let mut rx = adapter.open(request()).await.unwrap();

        assert_eq!(rx.recv().await, Some(NormalizedEvent::Token("a".into())));
        assert_eq!(rx.recv().await, Some(NormalizedEvent::Token("b".into())));
        assert_eq!(rx.recv().await, Some(NormalizedEvent::Done(FinishReason::Stop)));
        assert_eq!(rx.recv().await, None);
        assert_eq!(adapter.opened(), 1);
    }

    #[tokio::test]
    async fn test_gate_holds_script() {
        let gate = ScriptGate::new();
        let adapter = ScriptedAdapter::new(ProviderKind::OpenAi).with_script(vec![
            ScriptStep::Token("a".into()),
            ScriptStep::Wait(gate.clone()),
            ScriptStep::Token("b".into()),
            ScriptStep::Done(FinishReason::Stop),
        ]);
        let mut rx = adapter.open(request()).await.unwrap();

        assert_eq!(rx.recv().await, Some(NormalizedEvent::Token("a".into())));
        let blocked = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(blocked.is_err());

        gate.open();
        assert_eq!(rx.recv().await, Some(NormalizedEvent::Token("b".into())));
    }

    #[tokio::test]
    async fn test_dropping_receiver_cancels() {
        let adapter = ScriptedAdapter::new(ProviderKind::OpenAi).with_script(vec![
            ScriptStep::Token("a".into()),
            ScriptStep::Hang,
        ]);
        let mut rx = adapter.open(request()).await.unwrap();
        assert_eq!(rx.recv().await, Some(NormalizedEvent::Token("a".into())));
        drop(rx);

        tokio::time::timeout(Duration::from_secs(1), async {
            while adapter.cancellations() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_fail_open_and_empty_queue() {
        let adapter = ScriptedAdapter::new(ProviderKind::Anthropic)
            .with_script(vec![ScriptStep::FailOpen(ProviderError::from_status(503, ""))]);

        let err = adapter.open(request()).await.unwrap_err();
        assert!(err.retryable);

        let err = adapter.open(request()).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::InvalidRequest);
        assert_eq!(adapter.opened(), 2);
    }
}
