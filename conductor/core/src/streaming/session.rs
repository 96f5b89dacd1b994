//! Stream Session
//!
//! One live generation of one assistant message. The session owns the
//! authoritative in-memory content while it runs; the store holds the latest
//! checkpoint.
//!
//! # Lifecycle
//!
//! 1. A `pending` checkpoint is written, then `stream_start` is published.
//! 2. The provider is opened with the accumulated content as continuation.
//! 3. The first token moves the message to `streaming` (checkpointed). Later
//!    tokens are checkpointed on the [`CheckpointPolicy`] cadence, always
//!    before the token is published.
//! 4. Retryable provider failures reopen the provider with backoff, carrying
//!    everything generated so far as the continuation seed.
//! 5. The session ends `complete`, `aborted`, or `error`, with a final
//!    checkpoint and exactly one terminal event.
//!
//! A failed checkpoint write (including a sequence conflict) ends the session
//! with `error` and no further writes.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, timeout_at, Instant};

use super::checkpoint::{CheckpointClock, CheckpointPolicy};
use super::delivery::{DeliveryChannel, Subscription};
use super::state::SessionState;
use crate::config::StreamingConfig;
use crate::model::{Checkpoint, ConversationId, MessageId, MessageStatus};
use crate::provider::{
    FinishReason, GenerationRequest, NormalizedEvent, ProviderAdapter, ProviderError, ProviderKind,
};
use crate::store::{ConversationStore, StoreError};

/// Result of an abort request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AbortOutcome {
    /// The session stopped and the message is now `aborted`
    Aborted,
    /// The message had already finished with this status; nothing changed
    AlreadyTerminal {
        /// Final status of the message
        status: MessageStatus,
    },
    /// Cancellation was signalled but the session had not stopped within the grace period
    Requested,
}

/// Everything needed to start a session
pub struct SessionSpec {
    /// Assistant message to generate
    pub message_id: MessageId,
    /// Conversation the message belongs to
    pub conversation_id: ConversationId,
    /// Provider serving the request
    pub provider: ProviderKind,
    /// Provider model
    pub model: String,
    /// Adapter bound to the caller's credential
    pub adapter: Arc<dyn ProviderAdapter>,
    /// Request without continuation; the session adds its own seed
    pub request: GenerationRequest,
    /// Last checkpoint when resuming an interrupted message
    pub resume_from: Option<Checkpoint>,
}

/// A live (or recently finished) generation
#[derive(Debug)]
pub struct StreamSession {
    message_id: MessageId,
    conversation_id: ConversationId,
    provider: ProviderKind,
    model: String,
    channel: Arc<DeliveryChannel>,
    cancel: watch::Sender<bool>,
    status: watch::Sender<MessageStatus>,
}

impl StreamSession {
    /// Build a session and the driver that runs it
    pub(crate) fn create(
        spec: SessionSpec,
        store: Arc<dyn ConversationStore>,
        config: &StreamingConfig,
    ) -> (Arc<Self>, SessionDriver) {
        let (seed, base) = match &spec.resume_from {
            Some(checkpoint) => (checkpoint.content.as_str(), checkpoint.sequence + 1),
            None => ("", 1),
        };
        let channel = DeliveryChannel::new(spec.message_id, seed, base, config.subscriber_buffer);
        let (cancel, cancel_rx) = watch::channel(false);
        let (status, _) = watch::channel(MessageStatus::Pending);

        let session = Arc::new(Self {
            message_id: spec.message_id,
            conversation_id: spec.conversation_id,
            provider: spec.provider,
            model: spec.model,
            channel,
            cancel,
            status,
        });

        let driver = SessionDriver {
            session: Arc::clone(&session),
            adapter: spec.adapter,
            store,
            request: spec.request,
            stall_timeout: config.stall_timeout,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
            state: SessionState::new(),
            clock: CheckpointClock::new(CheckpointPolicy::from_config(config)),
            cancel: cancel_rx,
            attempts: 0,
            tokens: 0,
        };

        (session, driver)
    }

    /// Message being generated
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Conversation of the message
    #[must_use]
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Provider serving this session
    #[must_use]
    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    /// Provider model
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Event log and fan-out for this session
    #[must_use]
    pub fn channel(&self) -> &Arc<DeliveryChannel> {
        &self.channel
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> MessageStatus {
        *self.status.borrow()
    }

    /// Whether the session has not yet reached a terminal state
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.status().is_terminal()
    }

    /// Attach a subscriber; see [`DeliveryChannel::subscribe`]
    #[must_use]
    pub fn subscribe(&self, after: Option<u64>) -> Subscription {
        self.channel.subscribe(after)
    }

    /// Wait for the terminal status
    pub async fn wait_terminal(&self) -> MessageStatus {
        let mut rx = self.status.subscribe();
        let status = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        status.unwrap_or_else(|_| self.status())
    }

    /// Request cancellation and wait up to `grace` for the session to stop
    ///
    /// Idempotent. Aborting a finished session changes nothing.
    pub async fn abort(&self, grace: Duration) -> AbortOutcome {
        let current = self.status();
        if current.is_terminal() {
            return AbortOutcome::AlreadyTerminal { status: current };
        }

        self.cancel.send_replace(true);
        tracing::info!(message_id = %self.message_id, "Abort requested");

        let mut rx = self.status.subscribe();
        let stopped = timeout(grace, rx.wait_for(|s| s.is_terminal()))
            .await
            .map(|waited| waited.map(|s| *s));
        match stopped {
            Ok(Ok(MessageStatus::Aborted)) => AbortOutcome::Aborted,
            Ok(Ok(other)) => AbortOutcome::AlreadyTerminal { status: other },
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(
                    message_id = %self.message_id,
                    grace_ms = grace.as_millis(),
                    "Session did not stop within abort grace"
                );
                AbortOutcome::Requested
            }
        }
    }
}

/// How a session ended
#[derive(Debug)]
enum Terminal {
    Complete(FinishReason),
    Aborted,
    Failed {
        kind: String,
        message: String,
        /// False when the store itself failed; no further writes are attempted
        persist: bool,
    },
}

impl Terminal {
    fn provider(err: &ProviderError) -> Self {
        Self::Failed {
            kind: err.kind.to_string(),
            message: err.message.clone(),
            persist: true,
        }
    }

    fn stalled(window: Duration) -> Self {
        Self::Failed {
            kind: "stalled".into(),
            message: format!("provider produced no events for {}s", window.as_secs_f32()),
            persist: true,
        }
    }

    fn store(err: &StoreError) -> Self {
        let kind = match err {
            StoreError::Conflict { .. } => "conflict",
            _ => "store_error",
        };
        Self::Failed {
            kind: kind.into(),
            message: err.to_string(),
            persist: false,
        }
    }
}

enum Pumped {
    Finished(Terminal),
    Interrupted(ProviderError),
}

/// Resolves once cancellation is signalled
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Task body of a [`StreamSession`]
pub(crate) struct SessionDriver {
    session: Arc<StreamSession>,
    adapter: Arc<dyn ProviderAdapter>,
    store: Arc<dyn ConversationStore>,
    request: GenerationRequest,
    stall_timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    state: SessionState,
    clock: CheckpointClock,
    cancel: watch::Receiver<bool>,
    attempts: u32,
    tokens: u64,
}

impl SessionDriver {
    /// Run to completion; returns the terminal status
    pub(crate) async fn run(mut self) -> MessageStatus {
        let terminal = self.drive().await;
        let status = self.finish(terminal).await;
        self.session.status.send_replace(status);
        status
    }

    fn channel(&self) -> &DeliveryChannel {
        &self.session.channel
    }

    async fn drive(&mut self) -> Terminal {
        let sequence = self.channel().next_sequence();
        let seed = self.channel().content();
        if let Err(t) = self.persist(sequence, &seed, MessageStatus::Pending).await {
            return t;
        }
        self.channel().publish_start();
        self.clock.reset();
        tracing::info!(
            provider = %self.session.provider,
            model = %self.session.model,
            resumed = !seed.is_empty(),
            "Stream started"
        );

        loop {
            let request = self
                .request
                .clone()
                .with_continuation(self.channel().content());

            let opened = tokio::select! {
                biased;
                () = cancelled(&mut self.cancel) => return Terminal::Aborted,
                opened = timeout(self.stall_timeout, self.adapter.open(request)) => opened,
            };

            let outcome = match opened {
                Err(_) => return Terminal::stalled(self.stall_timeout),
                Ok(Err(err)) => Pumped::Interrupted(err),
                Ok(Ok(rx)) => self.pump(rx).await,
            };

            match outcome {
                Pumped::Finished(t) => return t,
                Pumped::Interrupted(err) => {
                    if let Some(t) = self.retry_or_fail(err).await {
                        return t;
                    }
                }
            }
        }
    }

    /// Forward provider events until the stream ends or is interrupted
    ///
    /// Returning drops `rx`, which cancels the provider request.
    ///
    /// Only text counts as progress: empty tokens do not push the stall
    /// deadline back.
    async fn pump(&mut self, mut rx: mpsc::Receiver<NormalizedEvent>) -> Pumped {
        let mut deadline = Instant::now() + self.stall_timeout;
        loop {
            let next = tokio::select! {
                biased;
                () = cancelled(&mut self.cancel) => return Pumped::Finished(Terminal::Aborted),
                next = timeout_at(deadline, rx.recv()) => next,
            };

            match next {
                Err(_) => return Pumped::Finished(Terminal::stalled(self.stall_timeout)),
                Ok(None) => return Pumped::Interrupted(ProviderError::disconnected()),
                Ok(Some(NormalizedEvent::Token(text))) => {
                    if text.is_empty() {
                        continue;
                    }
                    deadline = Instant::now() + self.stall_timeout;
                    if let Err(t) = self.on_token(&text).await {
                        return Pumped::Finished(t);
                    }
                }
                Ok(Some(NormalizedEvent::Done(reason))) => {
                    return Pumped::Finished(Terminal::Complete(reason))
                }
                Ok(Some(NormalizedEvent::Error(err))) => return Pumped::Interrupted(err),
            }
        }
    }

    async fn on_token(&mut self, text: &str) -> Result<(), Terminal> {
        if text.is_empty() {
            return Ok(());
        }
        self.tokens += 1;

        let due = if self.state.status() == MessageStatus::Pending {
            self.state.advance(MessageStatus::Streaming);
            self.session.status.send_replace(MessageStatus::Streaming);
            true
        } else {
            self.clock.tick()
        };

        if due {
            let sequence = self.channel().next_sequence();
            let content = self.channel().content() + text;
            self.persist(sequence, &content, MessageStatus::Streaming)
                .await?;
            self.clock.reset();
        }

        self.channel().publish_token(text);
        Ok(())
    }

    async fn retry_or_fail(&mut self, err: ProviderError) -> Option<Terminal> {
        if !err.retryable || self.attempts >= self.max_retries {
            tracing::warn!(error = %err, attempts = self.attempts, "Provider failed");
            return Some(Terminal::provider(&err));
        }

        self.attempts += 1;
        let delay = self.retry_backoff * 2u32.saturating_pow(self.attempts - 1);
        tracing::warn!(
            error = %err,
            attempt = self.attempts,
            delay_ms = delay.as_millis(),
            "Provider interrupted, reopening"
        );

        tokio::select! {
            biased;
            () = cancelled(&mut self.cancel) => Some(Terminal::Aborted),
            () = tokio::time::sleep(delay) => None,
        }
    }

    async fn persist(
        &self,
        sequence: u64,
        content: &str,
        status: MessageStatus,
    ) -> Result<(), Terminal> {
        self.store
            .append_checkpoint(self.session.message_id, content, sequence, status)
            .await
            .map_err(|err| {
                tracing::error!(sequence, status = %status, error = %err, "Checkpoint failed");
                Terminal::store(&err)
            })
    }

    async fn finish(&mut self, terminal: Terminal) -> MessageStatus {
        let sequence = self.channel().next_sequence();
        let content = self.channel().content();

        let terminal = match terminal {
            Terminal::Complete(reason) => {
                // An empty reply still passes through `streaming`.
                self.state.advance(MessageStatus::Streaming);
                match self
                    .persist(sequence, &content, MessageStatus::Complete)
                    .await
                {
                    Ok(()) => Terminal::Complete(reason),
                    Err(t) => t,
                }
            }
            Terminal::Aborted => match self
                .persist(sequence, &content, MessageStatus::Aborted)
                .await
            {
                Ok(()) => Terminal::Aborted,
                Err(t) => t,
            },
            Terminal::Failed {
                kind,
                message,
                persist,
            } => {
                if persist {
                    // Best effort: the error event is published either way.
                    let _ = self.persist(sequence, &content, MessageStatus::Error).await;
                }
                Terminal::Failed {
                    kind,
                    message,
                    persist,
                }
            }
        };

        let status = match terminal {
            Terminal::Complete(reason) => {
                self.channel().publish_complete(reason);
                tracing::info!(tokens = self.tokens, finish_reason = ?reason, "Stream complete");
                MessageStatus::Complete
            }
            Terminal::Aborted => {
                self.channel().publish_aborted();
                tracing::info!(tokens = self.tokens, "Stream aborted");
                MessageStatus::Aborted
            }
            Terminal::Failed { kind, message, .. } => {
                self.channel().publish_error(&kind, &message);
                tracing::warn!(tokens = self.tokens, kind = %kind, "Stream failed");
                MessageStatus::Error
            }
        };
        self.state.advance(status);
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ServerMessage;
    use crate::model::{Conversation, Message};
    use crate::provider::{ScriptStep, ScriptedAdapter};
    use crate::store::InMemoryStore;
    use pretty_assertions::assert_eq;

    async fn setup(
        adapter: Arc<ScriptedAdapter>,
        config: &StreamingConfig,
    ) -> (Arc<InMemoryStore>, Arc<StreamSession>, SessionDriver) {
        let store = Arc::new(InMemoryStore::new());
        let conv = Conversation::new("alice", None);
        store.insert_conversation(conv.clone()).await.unwrap();
        let user = Message::user(conv.id, None, "hi");
        store.insert_message(user.clone()).await.unwrap();
        let reply = Message::assistant_placeholder(conv.id, user.id, ProviderKind::OpenAi, "gpt-4");
        store.insert_message(reply.clone()).await.unwrap();

        let spec = SessionSpec {
            message_id: reply.id,
            conversation_id: conv.id,
            provider: ProviderKind::OpenAi,
            model: "gpt-4".into(),
            adapter,
            request: GenerationRequest::new("gpt-4", Vec::new()),
            resume_from: None,
        };
        let (session, driver) = StreamSession::create(spec, store.clone(), config);
        (store, session, driver)
    }

    async fn collect(mut sub: Subscription) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Some(event) = sub.recv().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_complete_run_checkpoints_and_publishes() {
        let adapter = Arc::new(
            ScriptedAdapter::new(ProviderKind::OpenAi)
                .with_script(crate::provider::scripted::tokens(&["Hel", "lo"])),
        );
        let config = StreamingConfig::default();
        let (store, session, driver) = setup(adapter, &config).await;
        let sub = session.subscribe(None);

        assert_eq!(driver.run().await, MessageStatus::Complete);
        let events = collect(sub).await;

        let seqs: Vec<_> = events.iter().filter_map(ServerMessage::sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert!(matches!(
            events.last(),
            Some(ServerMessage::StreamComplete { final_content, finish_reason: FinishReason::Stop, .. })
                if final_content == "Hello"
        ));

        let checkpoint = store.load_last_checkpoint(session.message_id()).await.unwrap().unwrap();
        assert_eq!(checkpoint.sequence, 4);
        assert_eq!(checkpoint.content, "Hello");
        assert_eq!(checkpoint.status, MessageStatus::Complete);
        assert_eq!(session.status(), MessageStatus::Complete);
    }

    #[tokio::test]
    async fn test_retryable_error_reopens_with_continuation() {
        let adapter = Arc::new(
            ScriptedAdapter::new(ProviderKind::OpenAi)
                .with_script(vec![
                    ScriptStep::Token("Hel".into()),
                    ScriptStep::Disconnect,
                ])
                .with_script(crate::provider::scripted::tokens(&["lo"])),
        );
        let config = StreamingConfig {
            retry_backoff: Duration::from_millis(1),
            ..StreamingConfig::default()
        };
        let (_store, session, driver) = setup(adapter.clone(), &config).await;

        assert_eq!(driver.run().await, MessageStatus::Complete);
        assert_eq!(session.channel().content(), "Hello");

        let requests = adapter.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].continuation, None);
        assert_eq!(requests[1].continuation.as_deref(), Some("Hel"));
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_with_partial() {
        let adapter = Arc::new(ScriptedAdapter::new(ProviderKind::OpenAi).with_script(vec![
            ScriptStep::Token("par".into()),
            ScriptStep::Error(ProviderError::from_status(401, "bad key")),
        ]));
        let config = StreamingConfig::default();
        let (store, session, driver) = setup(adapter, &config).await;
        let sub = session.subscribe(None);

        assert_eq!(driver.run().await, MessageStatus::Error);
        let events = collect(sub).await;
        assert!(matches!(
            events.last(),
            Some(ServerMessage::StreamError { kind, partial_content, .. })
                if kind == "auth" && partial_content == "par"
        ));
        let row = store.get_message(session.message_id()).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Error);
        assert_eq!(row.text(), "par");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_fails_session() {
        let adapter = Arc::new(ScriptedAdapter::new(ProviderKind::OpenAi).with_script(vec![
            ScriptStep::Token("a".into()),
            ScriptStep::Hang,
        ]));
        let config = StreamingConfig {
            stall_timeout: Duration::from_secs(2),
            ..StreamingConfig::default()
        };
        let (_store, session, driver) = setup(adapter.clone(), &config).await;
        let sub = session.subscribe(None);

        assert_eq!(driver.run().await, MessageStatus::Error);
        let events = collect(sub).await;
        assert!(matches!(
            events.last(),
            Some(ServerMessage::StreamError { kind, .. }) if kind == "stalled"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_tokens_do_not_hold_off_stall() {
        let mut script = vec![ScriptStep::Token("a".into())];
        for _ in 0..5 {
            script.push(ScriptStep::Pause(Duration::from_secs(1)));
            script.push(ScriptStep::Token(String::new()));
        }
        script.push(ScriptStep::Token("b".into()));
        script.push(ScriptStep::Done(FinishReason::Stop));
        let adapter = Arc::new(ScriptedAdapter::new(ProviderKind::OpenAi).with_script(script));
        let config = StreamingConfig {
            stall_timeout: Duration::from_secs(2),
            ..StreamingConfig::default()
        };
        let (_store, session, driver) = setup(adapter, &config).await;
        let sub = session.subscribe(None);

        assert_eq!(driver.run().await, MessageStatus::Error);
        let events = collect(sub).await;
        assert!(matches!(
            events.last(),
            Some(ServerMessage::StreamError { kind, partial_content, .. })
                if kind == "stalled" && partial_content == "a"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_reports_requested_when_grace_expires() {
        let adapter = Arc::new(
            ScriptedAdapter::new(ProviderKind::OpenAi).with_script(vec![ScriptStep::Hang]),
        );
        let config = StreamingConfig::default();
        let (_store, session, driver) = setup(adapter, &config).await;

        // The driver is not running yet, so nothing can observe the cancel.
        let outcome = session.abort(Duration::from_millis(50)).await;
        assert_eq!(outcome, AbortOutcome::Requested);
        assert!(!session.status().is_terminal());

        // The cancel flag stays set; the driver honours it once it runs.
        assert_eq!(driver.run().await, MessageStatus::Aborted);
        assert_eq!(session.status(), MessageStatus::Aborted);
    }

    #[tokio::test]
    async fn test_abort_before_any_token() {
        let adapter = Arc::new(
            ScriptedAdapter::new(ProviderKind::OpenAi).with_script(vec![ScriptStep::Hang]),
        );
        let config = StreamingConfig::default();
        let (store, session, driver) = setup(adapter.clone(), &config).await;
        let task = tokio::spawn(driver.run());

        let outcome = session.abort(Duration::from_secs(5)).await;
        assert_eq!(outcome, AbortOutcome::Aborted);
        assert_eq!(task.await.unwrap(), MessageStatus::Aborted);

        let again = session.abort(Duration::from_secs(5)).await;
        assert_eq!(
            again,
            AbortOutcome::AlreadyTerminal {
                status: MessageStatus::Aborted
            }
        );
        let row = store.get_message(session.message_id()).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Aborted);
    }

    #[tokio::test]
    async fn test_abort_outcome_wire_format() {
        let json = serde_json::to_value(AbortOutcome::AlreadyTerminal {
            status: MessageStatus::Complete,
        })
        .unwrap();
        assert_eq!(json["result"], "already_terminal");
        assert_eq!(json["status"], "complete");
    }
}
