//! Conductor - The Orchestration Core
//!
//! The Conductor turns client requests into conversation-tree mutations and
//! stream sessions. It is transport-agnostic: the daemon feeds it
//! [`ClientEvent`]s along with the authenticated user, and forwards the
//! resulting [`ServerMessage`]s and [`Subscription`]s.
//!
//! # Request Flow
//!
//! ```text
//! submit ──▶ owner check ──▶ credential ──▶ user message ──▶ placeholder
//!                                                              │
//!                        Subscription ◀── registry.start ◀─────┘
//! ```
//!
//! Credentials are resolved per request and handed straight to the provider
//! adapter. They are never stored or logged.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::conversation::ConversationTree;
use crate::credentials::{CredentialProvider, EnvCredentials, ProviderCredential};
use crate::error::EngineError;
use crate::events::ClientEvent;
use crate::messages::ServerMessage;
use crate::model::{Checkpoint, Conversation, ConversationId, Message, MessageId, MessageStatus, Role};
use crate::provider::{
    FinishReason, GenerationRequest, HttpProviderFactory, ProviderFactory, ProviderInfo,
    ProviderKind,
};
use crate::store::{ConversationStore, InMemoryStore};
use crate::streaming::{AbortOutcome, SessionRegistry, SessionSpec, Subscription};

/// Result of a successful submit
#[derive(Debug)]
pub struct Submission {
    /// The stored user message
    pub user_message: Message,
    /// The `pending` assistant placeholder being generated
    pub assistant_message: Message,
    /// Events for the assistant message, from `stream_start`
    pub subscription: Subscription,
}

/// What the transport should do with a handled event
#[derive(Debug)]
pub enum Dispatch {
    /// Send one message
    Reply(ServerMessage),
    /// Send `preface`, then forward every event from `subscription`
    Stream {
        /// Messages to send before the stream
        preface: Vec<ServerMessage>,
        /// The stream to forward
        subscription: Subscription,
    },
    /// Acknowledge delivery on the matching subscription
    Ack {
        /// Message whose stream is acknowledged
        message_id: MessageId,
        /// Highest sequence received
        sequence: u64,
    },
}

/// The Conductor - headless streaming orchestration
#[derive(Clone)]
pub struct Conductor {
    tree: ConversationTree,
    registry: SessionRegistry,
    credentials: Arc<dyn CredentialProvider>,
    providers: Arc<dyn ProviderFactory>,
    config: EngineConfig,
}

impl Conductor {
    /// Create a conductor from its collaborators
    pub fn new(
        store: Arc<dyn ConversationStore>,
        credentials: Arc<dyn CredentialProvider>,
        providers: Arc<dyn ProviderFactory>,
        config: EngineConfig,
    ) -> Self {
        let registry = SessionRegistry::new(Arc::clone(&store), config.streaming.clone());
        Self {
            tree: ConversationTree::new(store),
            registry,
            credentials,
            providers,
            config,
        }
    }

    /// Create a conductor with an in-memory store, environment credentials,
    /// and HTTP providers
    #[must_use]
    pub fn from_config(config: EngineConfig) -> Self {
        let providers = HttpProviderFactory::new(config.providers.clone());
        Self::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(EnvCredentials::from_env()),
            Arc::new(providers),
            config,
        )
    }

    /// The conversation tree
    #[must_use]
    pub fn tree(&self) -> &ConversationTree {
        &self.tree
    }

    /// The session registry
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a new conversation owned by `owner`
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn create_conversation(
        &self,
        owner: &str,
        title: Option<String>,
    ) -> Result<Conversation, EngineError> {
        self.tree.create_conversation(owner, title).await
    }

    /// Post a user message and start generating the assistant reply
    ///
    /// Nothing is written if the conversation, parent, provider, or
    /// credential is invalid.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownProvider`], [`EngineError::NotOwner`],
    /// [`EngineError::MissingCredential`], [`EngineError::InvalidParent`], or
    /// [`EngineError::ShuttingDown`].
    pub async fn submit(
        &self,
        owner: &str,
        conversation_id: ConversationId,
        parent: Option<MessageId>,
        content: &str,
        provider: &str,
        model: &str,
    ) -> Result<Submission, EngineError> {
        if self.registry.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }
        let kind: ProviderKind = provider.parse()?;
        self.tree.owned_conversation(owner, conversation_id).await?;
        let credential = self.credential(owner, kind).await?;

        let user_message = self
            .tree
            .create_message(conversation_id, parent, Role::User, content)
            .await?;
        let assistant_message = self
            .tree
            .create_assistant_placeholder(conversation_id, user_message.id, kind, model)
            .await?;
        let turns = self.tree.context_for(user_message.id).await?;

        let spec = self.session_spec(&assistant_message, kind, model, credential, turns, None);
        let started = self.registry.start_or_attach(spec)?;
        let subscription = started.session().subscribe(None);

        tracing::info!(
            conversation_id = %conversation_id,
            message_id = %assistant_message.id,
            provider = %kind,
            model,
            "Submitted"
        );

        Ok(Submission {
            user_message,
            assistant_message,
            subscription,
        })
    }

    /// Cancel generation of an assistant message
    ///
    /// Idempotent. A message left `pending` or `streaming` with no live
    /// session (an interrupted process) is marked `aborted` directly.
    ///
    /// # Errors
    ///
    /// [`EngineError::MessageNotFound`] or [`EngineError::NotOwner`].
    pub async fn abort(&self, owner: &str, id: MessageId) -> Result<AbortOutcome, EngineError> {
        let message = self.owned_message(owner, id).await?;

        if let Some(session) = self.registry.get(id) {
            return Ok(session.abort(self.config.streaming.abort_grace).await);
        }

        let last = self.tree.store().load_last_checkpoint(id).await?;
        let status = last.as_ref().map_or(message.status, |c| c.status);
        if status.is_terminal() {
            return Ok(AbortOutcome::AlreadyTerminal { status });
        }

        let sequence = last.as_ref().map_or(1, |c| c.sequence + 1);
        self.tree
            .store()
            .append_checkpoint(id, &message.text(), sequence, MessageStatus::Aborted)
            .await?;
        tracing::info!(message_id = %id, "Orphaned message marked aborted");
        Ok(AbortOutcome::Aborted)
    }

    /// Re-attach to an assistant message, resuming generation if needed
    ///
    /// A live or recently finished session is attached to and replayed after
    /// `after`. Otherwise a `pending`, `streaming`, or `error` message is
    /// resumed from its last checkpoint in a new session.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotResumable`] for finished or non-assistant messages,
    /// [`EngineError::MissingCredential`], or [`EngineError::ShuttingDown`].
    pub async fn continue_stream(
        &self,
        owner: &str,
        id: MessageId,
        after: Option<u64>,
    ) -> Result<Subscription, EngineError> {
        let message = self.owned_message(owner, id).await?;
        if message.deleted {
            return Err(EngineError::NotResumable {
                id,
                status: message.status,
            });
        }

        if let Some(session) = self.registry.get(id) {
            if session.status() != MessageStatus::Error {
                return Ok(session.subscribe(after));
            }
        }

        // Read after the registry miss: a session retired since `message`
        // was loaded has already written its final checkpoint.
        let checkpoint = self.tree.store().load_last_checkpoint(id).await?;
        let status = checkpoint.as_ref().map_or(message.status, |c| c.status);
        let not_resumable = || EngineError::NotResumable { id, status };
        if message.role != Role::Assistant || !status.is_resumable() {
            return Err(not_resumable());
        }
        let provider = message.provider.ok_or_else(not_resumable)?;
        let parent = message.parent_id.ok_or_else(not_resumable)?;
        let model = message.model.clone().unwrap_or_default();

        let credential = self.credential(owner, provider).await?;
        let turns = self.tree.context_for(parent).await?;

        tracing::info!(
            message_id = %id,
            from_sequence = checkpoint.as_ref().map_or(0, |c| c.sequence),
            "Resuming"
        );

        let spec = self.session_spec(&message, provider, &model, credential, turns, checkpoint);
        let started = self.registry.start_or_attach(spec)?;
        Ok(started.session().subscribe(after))
    }

    /// Events after `after` without attaching
    ///
    /// Answered from the live session when there is one, otherwise from the
    /// persisted message.
    ///
    /// # Errors
    ///
    /// [`EngineError::MessageNotFound`] or [`EngineError::NotOwner`].
    pub async fn poll(
        &self,
        owner: &str,
        id: MessageId,
        after: u64,
        max_events: Option<usize>,
    ) -> Result<ServerMessage, EngineError> {
        let message = self.owned_message(owner, id).await?;
        let limit = self.config.streaming.poll_max_events;
        let max = max_events.unwrap_or(limit).clamp(1, limit);

        if let Some(session) = self.registry.get(id) {
            let batch = session.channel().poll(after, max);
            return Ok(ServerMessage::PollResult {
                message_id: id,
                events: batch.events,
                next_sequence: batch.next_sequence,
                finished: batch.finished,
            });
        }

        let checkpoint = self.tree.store().load_last_checkpoint(id).await?;
        Ok(persisted_poll(&message, checkpoint, after))
    }

    /// Create an edited sibling of a user message
    ///
    /// # Errors
    ///
    /// [`EngineError::NotEditable`] for non-user messages.
    pub async fn edit(&self, owner: &str, id: MessageId, content: &str) -> Result<Message, EngineError> {
        self.owned_message(owner, id).await?;
        self.tree.edit_message(id, content).await
    }

    /// Soft-delete a message
    ///
    /// The message keeps its place in the tree but is left out of provider
    /// context from then on.
    ///
    /// # Errors
    ///
    /// [`EngineError::AlreadyActive`] while the message is being generated,
    /// [`EngineError::MessageNotFound`] or [`EngineError::NotOwner`].
    pub async fn delete(&self, owner: &str, id: MessageId) -> Result<Message, EngineError> {
        self.owned_message(owner, id).await?;
        if self.registry.get(id).is_some_and(|s| s.is_live()) {
            return Err(EngineError::AlreadyActive(id));
        }
        self.tree.delete_message(id).await
    }

    /// Every supported provider, flagged by whether `owner` can use it
    pub async fn list_providers(&self, owner: &str) -> Vec<ProviderInfo> {
        let mut providers = Vec::with_capacity(ProviderKind::ALL.len());
        for kind in ProviderKind::ALL {
            let configured = self.credentials.credential(owner, kind).await.is_some();
            providers.push(ProviderInfo::new(kind, configured));
        }
        providers
    }

    /// Messages from the root down to `leaf`
    ///
    /// # Errors
    ///
    /// [`EngineError::MessageNotFound`] or [`EngineError::NotOwner`].
    pub async fn resolve_branch(&self, owner: &str, leaf: MessageId) -> Result<Vec<Message>, EngineError> {
        self.owned_message(owner, leaf).await?;
        self.tree.resolve_branch(leaf).await
    }

    /// Handle one client event for `owner`
    ///
    /// Never fails: errors become `error` replies.
    pub async fn handle_event(&self, owner: &str, event: ClientEvent) -> Dispatch {
        tracing::debug!(event = event.name(), "Handling client event");
        match event {
            ClientEvent::Submit {
                conversation_id,
                parent_message_id,
                content,
                provider,
                model,
            } => match self
                .submit(owner, conversation_id, parent_message_id, &content, &provider, &model)
                .await
            {
                Ok(submission) => Dispatch::Stream {
                    preface: vec![
                        ServerMessage::MessageCreated {
                            message: submission.user_message,
                        },
                        ServerMessage::MessageCreated {
                            message: submission.assistant_message,
                        },
                    ],
                    subscription: submission.subscription,
                },
                Err(e) => reply_error(&e, None),
            },

            ClientEvent::Abort { message_id } => match self.abort(owner, message_id).await {
                Ok(outcome) => Dispatch::Reply(ServerMessage::AbortResult {
                    message_id,
                    outcome,
                }),
                Err(e) => reply_error(&e, Some(message_id)),
            },

            ClientEvent::Continue {
                message_id,
                after_sequence,
            } => match self.continue_stream(owner, message_id, after_sequence).await {
                Ok(subscription) => Dispatch::Stream {
                    preface: Vec::new(),
                    subscription,
                },
                Err(e) => reply_error(&e, Some(message_id)),
            },

            ClientEvent::Poll {
                message_id,
                after_sequence,
                max_events,
            } => match self.poll(owner, message_id, after_sequence, max_events).await {
                Ok(result) => Dispatch::Reply(result),
                Err(e) => reply_error(&e, Some(message_id)),
            },

            ClientEvent::Ack {
                message_id,
                sequence,
            } => Dispatch::Ack {
                message_id,
                sequence,
            },

            ClientEvent::CreateConversation { title } => {
                match self.create_conversation(owner, title).await {
                    Ok(conversation) => {
                        Dispatch::Reply(ServerMessage::ConversationCreated { conversation })
                    }
                    Err(e) => reply_error(&e, None),
                }
            }

            ClientEvent::Edit {
                message_id,
                content,
            } => match self.edit(owner, message_id, &content).await {
                Ok(message) => Dispatch::Reply(ServerMessage::MessageCreated { message }),
                Err(e) => reply_error(&e, Some(message_id)),
            },

            ClientEvent::ResolveBranch { leaf_id } => match self.resolve_branch(owner, leaf_id).await
            {
                Ok(messages) => Dispatch::Reply(ServerMessage::Branch {
                    conversation_id: messages
                        .first()
                        .map(|m| m.conversation_id)
                        .unwrap_or_default(),
                    leaf_id,
                    messages,
                }),
                Err(e) => reply_error(&e, Some(leaf_id)),
            },

            ClientEvent::Delete { message_id } => match self.delete(owner, message_id).await {
                Ok(message) => Dispatch::Reply(ServerMessage::MessageDeleted { message }),
                Err(e) => reply_error(&e, Some(message_id)),
            },

            ClientEvent::ListProviders => Dispatch::Reply(ServerMessage::Providers {
                providers: self.list_providers(owner).await,
            }),
        }
    }

    /// Abort every live session and refuse new work
    pub async fn shutdown(&self) {
        let outcomes = self.registry.shutdown().await;
        tracing::info!(aborted = outcomes.len(), "Conductor shut down");
    }

    async fn owned_message(&self, owner: &str, id: MessageId) -> Result<Message, EngineError> {
        let message = self.tree.message(id).await?;
        self.tree
            .owned_conversation(owner, message.conversation_id)
            .await?;
        Ok(message)
    }

    async fn credential(
        &self,
        owner: &str,
        provider: ProviderKind,
    ) -> Result<ProviderCredential, EngineError> {
        self.credentials
            .credential(owner, provider)
            .await
            .ok_or(EngineError::MissingCredential(provider))
    }

    fn session_spec(
        &self,
        message: &Message,
        provider: ProviderKind,
        model: &str,
        credential: ProviderCredential,
        turns: Vec<crate::provider::ChatTurn>,
        resume_from: Option<Checkpoint>,
    ) -> SessionSpec {
        let request = GenerationRequest::new(model, turns)
            .with_max_tokens(self.config.generation.max_tokens)
            .with_temperature(self.config.generation.temperature);
        SessionSpec {
            message_id: message.id,
            conversation_id: message.conversation_id,
            provider,
            model: model.to_string(),
            adapter: self.providers.adapter(provider, credential),
            request,
            resume_from,
        }
    }
}

fn reply_error(err: &EngineError, message_id: Option<MessageId>) -> Dispatch {
    tracing::debug!(code = err.code(), error = %err, "Request failed");
    Dispatch::Reply(ServerMessage::error(err, message_id))
}

/// Poll answer for a message with no registered session
///
/// Only the final state survives in the store, so a finished message yields
/// a single terminal event at its last checkpoint sequence.
fn persisted_poll(message: &Message, checkpoint: Option<Checkpoint>, after: u64) -> ServerMessage {
    let message_id = message.id;
    let Some(checkpoint) = checkpoint else {
        return ServerMessage::PollResult {
            message_id,
            events: Vec::new(),
            next_sequence: after,
            finished: message.status.is_terminal(),
        };
    };

    let finished = checkpoint.status.is_terminal();
    if !finished || after >= checkpoint.sequence {
        return ServerMessage::PollResult {
            message_id,
            events: Vec::new(),
            next_sequence: after,
            finished,
        };
    }

    let sequence = checkpoint.sequence;
    let content = if message.deleted {
        message.text()
    } else {
        checkpoint.content
    };
    let event = match checkpoint.status {
        MessageStatus::Aborted => ServerMessage::StreamAborted {
            message_id,
            sequence,
            partial_content: content,
        },
        MessageStatus::Error => ServerMessage::StreamError {
            message_id,
            sequence,
            kind: "interrupted".into(),
            message: "generation ended with an error; continue to resume".into(),
            partial_content: content,
        },
        _ => ServerMessage::StreamComplete {
            message_id,
            sequence,
            final_content: content,
            finish_reason: FinishReason::Stop,
        },
    };

    ServerMessage::PollResult {
        message_id,
        events: vec![event],
        next_sequence: sequence,
        finished: true,
    }
}
