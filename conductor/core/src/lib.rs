//! Teehee Core - Streaming Orchestration for Branching LLM Conversations
//!
//! This crate drives token streams from hosted LLM providers into durable,
//! branching conversation trees, and fans each stream out to any number of
//! clients that may disconnect, reconnect, or poll.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Clients                                 │
//! │     WebSocket (teehee-daemon)   │   in-process / poll            │
//! │                  ClientEvent (up) │ ServerMessage (down)          │
//! └───────────────────────────────────┼──────────────────────────────┘
//!                                     │
//! ┌───────────────────────────────────┼──────────────────────────────┐
//! │                         CONDUCTOR CORE                            │
//! │  ┌────────────────────────────────┴───────────────────────────┐  │
//! │  │                        Conductor                            │  │
//! │  │  ┌──────────────┐  ┌───────────────┐  ┌─────────────────┐  │  │
//! │  │  │ Conversation │  │    Session    │  │    Provider     │  │  │
//! │  │  │     Tree     │  │   Registry    │  │    Adapters     │  │  │
//! │  │  └──────┬───────┘  └───────┬───────┘  └─────────────────┘  │  │
//! │  └─────────┼──────────────────┼───────────────────────────────┘  │
//! │            └──── ConversationStore (checkpoints) ────┘           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Conductor`]: Entry point; handles [`ClientEvent`]s for a user
//! - [`ConversationTree`]: Append-only message forest with branching
//! - [`SessionRegistry`]: At most one live [`StreamSession`] per message
//! - [`Subscription`]: Ordered, replayable view of one message's events
//! - [`ProviderAdapter`]: Normalized token stream from one provider
//! - [`ConversationStore`]: Persistence contract the host implements
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use teehee_core::{Conductor, EngineConfig, InMemoryStore, EnvCredentials, HttpProviderFactory};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig::default();
//!     let conductor = Conductor::new(
//!         Arc::new(InMemoryStore::new()),
//!         Arc::new(EnvCredentials::from_env()),
//!         Arc::new(HttpProviderFactory::new(config.providers.clone())),
//!         config,
//!     );
//!
//!     let conv = conductor.create_conversation("alice", None).await.unwrap();
//!     let mut submission = conductor
//!         .submit("alice", conv.id, None, "Hello!", "openai", "gpt-3.5-turbo")
//!         .await
//!         .unwrap();
//!
//!     while let Some(event) = submission.subscription.recv().await {
//!         println!("{}", serde_json::to_string(&event).unwrap());
//!     }
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`conductor`]: The Conductor and client event dispatch
//! - [`config`]: TOML and environment configuration
//! - [`conversation`]: Conversation tree operations
//! - [`credentials`]: Per-user provider credentials
//! - [`error`]: Engine error type and stable codes
//! - [`events`]: Events from clients to the Conductor
//! - [`messages`]: Messages from the Conductor to clients
//! - [`model`]: Identifiers, messages, conversations, checkpoints
//! - [`provider`]: Provider adapters (`OpenAI`, Anthropic, Mistral)
//! - [`store`]: Persistence contract and in-memory store
//! - [`streaming`]: Sessions, registry, delivery, checkpoints

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod conductor;
pub mod config;
pub mod conversation;
pub mod credentials;
pub mod error;
pub mod events;
pub mod messages;
pub mod model;
pub mod provider;
pub mod store;
pub mod streaming;

// Re-exports for convenience
pub use conductor::{Conductor, Dispatch, Submission};
pub use conversation::ConversationTree;
pub use credentials::{CredentialProvider, EnvCredentials, ProviderCredential, StaticCredentials};
pub use error::EngineError;
pub use events::ClientEvent;
pub use messages::ServerMessage;
pub use model::{
    Checkpoint, ContentFragment, Conversation, ConversationId, Message, MessageId, MessageStatus,
    Role, DELETED_MARKER,
};

// Provider exports
pub use provider::{
    AnthropicAdapter, ChatTurn, FinishReason, GenerationRequest, HttpProviderFactory,
    MistralAdapter, ModelInfo, NormalizedEvent, OpenAiAdapter, ProviderAdapter, ProviderEndpoints,
    ProviderError, ProviderErrorKind, ProviderFactory, ProviderInfo, ProviderKind,
};

// Store exports
pub use store::{ConversationStore, InMemoryStore, StoreError};

// Streaming exports
pub use streaming::{
    AbortOutcome, AckHandle, CheckpointPolicy, DeliveryChannel, PollBatch, SessionRegistry,
    SessionSpec, Started, StreamSession, Subscription,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConductorToml, ConfigError,
    ConfigSource, EngineConfig, GenerationConfig, ServerSettings, StreamingConfig,
};
