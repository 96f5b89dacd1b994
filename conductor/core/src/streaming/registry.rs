//! Session Registry
//!
//! Maps message ids to live sessions. At most one live session exists per
//! message; concurrent starts for the same id are serialized on the map entry.
//!
//! A finished session stays registered so reconnecting clients can replay it,
//! until its last subscriber detaches or `registry_grace` elapses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tracing::Instrument;

use super::session::{AbortOutcome, SessionSpec, StreamSession};
use crate::config::StreamingConfig;
use crate::error::EngineError;
use crate::model::MessageId;
use crate::store::ConversationStore;

/// Result of [`SessionRegistry::start_or_attach`]
#[derive(Debug)]
pub enum Started {
    /// A new session was spawned
    New(Arc<StreamSession>),
    /// A live session already existed and was returned instead
    Attached(Arc<StreamSession>),
}

impl Started {
    /// The session, new or existing
    #[must_use]
    pub fn session(&self) -> &Arc<StreamSession> {
        match self {
            Self::New(s) | Self::Attached(s) => s,
        }
    }

    /// Whether a new session was spawned
    #[must_use]
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New(_))
    }
}

struct RegistryInner {
    sessions: DashMap<MessageId, Arc<StreamSession>>,
    store: Arc<dyn ConversationStore>,
    config: StreamingConfig,
    shutting_down: AtomicBool,
}

/// Owner of every stream session in the process
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Create a registry whose sessions checkpoint into `store`
    pub fn new(store: Arc<dyn ConversationStore>, config: StreamingConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                store,
                config,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Streaming configuration sessions run with
    #[must_use]
    pub fn config(&self) -> &StreamingConfig {
        &self.inner.config
    }

    /// Registered session for a message, live or retained
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<Arc<StreamSession>> {
        self.inner.sessions.get(&id).map(|s| Arc::clone(s.value()))
    }

    /// Number of registered sessions that are still live
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner
            .sessions
            .iter()
            .filter(|s| s.value().is_live())
            .count()
    }

    /// Number of registered sessions, live or retained
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Whether [`Self::shutdown`] has been called
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Start a session, failing if one is already live for the message
    ///
    /// A retained, finished session for the same message is replaced.
    ///
    /// # Errors
    ///
    /// [`EngineError::AlreadyActive`] if a live session exists,
    /// [`EngineError::ShuttingDown`] after shutdown.
    pub fn try_start(&self, spec: SessionSpec) -> Result<Arc<StreamSession>, EngineError> {
        match self.start_or_attach(spec)? {
            Started::New(session) => Ok(session),
            Started::Attached(session) => Err(EngineError::AlreadyActive(session.message_id())),
        }
    }

    /// Start a session, or return the live one if it already exists
    ///
    /// # Errors
    ///
    /// [`EngineError::ShuttingDown`] after shutdown.
    pub fn start_or_attach(&self, spec: SessionSpec) -> Result<Started, EngineError> {
        if self.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }

        let id = spec.message_id;
        match self.inner.sessions.entry(id) {
            Entry::Occupied(entry) if entry.get().is_live() => {
                tracing::debug!(message_id = %id, "Session already live, attaching");
                Ok(Started::Attached(Arc::clone(entry.get())))
            }
            Entry::Occupied(mut entry) => {
                let session = self.launch(spec);
                entry.insert(Arc::clone(&session));
                Ok(Started::New(session))
            }
            Entry::Vacant(entry) => {
                let session = self.launch(spec);
                entry.insert(Arc::clone(&session));
                Ok(Started::New(session))
            }
        }
    }

    fn launch(&self, spec: SessionSpec) -> Arc<StreamSession> {
        let (session, driver) =
            StreamSession::create(spec, Arc::clone(&self.inner.store), &self.inner.config);

        let span = tracing::info_span!(
            "stream",
            message_id = %session.message_id(),
            conversation_id = %session.conversation_id(),
        );
        let inner = Arc::clone(&self.inner);
        let retained = Arc::clone(&session);
        tokio::spawn(
            async move {
                driver.run().await;
                retire(&inner, &retained).await;
            }
            .instrument(span),
        );

        session
    }

    /// Abort every live session and refuse new ones
    ///
    /// Returns the outcome for each session that was registered.
    pub async fn shutdown(&self) -> Vec<(MessageId, AbortOutcome)> {
        self.inner.shutting_down.store(true, Ordering::Release);

        let sessions: Vec<Arc<StreamSession>> = self
            .inner
            .sessions
            .iter()
            .map(|s| Arc::clone(s.value()))
            .collect();
        let grace = self.inner.config.abort_grace;

        let outcomes = join_all(sessions.iter().map(|s| async move {
            (s.message_id(), s.abort(grace).await)
        }))
        .await;

        tracing::info!(sessions = outcomes.len(), "Session registry shut down");
        outcomes
    }
}

/// Drop a finished session once nobody is watching it
async fn retire(inner: &RegistryInner, session: &Arc<StreamSession>) {
    let idle = session
        .channel()
        .wait_idle(inner.config.registry_grace)
        .await;
    let removed = inner
        .sessions
        .remove_if(&session.message_id(), |_, s| Arc::ptr_eq(s, session))
        .is_some();
    tracing::debug!(idle, removed, "Session retired");
}
