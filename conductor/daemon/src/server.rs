//! Daemon Server Implementation
//!
//! This module provides the core server loop for the teehee daemon:
//! - Accepts WebSocket connections on a TCP listener
//! - Spawns a handler task per connection
//! - Tracks active connections and enforces a connection limit
//! - Supports graceful shutdown
//!
//! # Connection Model
//!
//! ```text
//!                     DaemonServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!       client A        client A        client B
//!       (conn-1)        (conn-2)        (conn-3)
//!          │               │               │
//!          └───────────────┴───────────────┘
//!                          │
//!                      Conductor
//!              (shared sessions per message)
//! ```
//!
//! Each client frame is one JSON [`ClientEvent`]; each server frame is one
//! JSON [`ServerMessage`]. The user is taken from the `user` query parameter
//! of the upgrade request, which an authenticating proxy in front of the
//! daemon is expected to set.
//!
//! Disconnecting only detaches the connection's subscriptions. Generation
//! continues, requests already received still complete, and the client can
//! `continue` from another connection.
//!
//! Stream events are acknowledged by the client with `ack`; a subscription
//! that falls behind re-sends from the last acknowledged sequence.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as Frame;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use teehee_core::{
    AckHandle, ClientEvent, Conductor, Dispatch, MessageId, ServerMessage, ServerSettings,
    Subscription,
};

/// Unique identifier for a client connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a new random connection ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state tracking
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Remote peer address
    peer: String,
    /// Authenticated user, once the handshake completed
    owner: Option<String>,
}

/// Statistics for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// When the connection was established
    pub connected_at: Instant,
    /// Remote peer address
    pub peer: String,
    /// Authenticated user
    pub owner: Option<String>,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}

/// The main daemon server
pub struct DaemonServer {
    /// Shared orchestration engine
    conductor: Conductor,
    /// Listener settings
    settings: ServerSettings,
    /// Active connection state
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(conductor: Conductor, settings: ServerSettings) -> Self {
        Self {
            conductor,
            settings,
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// Bind the configured listen address
    ///
    /// # Errors
    ///
    /// Fails if the address is invalid or already in use.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.settings.listen_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", self.settings.listen_addr))?;
        info!(addr = %listener.local_addr()?, "Listening for connections");
        Ok(listener)
    }

    /// Accept connections until `shutdown` flips to `true`
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; reserved for listener failures.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => continue,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
            };

            if self.connection_states.len() >= self.settings.max_connections {
                warn!(peer = %peer, "Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let conn_id = ConnectionId::new();
            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer: peer.to_string(),
                    owner: None,
                },
            );
            info!(
                conn_id = %conn_id,
                peer = %peer,
                active_connections = self.connection_states.len(),
                "New connection accepted"
            );

            connections.spawn(
                handle_connection(
                    conn_id,
                    stream,
                    self.conductor.clone(),
                    self.settings.clone(),
                    Arc::clone(&self.connection_states),
                    shutdown.clone(),
                )
                .instrument(tracing::info_span!("connection", %conn_id)),
            );
        }

        self.shutdown(connections).await;
        Ok(())
    }

    /// Graceful shutdown
    async fn shutdown(&self, mut connections: JoinSet<()>) {
        info!("Initiating graceful shutdown");

        // Sessions end first so attached clients receive their aborted events.
        self.conductor.shutdown().await;

        // Connections saw the same signal and are flushing those events.
        let drained = timeout(self.settings.drain_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !drained {
            warn!(remaining = connections.len(), "Connections did not drain in time, closing");
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }
        self.connection_states.clear();

        info!("Shutdown complete");
    }

    /// Get number of active connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }

    /// Get connection statistics
    #[must_use]
    pub fn connection_stats(&self) -> HashMap<ConnectionId, ConnectionStats> {
        self.connection_states
            .iter()
            .map(|r| {
                let state = r.value();
                (
                    *r.key(),
                    ConnectionStats {
                        connected_at: state.connected_at,
                        peer: state.peer.clone(),
                        owner: state.owner.clone(),
                        uptime_secs: state.connected_at.elapsed().as_secs(),
                    },
                )
            })
            .collect()
    }
}

/// Extract the `user` parameter from a query string
pub(crate) fn user_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "user")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Handle a single client connection
async fn handle_connection(
    conn_id: ConnectionId,
    stream: TcpStream,
    conductor: Conductor,
    settings: ServerSettings,
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
    shutdown: watch::Receiver<bool>,
) {
    let mut owner = None;
    let handshake = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        owner = user_from_query(req.uri().query());
        if owner.is_some() {
            Ok(resp)
        } else {
            let mut reject = ErrorResponse::new(Some("missing user".to_string()));
            *reject.status_mut() = StatusCode::UNAUTHORIZED;
            Err(reject)
        }
    })
    .await;

    match (handshake, owner) {
        (Ok(ws), Some(owner)) => {
            if let Some(mut state) = connection_states.get_mut(&conn_id) {
                state.owner = Some(owner.clone());
            }
            info!(owner = %owner, "Connection handler started");
            run_connection(ws, &owner, conductor, &settings, shutdown).await;
        }
        (Err(e), _) => warn!(error = %e, "WebSocket handshake failed"),
        (Ok(_), None) => warn!("Handshake accepted without a user"),
    }

    connection_states.remove(&conn_id);
    info!(
        active_connections = connection_states.len(),
        "Connection handler finished"
    );
}

/// Ack handles of one connection's live subscriptions
///
/// Keyed per subscription, so two subscriptions to the same message do not
/// replace each other.
#[derive(Default)]
struct Acks {
    next_key: AtomicU64,
    handles: DashMap<u64, (MessageId, AckHandle)>,
}

impl Acks {
    fn register(&self, message_id: MessageId, handle: AckHandle) -> u64 {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(key, (message_id, handle));
        key
    }

    fn release(&self, key: u64) {
        self.handles.remove(&key);
    }

    /// Acknowledge `sequence` on every subscription to `message_id`
    fn ack(&self, message_id: MessageId, sequence: u64) -> usize {
        let mut acked = 0;
        for entry in self.handles.iter() {
            let (id, handle) = entry.value();
            if *id == message_id {
                handle.ack(sequence);
                acked += 1;
            }
        }
        acked
    }
}

/// Pump frames between one WebSocket and the conductor
///
/// Outbound messages go through a bounded channel, so a slow client applies
/// backpressure to its own forwarders only. Those forwarders stop reading
/// their subscriptions and fall into the subscription's lag handling.
///
/// When the client leaves, forwarding stops at once but requests already
/// being handled run to completion. On server shutdown, reading stops and
/// open streams get `drain_grace` to deliver their final events.
async fn run_connection(
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    owner: &str,
    conductor: Conductor,
    settings: &ServerSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut sink, mut source) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(settings.connection_channel_capacity.max(1));
    let (closed_tx, closed_rx) = watch::channel(false);
    let acks = Arc::new(Acks::default());
    let mut tasks = JoinSet::new();

    let mut writer_closed = closed_rx.clone();
    let writer = tokio::spawn(
        async move {
            loop {
                let message = tokio::select! {
                    biased;
                    message = out_rx.recv() => message,
                    () = closed_signal(&mut writer_closed) => None,
                };
                let Some(message) = message else { break };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Frame::Text(json)).await {
                    debug!(error = %e, "Write failed, closing writer");
                    break;
                }
            }
            let _ = sink.close().await;
        }
        .in_current_span(),
    );

    let client_left = loop {
        tokio::select! {
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                info!("Server shutting down, draining streams");
                break false;
            }
            frame = source.next() => match frame {
                Some(Ok(Frame::Text(text))) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => {
                        debug!(event = event.name(), "Received event");
                        let conductor = conductor.clone();
                        let owner = owner.to_string();
                        let out_tx = out_tx.clone();
                        let acks = Arc::clone(&acks);
                        let closed = closed_rx.clone();
                        tasks.spawn(
                            async move {
                                let dispatch = conductor.handle_event(&owner, event).await;
                                deliver(dispatch, out_tx, acks, closed).await;
                            }
                            .in_current_span(),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to decode client event");
                        let reply = ServerMessage::Error {
                            code: "bad_request".into(),
                            message: e.to_string(),
                            message_id: None,
                        };
                        if out_tx.send(reply).await.is_err() {
                            break true;
                        }
                    }
                },
                Some(Ok(Frame::Close(_))) | None => {
                    info!("Client disconnected");
                    break true;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Read error");
                    break true;
                }
            },
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    };

    // Nobody is listening any more: detach subscriptions, keep requests.
    if client_left {
        closed_tx.send_replace(true);
    }
    let drained = timeout(settings.drain_grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await
    .is_ok();
    closed_tx.send_replace(true);
    if !drained {
        debug!(pending = tasks.len(), "Leaving unfinished requests to complete detached");
        tasks.detach_all();
    }

    drop(out_tx);
    let _ = writer.await;
}

/// Resolves once the connection is closing
async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

/// Queue a message for the writer; false once the connection is closing
async fn send(
    out_tx: &mpsc::Sender<ServerMessage>,
    closed: &mut watch::Receiver<bool>,
    message: ServerMessage,
) -> bool {
    tokio::select! {
        biased;
        () = closed_signal(closed) => false,
        sent = out_tx.send(message) => sent.is_ok(),
    }
}

/// Send a dispatch result to the connection
async fn deliver(
    dispatch: Dispatch,
    out_tx: mpsc::Sender<ServerMessage>,
    acks: Arc<Acks>,
    mut closed: watch::Receiver<bool>,
) {
    match dispatch {
        Dispatch::Reply(message) => {
            send(&out_tx, &mut closed, message).await;
        }
        Dispatch::Stream {
            preface,
            subscription,
        } => {
            for message in preface {
                if !send(&out_tx, &mut closed, message).await {
                    return;
                }
            }
            forward(subscription, &out_tx, &acks, &mut closed).await;
        }
        Dispatch::Ack {
            message_id,
            sequence,
        } => {
            let subscriptions = acks.ack(message_id, sequence);
            debug!(message_id = %message_id, sequence, subscriptions, "Client ack");
        }
    }
}

/// Forward one subscription until it ends or the connection closes
///
/// The client drives acknowledgements: a lagging subscription re-syncs from
/// the last sequence the client acked, not the last one queued for it.
async fn forward(
    subscription: Subscription,
    out_tx: &mpsc::Sender<ServerMessage>,
    acks: &Acks,
    closed: &mut watch::Receiver<bool>,
) {
    let mut subscription = subscription.manual_ack();
    let message_id = subscription.message_id();
    let key = acks.register(message_id, subscription.ack_handle());

    loop {
        let next = tokio::select! {
            biased;
            () = closed_signal(closed) => None,
            next = subscription.recv() => next,
        };
        let Some(event) = next else { break };
        if !send(out_tx, closed, event).await {
            break;
        }
    }

    acks.release(key);
    debug!(message_id = %message_id, delivered = subscription.delivered(), "Subscription detached");
}
