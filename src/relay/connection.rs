//! Client connection handle
//!
//! The transport task owns the WebSocket; the relay holds a
//! `ClientConnection` that can only enqueue outbound frames. The writer loop
//! in the transport drains the queue in order.
//!
//! The outbound queue is unbounded: a client that stops reading grows it
//! until the transport notices and closes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broker::Payload;

/// Unique identifier of a client connection
pub type ConnectionId = Uuid;

/// Failure to hand a payload to a connection
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Connection {0} is closed")]
    Closed(ConnectionId),
}

/// Lifecycle of a connection as seen by the relay
///
/// `Opened -> Subscribed -> Closed`, or `Opened -> Closed` when subscription
/// setup fails. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Opened,
    Subscribed,
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (ConnectionState::Opened, ConnectionState::Subscribed)
                | (ConnectionState::Opened, ConnectionState::Closed)
                | (ConnectionState::Subscribed, ConnectionState::Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Opened => write!(f, "opened"),
            ConnectionState::Subscribed => write!(f, "subscribed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Frames queued for the transport writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Forward a broker payload verbatim
    Payload(Payload),
    /// Ask the transport to close the connection
    Close,
}

impl Payload {
    /// Text frame for UTF-8 payloads, binary frame otherwise
    pub fn into_message(self) -> Message {
        match String::from_utf8(self.into_bytes()) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        }
    }
}

/// Cheap, cloneable write side of a connection, safe to move into callbacks
#[derive(Clone)]
pub struct ConnectionSink {
    id: ConnectionId,
    closed: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionSink {
    /// Queue a payload for the client
    pub fn send(&self, payload: Payload) -> Result<(), DeliveryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeliveryError::Closed(self.id));
        }
        self.outbound
            .send(Outbound::Payload(payload))
            .map_err(|_| DeliveryError::Closed(self.id))
    }

    /// Ask the transport to close the connection (best effort)
    pub fn request_close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// An open client session as tracked by the relay
pub struct ClientConnection {
    id: ConnectionId,
    peer: String,
    closed: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Serializes lifecycle transitions for this connection
    state: Mutex<ConnectionState>,
}

impl ClientConnection {
    /// Create a connection handle that writes into `outbound`
    pub fn new(peer: impl Into<String>, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer: peer.into(),
            closed: Arc::new(AtomicBool::new(false)),
            outbound,
            state: Mutex::new(ConnectionState::Opened),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address, for logging
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    /// Whether the connection has reached `Closed` or its transport has gone away
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outbound.is_closed()
    }

    pub fn sink(&self) -> ConnectionSink {
        ConnectionSink {
            id: self.id,
            closed: Arc::clone(&self.closed),
            outbound: self.outbound.clone(),
        }
    }

    /// Queue a payload for the client
    pub fn send(&self, payload: Payload) -> Result<(), DeliveryError> {
        self.sink().send(payload)
    }

    /// Ask the transport to close the connection (best effort)
    pub fn request_close(&self) {
        self.sink().request_close();
    }

    /// Hold the lifecycle lock; transitions go through [`LifecycleGuard::advance`]
    pub(crate) async fn lifecycle(&self) -> LifecycleGuard<'_> {
        LifecycleGuard {
            state: self.state.lock().await,
            closed: &self.closed,
        }
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Exclusive access to a connection's lifecycle state
pub(crate) struct LifecycleGuard<'a> {
    state: MutexGuard<'a, ConnectionState>,
    closed: &'a AtomicBool,
}

impl LifecycleGuard<'_> {
    pub(crate) fn current(&self) -> ConnectionState {
        *self.state
    }

    /// Move to `next`, returning false (and staying put) if the transition is illegal
    pub(crate) fn advance(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        if next == ConnectionState::Closed {
            self.closed.store(true, Ordering::SeqCst);
        }
        *self.state = next;
        true
    }
}
