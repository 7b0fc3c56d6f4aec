//! Subscription bridge
//!
//! Keeps exactly one broker subscription per open connection and moves
//! messages from the broker to that connection. Every connection gets its own
//! broker client. A single shared subscription fanned out over the registry
//! is not implemented.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ClientConnection, ConnectionId, ConnectionRegistry, ConnectionState, RegistryError};
use crate::broker::{
    Broker, BrokerError, BrokerResult, ClosedHandler, MessageHandler, Subscription,
};

/// Errors that can occur while opening a connection's subscription
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(#[source] BrokerError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Connection {id} cannot be opened from state {state}")]
    InvalidState {
        id: ConnectionId,
        state: ConnectionState,
    },
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Binds connections to broker subscriptions
pub struct SubscriptionBridge {
    broker: Arc<dyn Broker>,
    channel: String,
    registry: Arc<ConnectionRegistry>,
    subscriptions: Mutex<HashMap<ConnectionId, Box<dyn Subscription>>>,
}

impl SubscriptionBridge {
    /// Create a bridge relaying `channel` from `broker`, tracking connections in `registry`
    pub fn new(
        broker: Arc<dyn Broker>,
        channel: impl Into<String>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            broker,
            channel: channel.into(),
            registry,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Number of live subscriptions
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    pub async fn has_subscription(&self, id: ConnectionId) -> bool {
        self.subscriptions.lock().await.contains_key(&id)
    }

    /// Handle a newly opened connection
    ///
    /// Registers the connection and subscribes it to the channel. If the
    /// broker cannot be reached the connection is deregistered, moved to
    /// `Closed` and asked to close, and `BrokerUnavailable` is returned.
    /// If the broker later drops the subscription, the connection is asked
    /// to close as well.
    pub async fn on_connection_opened(&self, connection: &Arc<ClientConnection>) -> BridgeResult<()> {
        let id = connection.id();
        let mut lifecycle = connection.lifecycle().await;
        if lifecycle.current() != ConnectionState::Opened {
            return Err(BridgeError::InvalidState {
                id,
                state: lifecycle.current(),
            });
        }

        self.registry.add(Arc::clone(connection)).await?;

        let subscription = match self.subscribe(connection).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(
                    "Subscription for {} ({}) failed, closing: {}",
                    id,
                    connection.peer(),
                    e
                );
                if let Err(e) = self.registry.remove(id).await {
                    warn!("{}", e);
                }
                lifecycle.advance(ConnectionState::Closed);
                connection.request_close();
                return Err(BridgeError::BrokerUnavailable(e));
            }
        };

        self.subscriptions.lock().await.insert(id, subscription);
        lifecycle.advance(ConnectionState::Subscribed);
        info!(
            "Connection {} ({}) subscribed to {}",
            id,
            connection.peer(),
            self.channel
        );
        Ok(())
    }

    async fn subscribe(&self, connection: &ClientConnection) -> BrokerResult<Box<dyn Subscription>> {
        let client = self.broker.connect().await?;

        let id = connection.id();
        let sink = connection.sink();
        let on_message: MessageHandler = Box::new(move |payload| {
            let len = payload.len();
            match sink.send(payload) {
                Ok(()) => debug!("Queued {} bytes for {}", len, id),
                Err(e) => warn!("Dropping message: {}", e),
            }
        });

        // Broker dropped us: close the client so it reconnects; the transport
        // then runs on_connection_closed as for any other close
        let sink = connection.sink();
        let on_closed: ClosedHandler = Box::new(move || {
            warn!("Broker ended the subscription for {}, closing", id);
            sink.request_close();
        });

        client.subscribe(&self.channel, on_message, on_closed).await
    }

    /// Handle a closed connection
    ///
    /// Idempotent and infallible: unsubscribe errors are logged and the
    /// subscription is released regardless.
    pub async fn on_connection_closed(&self, connection: &ClientConnection) {
        let id = connection.id();
        let mut lifecycle = connection.lifecycle().await;
        if !lifecycle.advance(ConnectionState::Closed) {
            debug!("Connection {} already closed", id);
            return;
        }

        if let Err(e) = self.registry.remove(id).await {
            warn!("{}", e);
        }

        let subscription = self.subscriptions.lock().await.remove(&id);
        match subscription {
            Some(subscription) => {
                if let Err(e) = subscription.unsubscribe().await {
                    warn!("Ignoring unsubscribe error for {}: {}", id, e);
                }
                info!("Connection {} ({}) unsubscribed", id, connection.peer());
            }
            None => debug!("No subscription held for {}", id),
        }
    }

    /// Close every registered connection, releasing all subscriptions
    pub async fn close_all(&self) {
        for id in self.registry.ids().await {
            if let Some(connection) = self.registry.get(id).await {
                connection.request_close();
                self.on_connection_closed(&connection).await;
            }
        }
    }
}
