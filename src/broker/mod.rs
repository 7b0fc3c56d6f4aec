//! Pub/sub broker abstraction
//!
//! The relay only needs three things from a broker: open a client, bind a
//! message callback to a named channel, and cancel that binding again.
//! Redis is the production backend; the in-memory broker backs tests and
//! broker-less local runs.

#[allow(dead_code)]
mod memory;
mod redis;
#[allow(dead_code)]
pub mod resp;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::*;
pub use redis::*;

/// Channel the relay listens on unless configured otherwise
pub const DEFAULT_CHANNEL: &str = "banner_message";

/// Broker address used unless configured otherwise
pub const DEFAULT_BROKER_URL: &str = "redis://localhost:6379";

/// Errors that can occur while talking to a broker
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    #[error("Subscription rejected: {0}")]
    SubscribeFailed(String),

    #[error("Broker I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Broker protocol error: {0}")]
    Protocol(#[from] resp::RespError),
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// An opaque message body as delivered by the broker
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// The payload as text, if it is valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(text) => write!(f, "Payload({:?})", text),
            None => write!(f, "Payload({} bytes)", self.0.len()),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self(text.into_bytes())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Callback invoked once per message received on a subscription, in broker order
pub type MessageHandler = Box<dyn Fn(Payload) + Send + Sync>;

/// Callback invoked at most once when the broker ends a subscription on its own
///
/// Never called for a subscription torn down through `unsubscribe` or drop.
pub type ClosedHandler = Box<dyn FnOnce() + Send>;

/// Which broker backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Redis server reached over RESP
    #[default]
    Redis,
    /// In-process broker (single process only)
    Memory,
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerKind::Redis => write!(f, "redis"),
            BrokerKind::Memory => write!(f, "memory"),
        }
    }
}

/// A pub/sub broker that hands out independent clients
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new client connection to the broker
    async fn connect(&self) -> BrokerResult<Box<dyn BrokerClient>>;

    /// Publish a payload on a channel, returning how many subscribers received it
    async fn publish(&self, channel: &str, payload: Payload) -> BrokerResult<usize>;
}

/// A single broker connection, consumed by subscribing it to a channel
#[async_trait]
pub trait BrokerClient: Send {
    /// Bind `on_message` to `channel`
    ///
    /// The subscription is active once this returns: any message published
    /// afterwards is passed to the handler until the returned handle is
    /// unsubscribed or dropped. If the broker drops the subscription first
    /// (connection lost, channel torn down), `on_closed` runs and no further
    /// messages arrive.
    async fn subscribe(
        self: Box<Self>,
        channel: &str,
        on_message: MessageHandler,
        on_closed: ClosedHandler,
    ) -> BrokerResult<Box<dyn Subscription>>;
}

/// Cancellable handle for an active channel binding
///
/// Dropping the handle stops delivery; `unsubscribe` additionally tells the
/// broker. Delivery has stopped by the time `unsubscribe` returns, whether
/// or not the broker acknowledged it.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Channel this subscription is bound to
    fn channel(&self) -> &str;

    /// Cancel the subscription and release the underlying client
    async fn unsubscribe(self: Box<Self>) -> BrokerResult<()>;
}

/// Build the broker backend selected by `kind`
pub fn build_broker(kind: BrokerKind, url: &str) -> BrokerResult<Arc<dyn Broker>> {
    match kind {
        BrokerKind::Redis => Ok(Arc::new(RedisBroker::from_url(url)?)),
        BrokerKind::Memory => Ok(Arc::new(MemoryBroker::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_text() {
        let payload = Payload::from("hello");
        assert_eq!(payload.as_str(), Some("hello"));
        assert_eq!(payload.len(), 5);
        assert_eq!(format!("{:?}", payload), "Payload(\"hello\")");
    }

    #[test]
    fn test_payload_binary() {
        let payload = Payload::new(vec![0xff, 0xfe, 0x00]);
        assert!(payload.as_str().is_none());
        assert_eq!(format!("{:?}", payload), "Payload(3 bytes)");
        assert_eq!(payload.into_bytes(), vec![0xff, 0xfe, 0x00]);
    }

    #[test]
    fn test_build_broker_rejects_bad_url() {
        let result = build_broker(BrokerKind::Redis, "http://localhost:6379");
        assert!(matches!(result, Err(BrokerError::InvalidUrl(_))));
    }

    #[test]
    fn test_build_memory_broker_ignores_url() {
        assert!(build_broker(BrokerKind::Memory, "not a url").is_ok());
    }

    #[test]
    fn test_broker_kind_display() {
        assert_eq!(BrokerKind::Redis.to_string(), "redis");
        assert_eq!(BrokerKind::Memory.to_string(), "memory");
        assert_eq!(BrokerKind::default(), BrokerKind::Redis);
    }
}
