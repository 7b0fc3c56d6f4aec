//! In-process broker
//!
//! Channels are `tokio::sync::broadcast` senders created on first use. Every
//! subscription gets its own receiver and forwarding task, mirroring the
//! one-client-per-subscription shape of the Redis backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    Broker, BrokerClient, BrokerError, BrokerResult, ClosedHandler, MessageHandler, Payload,
    Subscription,
};

/// Per-channel buffer before slow subscribers start lagging
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct MemoryState {
    channels: RwLock<HashMap<String, broadcast::Sender<Payload>>>,
    unavailable: AtomicBool,
    active: AtomicUsize,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
}

impl MemoryState {
    fn check_available(&self) -> BrokerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(BrokerError::Unavailable("memory broker is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Broker living entirely inside this process
///
/// Clones share the same channels. The broker can be switched offline to
/// exercise failure paths: connect, subscribe and publish then fail, and
/// unsubscribe reports an error after releasing the subscription.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<MemoryState>,
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the broker going down or coming back
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of subscriptions currently delivering messages
    pub fn active_subscriptions(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Total successful subscribe calls since creation
    pub fn subscribe_calls(&self) -> usize {
        self.state.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Total unsubscribe calls since creation
    pub fn unsubscribe_calls(&self) -> usize {
        self.state.unsubscribe_calls.load(Ordering::SeqCst)
    }

    /// Tear down `channel`, ending every live subscription to it
    ///
    /// Subscribers see the broker close on them, as if a Redis connection
    /// had dropped. Returns whether the channel existed.
    pub async fn close_channel(&self, channel: &str) -> bool {
        let removed = self.state.channels.write().await.remove(channel);
        if removed.is_some() {
            debug!("Closed channel {}", channel);
        }
        removed.is_some()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> BrokerResult<Box<dyn BrokerClient>> {
        self.state.check_available()?;
        Ok(Box::new(MemoryClient {
            state: Arc::clone(&self.state),
        }))
    }

    async fn publish(&self, channel: &str, payload: Payload) -> BrokerResult<usize> {
        self.state.check_available()?;
        let channels = self.state.channels.read().await;
        let receivers = match channels.get(channel) {
            Some(tx) => tx.send(payload).unwrap_or(0),
            None => 0,
        };
        debug!("Published to {} ({} receivers)", channel, receivers);
        Ok(receivers)
    }
}

/// A connected client of the in-process broker
pub struct MemoryClient {
    state: Arc<MemoryState>,
}

#[async_trait]
impl BrokerClient for MemoryClient {
    async fn subscribe(
        self: Box<Self>,
        channel: &str,
        on_message: MessageHandler,
        on_closed: ClosedHandler,
    ) -> BrokerResult<Box<dyn Subscription>> {
        self.state.check_available()?;

        // Take the receiver before returning so nothing published afterwards is missed
        let mut rx = {
            let mut channels = self.state.channels.write().await;
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let channel_name = channel.to_string();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => on_message(payload),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Subscriber on {} lagged by {} messages", channel_name, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Channel {} closed under its subscriber", channel_name);
                        on_closed();
                        break;
                    }
                }
            }
        });

        self.state.active.fetch_add(1, Ordering::SeqCst);
        self.state.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemorySubscription {
            channel: channel.to_string(),
            state: self.state,
            task: Some(task),
        }))
    }
}

/// Live binding to an in-process channel
pub struct MemorySubscription {
    channel: String,
    state: Arc<MemoryState>,
    task: Option<JoinHandle<()>>,
}

impl MemorySubscription {
    fn release(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.state.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn unsubscribe(self: Box<Self>) -> BrokerResult<()> {
        let mut this = self;
        this.state.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        this.release();
        this.state.check_available()
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn collecting_handler() -> (MessageHandler, mpsc::UnboundedReceiver<Payload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Box::new(move |payload| {
            let _ = tx.send(payload);
        });
        (handler, rx)
    }

    fn ignore_closed() -> ClosedHandler {
        Box::new(|| {})
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Payload>) -> Payload {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("handler dropped")
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.publish("banner_message", "x".into()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_and_receive_in_order() {
        let broker = MemoryBroker::new();
        let (handler, mut rx) = collecting_handler();
        let client = broker.connect().await.unwrap();
        let sub = client.subscribe("banner_message", handler, ignore_closed()).await.unwrap();
        assert_eq!(sub.channel(), "banner_message");
        assert_eq!(broker.active_subscriptions(), 1);

        assert_eq!(broker.publish("banner_message", "one".into()).await.unwrap(), 1);
        broker.publish("banner_message", "two".into()).await.unwrap();
        broker.publish("other", "ignored".into()).await.unwrap();

        assert_eq!(next(&mut rx).await, Payload::from("one"));
        assert_eq!(next(&mut rx).await, Payload::from("two"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let broker = MemoryBroker::new();
        let (handler, mut rx) = collecting_handler();
        let sub = broker
            .connect()
            .await
            .unwrap()
            .subscribe("banner_message", handler, ignore_closed())
            .await
            .unwrap();

        sub.unsubscribe().await.unwrap();
        assert_eq!(broker.active_subscriptions(), 0);
        assert_eq!(broker.unsubscribe_calls(), 1);

        broker.publish("banner_message", "late".into()).await.unwrap();
        // Handler (and its sender) went away with the aborted task
        assert!(next_or_none(&mut rx).await.is_none());
    }

    async fn next_or_none(rx: &mut mpsc::UnboundedReceiver<Payload>) -> Option<Payload> {
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_drop_releases_subscription() {
        let broker = MemoryBroker::new();
        let (handler, _rx) = collecting_handler();
        let sub = broker
            .connect()
            .await
            .unwrap()
            .subscribe("banner_message", handler, ignore_closed())
            .await
            .unwrap();
        drop(sub);
        assert_eq!(broker.active_subscriptions(), 0);
        assert_eq!(broker.unsubscribe_calls(), 0);
    }

    #[tokio::test]
    async fn test_offline_broker() {
        let broker = MemoryBroker::new();
        let client = broker.connect().await.unwrap();
        broker.set_available(false);

        assert!(matches!(broker.connect().await, Err(BrokerError::Unavailable(_))));
        assert!(broker.publish("banner_message", "x".into()).await.is_err());

        let (handler, _rx) = collecting_handler();
        assert!(client.subscribe("banner_message", handler, ignore_closed()).await.is_err());
        assert_eq!(broker.subscribe_calls(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_while_offline_still_releases() {
        let broker = MemoryBroker::new();
        let (handler, _rx) = collecting_handler();
        let sub = broker
            .connect()
            .await
            .unwrap()
            .subscribe("banner_message", handler, ignore_closed())
            .await
            .unwrap();

        broker.set_available(false);
        assert!(sub.unsubscribe().await.is_err());
        assert_eq!(broker.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_close_channel_ends_live_subscription() {
        let broker = MemoryBroker::new();
        let (handler, mut rx) = collecting_handler();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        let sub = broker
            .connect()
            .await
            .unwrap()
            .subscribe(
                "banner_message",
                handler,
                Box::new(move || {
                    let _ = closed_tx.send(());
                }),
            )
            .await
            .unwrap();

        assert!(broker.close_channel("banner_message").await);
        assert!(!broker.close_channel("banner_message").await);

        tokio::time::timeout(Duration::from_secs(1), closed_rx)
            .await
            .expect("subscription end was not reported")
            .unwrap();
        // Forwarding task is gone along with the handler
        assert!(next_or_none(&mut rx).await.is_none());

        sub.unsubscribe().await.unwrap();
        assert_eq!(broker.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_does_not_report_closed() {
        let broker = MemoryBroker::new();
        let (handler, _rx) = collecting_handler();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel::<()>();
        let sub = broker
            .connect()
            .await
            .unwrap()
            .subscribe(
                "banner_message",
                handler,
                Box::new(move || {
                    let _ = closed_tx.send(());
                }),
            )
            .await
            .unwrap();

        sub.unsubscribe().await.unwrap();
        broker.close_channel("banner_message").await;
        // Aborted task drops the callback without calling it
        assert!(closed_rx.await.is_err());
    }
}
