//! WebSocket server implementation
//!
//! Accepts client connections, hands each one to the subscription bridge and
//! pumps queued broker payloads out to the socket until either side closes.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::config::RelayConfig;
use crate::relay::{ClientConnection, ConnectionRegistry, Outbound, SubscriptionBridge};

/// WebSocket server relaying one broker channel to every client
pub struct RelayServer {
    config: RelayConfig,
    bridge: Arc<SubscriptionBridge>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a new relay server on top of `broker`
    pub fn new(config: RelayConfig, broker: Arc<dyn Broker>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = Arc::new(SubscriptionBridge::new(broker, config.channel.clone(), registry));
        Self {
            config,
            bridge,
            shutdown_tx,
        }
    }

    pub fn bridge(&self) -> &Arc<SubscriptionBridge> {
        &self.bridge
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind and run until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            "Relaying channel {} on ws://{}",
            self.config.channel,
            listener.local_addr()?
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let bridge = Arc::clone(&self.bridge);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, bridge, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        // Connections normally close themselves on the shutdown signal; catch stragglers
        let open = self.bridge.registry().size().await;
        if open > 0 {
            info!("Releasing {} remaining connections", open);
            self.bridge.close_all().await;
        }

        Ok(())
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    bridge: Arc<SubscriptionBridge>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let connection = Arc::new(ClientConnection::new(peer_addr.to_string(), outbound_tx));

    if let Err(e) = bridge.on_connection_opened(&connection).await {
        warn!("Rejecting {}: {}", peer_addr, e);
        let frame = CloseFrame {
            code: CloseCode::Error,
            reason: "broker unavailable".into(),
        };
        let _ = ws_sender.send(Message::Close(Some(frame))).await;
        return Ok(());
    }

    loop {
        tokio::select! {
            // Broker payloads queued by the subscription callback
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(Outbound::Payload(payload)) => {
                        if let Err(e) = ws_sender.send(payload.into_message()).await {
                            warn!("Failed to deliver to {}: {}", peer_addr, e);
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            // Receive messages from client
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} requested close", peer_addr);
                        break;
                    }
                    Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                        debug!("Ignoring client message from {}", peer_addr);
                    }
                    Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        info!("Connection closed by {}", peer_addr);
                        break;
                    }
                }
            }
            // Handle shutdown signal
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection to {}", peer_addr);
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    bridge.on_connection_closed(&connection).await;
    info!("Connection from {} closed", peer_addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    async fn start(broker: &MemoryBroker) -> (Arc<RelayServer>, SocketAddr) {
        let config = RelayConfig::default().with_bind("127.0.0.1").with_port(0);
        let server = Arc::new(RelayServer::new(config, Arc::new(broker.clone())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = Arc::clone(&server);
        tokio::spawn(async move {
            handle.serve(listener).await.unwrap();
        });
        (server, addr)
    }

    async fn wait_for_subscriptions(server: &RelayServer, expected: usize) {
        for _ in 0..200 {
            if server.bridge().subscription_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} subscriptions", expected);
    }

    #[tokio::test]
    async fn test_relays_published_messages() {
        let broker = MemoryBroker::new();
        let (server, addr) = start(&broker).await;

        let (mut client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        wait_for_subscriptions(&server, 1).await;

        broker.publish("banner_message", "hello".into()).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::Text("hello".to_string()));

        client.close(None).await.unwrap();
        wait_for_subscriptions(&server, 0).await;
        assert_eq!(broker.active_subscriptions(), 0);
        assert_eq!(server.bridge().registry().size().await, 0);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_rejects_when_broker_unavailable() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let (server, addr) = start(&broker).await;

        let (mut client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match msg {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Error),
            other => panic!("Expected close frame, got {:?}", other),
        }
        assert_eq!(server.bridge().registry().size().await, 0);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_releases_subscriptions() {
        let broker = MemoryBroker::new();
        let (server, addr) = start(&broker).await;

        let (mut client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        wait_for_subscriptions(&server, 1).await;

        server.shutdown();
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(msg, Message::Close(_)));
        wait_for_subscriptions(&server, 0).await;
        assert_eq!(broker.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_broker_loss_closes_client() {
        let broker = MemoryBroker::new();
        let (server, addr) = start(&broker).await;

        let (mut client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        wait_for_subscriptions(&server, 1).await;

        broker.close_channel("banner_message").await;
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(msg, Message::Close(_)));
        wait_for_subscriptions(&server, 0).await;
        assert_eq!(server.bridge().registry().size().await, 0);
        assert_eq!(broker.active_subscriptions(), 0);

        server.shutdown();
    }
}
