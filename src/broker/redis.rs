//! Redis broker over RESP2
//!
//! Each client is its own TCP connection. Once subscribed the connection is
//! in pub/sub mode and its read half is owned by a reader task that turns
//! `message` pushes into handler calls.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::resp::{encode_command, read_frame, Frame, RespError};
use super::{
    Broker, BrokerClient, BrokerError, BrokerResult, ClosedHandler, MessageHandler, Payload,
    Subscription,
};

/// Default Redis port when the URL omits one
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Upper bound for connecting and for each request/reply exchange
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Parsed `redis://` address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisAddress {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RedisAddress {
    /// Parse `redis://[[user]:password@]host[:port][/db]`
    ///
    /// The database index is accepted and ignored: pub/sub channels are
    /// global to the server.
    pub fn parse(url: &str) -> BrokerResult<Self> {
        let rest = url
            .strip_prefix("redis://")
            .ok_or_else(|| BrokerError::InvalidUrl(format!("{} (expected redis:// scheme)", url)))?;
        let authority = rest.split('/').next().unwrap_or_default();

        let (credentials, host_port) = match authority.rsplit_once('@') {
            Some((creds, hp)) => (Some(creds), hp),
            None => (None, authority),
        };

        let (username, password) = match credentials {
            Some(creds) => match creds.split_once(':') {
                Some((user, pass)) => (
                    (!user.is_empty()).then(|| user.to_string()),
                    Some(pass.to_string()),
                ),
                None => (None, Some(creds.to_string())),
            },
            None => (None, None),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| BrokerError::InvalidUrl(format!("{} (bad port)", url)))?;
                (host, port)
            }
            None => (host_port, DEFAULT_REDIS_PORT),
        };

        if host.is_empty() {
            return Err(BrokerError::InvalidUrl(format!("{} (missing host)", url)));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            username,
            password,
        })
    }

    /// `host:port` for dialing
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Broker backed by a Redis server
#[derive(Debug, Clone)]
pub struct RedisBroker {
    address: RedisAddress,
}

impl RedisBroker {
    /// Create a broker for the given `redis://` URL (no connection is made yet)
    pub fn from_url(url: &str) -> BrokerResult<Self> {
        Ok(Self {
            address: RedisAddress::parse(url)?,
        })
    }

    async fn open(&self) -> BrokerResult<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
        let addr = self.address.socket_addr();
        let stream = timeout(IO_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| BrokerError::Unavailable(format!("timed out connecting to {}", addr)))?
            .map_err(|e| BrokerError::Unavailable(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        if let Some(password) = &self.address.password {
            let reply = match &self.address.username {
                Some(user) => {
                    request(&mut reader, &mut write_half, &[b"AUTH", user.as_bytes(), password.as_bytes()]).await?
                }
                None => request(&mut reader, &mut write_half, &[b"AUTH", password.as_bytes()]).await?,
            };
            if let Frame::Error(e) = reply {
                return Err(BrokerError::Unavailable(format!("authentication failed: {}", e)));
            }
        }

        debug!("Connected to Redis at {}", addr);
        Ok((reader, write_half))
    }
}

/// Send one command and wait for its reply
async fn request(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    args: &[&[u8]],
) -> BrokerResult<Frame> {
    writer.write_all(&encode_command(args)).await?;
    let reply = timeout(IO_TIMEOUT, read_frame(reader))
        .await
        .map_err(|_| BrokerError::Unavailable("timed out waiting for reply".to_string()))??;
    reply.ok_or_else(|| BrokerError::Protocol(RespError::UnexpectedEof))
}

#[async_trait]
impl Broker for RedisBroker {
    async fn connect(&self) -> BrokerResult<Box<dyn BrokerClient>> {
        let (reader, writer) = self.open().await?;
        Ok(Box::new(RedisClient { reader, writer }))
    }

    async fn publish(&self, channel: &str, payload: Payload) -> BrokerResult<usize> {
        let (mut reader, mut writer) = self.open().await?;
        let reply = request(
            &mut reader,
            &mut writer,
            &[b"PUBLISH", channel.as_bytes(), payload.as_bytes()],
        )
        .await?;
        let _ = writer.shutdown().await;

        match reply {
            Frame::Integer(n) => Ok(n.max(0) as usize),
            Frame::Error(e) => Err(BrokerError::Unavailable(e)),
            other => Err(BrokerError::Protocol(RespError::Malformed(format!(
                "unexpected PUBLISH reply: {:?}",
                other
            )))),
        }
    }
}

/// One TCP connection to Redis, not yet in pub/sub mode
pub struct RedisClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

#[async_trait]
impl BrokerClient for RedisClient {
    async fn subscribe(
        self: Box<Self>,
        channel: &str,
        on_message: MessageHandler,
        on_closed: ClosedHandler,
    ) -> BrokerResult<Box<dyn Subscription>> {
        let RedisClient {
            mut reader,
            mut writer,
        } = *self;

        let ack = request(&mut reader, &mut writer, &[b"SUBSCRIBE", channel.as_bytes()]).await?;
        match ack {
            ack if ack.is_ack("subscribe", channel) => {}
            Frame::Error(e) => return Err(BrokerError::SubscribeFailed(e)),
            other => {
                return Err(BrokerError::SubscribeFailed(format!(
                    "unexpected reply: {:?}",
                    other
                )))
            }
        }
        info!("Subscribed to Redis channel {}", channel);

        let channel_name = channel.to_string();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => match frame.into_message() {
                        Some((from, payload)) if from == channel_name.as_bytes() => {
                            on_message(Payload::new(payload));
                        }
                        Some((from, _)) => {
                            debug!(
                                "Ignoring message for channel {}",
                                String::from_utf8_lossy(&from)
                            );
                        }
                        None => {}
                    },
                    Ok(None) => {
                        warn!("Redis closed the subscription to {}", channel_name);
                        break;
                    }
                    Err(e) => {
                        warn!("Redis subscription to {} failed: {}", channel_name, e);
                        break;
                    }
                }
            }
            // Only reached when Redis ended the stream; unsubscribe aborts the task
            on_closed();
        });

        Ok(Box::new(RedisSubscription {
            channel: channel.to_string(),
            writer: Some(writer),
            reader_task,
        }))
    }
}

/// Live Redis subscription; owns the connection it runs on
pub struct RedisSubscription {
    channel: String,
    writer: Option<OwnedWriteHalf>,
    reader_task: JoinHandle<()>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn unsubscribe(self: Box<Self>) -> BrokerResult<()> {
        let mut this = self;
        // Stop delivery first; the broker round trip below may fail
        this.reader_task.abort();

        let Some(mut writer) = this.writer.take() else {
            return Ok(());
        };
        let command = encode_command(&[b"UNSUBSCRIBE", this.channel.as_bytes()]);
        let result = timeout(IO_TIMEOUT, async {
            writer.write_all(&command).await?;
            writer.shutdown().await
        })
        .await;

        match result {
            Ok(Ok(())) => {
                debug!("Unsubscribed from Redis channel {}", this.channel);
                Ok(())
            }
            Ok(Err(e)) => Err(BrokerError::Io(e)),
            Err(_) => Err(BrokerError::Unavailable(
                "timed out sending UNSUBSCRIBE".to_string(),
            )),
        }
    }
}

impl Drop for RedisSubscription {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
