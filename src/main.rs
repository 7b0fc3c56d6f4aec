//! Banner Relay
//!
//! WebSocket relay for banner messages. Every connected client gets its own
//! subscription to the broadcast channel and receives each published message
//! verbatim.

mod broker;
mod config;
mod relay;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use broker::{build_broker, BrokerKind, Payload};
use config::RelayConfig;
use server::RelayServer;

/// Banner Relay
///
/// Relays a pub/sub channel to WebSocket clients
#[derive(Parser, Debug)]
#[command(name = "banner-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML config file; command-line flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on [default: 8000]
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long)]
    bind: Option<String>,

    /// Broker backend [default: redis]
    #[arg(long, value_enum)]
    broker: Option<BrokerKind>,

    /// Broker URL [default: redis://localhost:6379]
    #[arg(long)]
    broker_url: Option<String>,

    /// Channel to relay [default: banner_message]
    #[arg(long)]
    channel: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server (default)
    Serve,
    /// Publish one message on the channel and exit
    Publish {
        /// Message text
        message: String,
    },
}

impl Args {
    /// Resolve the effective configuration: defaults, then file, then flags
    fn relay_config(&self) -> anyhow::Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)?,
            None => RelayConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config = config.with_bind(bind.clone());
        }
        if let Some(port) = self.port {
            config = config.with_port(port);
        }
        if let Some(broker) = self.broker {
            config = config.with_broker(broker);
        }
        if let Some(url) = &self.broker_url {
            config = config.with_broker_url(url.clone());
        }
        if let Some(channel) = &self.channel {
            config = config.with_channel(channel.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose when set
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = args.relay_config()?;
    let broker = build_broker(config.broker, &config.broker_url)?;

    match args.command {
        Some(Command::Publish { message }) => {
            let receivers = broker.publish(&config.channel, Payload::from(message)).await?;
            info!("Published to {} ({} receivers)", config.channel, receivers);
            Ok(())
        }
        Some(Command::Serve) | None => serve(config, broker).await,
    }
}

async fn serve(config: RelayConfig, broker: Arc<dyn broker::Broker>) -> anyhow::Result<()> {
    info!("Banner Relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Using {} broker at {}", config.broker, config.broker_url);

    let server = Arc::new(RelayServer::new(config, broker));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
