//! Relay configuration
//!
//! Loads relay settings from a TOML file such as:
//!
//! ```toml
//! bind = "0.0.0.0"
//! port = 8000
//! broker = "redis"
//! broker_url = "redis://localhost:6379"
//! channel = "banner_message"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::{BrokerKind, DEFAULT_BROKER_URL, DEFAULT_CHANNEL};

/// Default WebSocket listening port
pub const DEFAULT_PORT: u16 = 8000;

/// Default bind address
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Relay settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Address to bind the WebSocket listener to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Broker backend
    pub broker: BrokerKind,
    /// Broker address (`redis://host:port`)
    pub broker_url: String,
    /// Channel relayed to clients
    pub channel: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            broker: BrokerKind::default(),
            broker_url: DEFAULT_BROKER_URL.to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file; unset keys keep their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would only fail later at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.trim().is_empty() {
            return Err(ConfigError::Invalid("channel must not be empty".to_string()));
        }
        if self.bind.trim().is_empty() {
            return Err(ConfigError::Invalid("bind address must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_broker(mut self, broker: BrokerKind) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = url.into();
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
