//! Connection-to-subscription lifecycle
//!
//! Tracks open client connections and binds each one to its own broker
//! subscription for the lifetime of the connection.

#[allow(dead_code)]
mod bridge;
#[allow(dead_code)]
mod connection;
#[allow(dead_code)]
mod registry;

pub use bridge::*;
pub use connection::*;
pub use registry::*;
