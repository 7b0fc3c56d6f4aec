//! WebSocket server module
//!
//! Accepts client connections and relays the broadcast channel to them.

mod websocket;

pub use websocket::*;
