//! Configuration module
//!
//! Relay settings from defaults, an optional TOML file and command-line flags.

mod relay;

pub use relay::*;
