use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Tunables for a single socket driver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Upper bound on the time spent in `Connecting`.
    pub connect_timeout_ms: u64,
    /// How long a closing socket waits for the peer's end of stream before
    /// giving up and entering `Closed`.
    pub close_timeout_ms: u64,
    /// Size of the buffer used for each transport read.
    pub read_chunk_size: usize,
    /// Number of inbound chunks buffered ahead of the consumer.
    pub inbound_capacity: usize,
}

impl SocketConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            close_timeout_ms: 5_000,
            read_chunk_size: 16 * 1024,
            inbound_capacity: 64,
        }
    }
}

/// Configuration for a bridge and the endpoints it is usually built with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Capacity of the diagnostic event channel (`message` / `error`).
    pub event_capacity: usize,
    /// Chunks buffered in each direction of a channel-backed session.
    pub session_capacity: usize,
    pub socket: SocketConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            event_capacity: 128,
            session_capacity: 32,
            socket: SocketConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Parses a JSON document; fields that are absent keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if `json` is not valid JSON or a field has the wrong type.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to parse bridge configuration")
    }
}
