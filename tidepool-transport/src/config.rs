//! Transport configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`Transport`](crate::Transport) and every link it
/// creates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address the listening socket binds to. Port `0` picks a free port.
    pub bind_address: String,

    /// Upper bound on a `connect` call, including link establishment.
    pub connect_timeout: Duration,

    /// Upper bound on the link handshake, dial or accept side.
    pub handshake_timeout: Duration,

    /// Largest message a single `send` may carry.
    ///
    /// Frames announcing more are protocol violations.
    pub max_message_size: usize,

    /// Size of each socket read.
    pub read_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(2),
            max_message_size: 4 * 1024 * 1024,
            read_buffer_size: 8 * 1024,
        }
    }
}

impl TransportConfig {
    /// Default configuration listening on `bind_address`.
    pub fn new(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            ..Self::default()
        }
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the maximum message size.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Create a configuration for low-latency local networking.
    pub fn local_network() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(250),
            ..Self::default()
        }
    }

    /// Create a configuration for high-latency WAN networking.
    pub fn wan_network() -> Self {
        Self {
            bind_address: "0.0.0.0:0".to_string(),
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            max_message_size: 16 * 1024 * 1024,
            read_buffer_size: 64 * 1024,
        }
    }
}

/// Per-call options for `connect`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectHints {
    /// Overrides [`TransportConfig::connect_timeout`] for this call.
    pub timeout: Option<Duration>,
}

impl ConnectHints {
    /// Hints with an explicit timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}
