//! Error types surfaced to callers and through events.

use std::io;
use thiserror::Error;

use crate::EndPointAddress;

/// Why `connect` failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The remote transport could not be reached, or the link to it broke
    /// before the connection was announced.
    #[error("address unreachable: {0}")]
    AddressUnreachable(String),

    /// The local endpoint is closed.
    #[error("endpoint closed")]
    EndpointClosed,

    /// The remote transport answered the link handshake with a refusal.
    #[error("handshake refused: {0}")]
    HandshakeRefused(String),

    /// No link was established within the connect timeout.
    #[error("connect timed out")]
    Timeout,
}

/// Why `send` failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The connection was closed locally, or its link was shut down.
    #[error("connection closed")]
    ConnectionClosed,

    /// The link carrying the connection failed.
    #[error("link broken: {0}")]
    LinkBroken(String),

    /// The chunks add up to more than the configured maximum message size.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Total size of the chunks.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// Transport lifecycle errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Binding the listening socket failed.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Requested bind address.
        address: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
}

/// Kind of asynchronous failure reported through
/// [`Event::ConnectionError`](crate::Event::ConnectionError).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventErrorKind {
    /// The link to this remote endpoint failed; every connection over it,
    /// in either direction, is gone.
    ConnectionLost(EndPointAddress),
}

/// Asynchronous failure delivered as an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {detail}")]
pub struct EventError {
    /// What failed.
    pub kind: EventErrorKind,
    /// Human-readable cause.
    pub detail: String,
}

/// Result type for transport construction.
pub type TransportResult<T> = Result<T, TransportError>;
