//! # tidepool transport
//!
//! Message-oriented, reliable, ordered transport over stream sockets.
//!
//! A [`Transport`] owns one listening socket and hands out any number of
//! [`Endpoint`]s, each addressed as `host:port:index`. An endpoint opens
//! logical [`Connection`]s to any other endpoint; all connections between
//! one pair of endpoints, in both directions, share a single socket
//! (the *link*). The link is torn down only after both sides agree no
//! connection is left on it.
//!
//! This crate provides:
//! - **Endpoint**: `connect`, `receive`, `close`, with an ordered event queue
//! - **Connection**: one-way message channel, `send` of chunked messages
//! - **Peer links**: connection multiplexing and the closing handshake
//! - **Wire format**: CRC32C-checked frames and the link handshake
//!
//! Everything runs on the current thread: build transports inside a tokio
//! `LocalSet`.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use tidepool_core::{
    FaultPlan, FaultSite, FaultyNetworkProvider, MemoryNetworkProvider, NetworkProvider,
    Providers, TaskProvider, TcpListenerTrait, TimeProvider, TokioNetworkProvider,
    TokioProviders, TokioTaskProvider, TokioTimeProvider,
};

// =============================================================================
// Modules
// =============================================================================

mod address;
mod config;
mod connection;
mod endpoint;
mod error;
mod event;
mod peer;
mod transport;

/// Frame and handshake codecs.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use address::{AddressParseError, EndPointAddress};
pub use config::{ConnectHints, TransportConfig};
pub use connection::{Connection, ConnectionState};
pub use endpoint::Endpoint;
pub use error::{
    ConnectError, EventError, EventErrorKind, SendError, TransportError, TransportResult,
};
pub use event::{ConnectionId, Event, Reliability};
pub use transport::Transport;
pub use wire::{HEADER_SIZE, WireError};
