//! Events delivered to an endpoint.

use std::fmt;

use crate::{EndPointAddress, EventError};

/// Endpoint-unique id of an incoming logical connection.
///
/// Link-local ids restart at 1 on every new link, so the id reported in
/// events also carries the link's sequence number within the endpoint:
/// `(link_seq << 32) | link_local_id`. Sequence 0 is used for connections
/// an endpoint opens to itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Build the id of connection `local_id` on link `link_seq`.
    pub const fn new(link_seq: u32, local_id: u32) -> Self {
        Self(((link_seq as u64) << 32) | local_id as u64)
    }

    /// Sequence number of the link the connection runs over.
    pub const fn link_seq(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Id of the connection within its link.
    pub const fn local_id(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.link_seq(), self.local_id())
    }
}

/// Delivery requirement passed to `connect`.
///
/// A stream socket satisfies every hint, so connections always come up
/// reliable and ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Reliability {
    /// Reliable, in-order delivery.
    #[default]
    ReliableOrdered,
    /// Reliable delivery, order not required.
    ReliableUnordered,
    /// Best effort.
    Unreliable,
}

/// Something that happened on an endpoint, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A remote endpoint (or this one) opened a connection to us.
    ConnectionOpened {
        /// Id used by later events about this connection.
        id: ConnectionId,
        /// Delivery guarantee of the connection.
        reliability: Reliability,
        /// Endpoint that opened it.
        remote: EndPointAddress,
    },

    /// An incoming connection was closed.
    ConnectionClosed(ConnectionId),

    /// One `send` on an incoming connection, chunks concatenated.
    Received {
        /// Connection the message arrived on.
        id: ConnectionId,
        /// Message bytes.
        payload: Vec<u8>,
    },

    /// A link failed outside of any call.
    ConnectionError(EventError),

    /// The endpoint was closed. Repeated on every later `receive`.
    EndPointClosed,
}
