//! Endpoint addressing.
//!
//! An [`EndPointAddress`] is `host:port:index`: the listening address of the
//! transport that owns the endpoint, plus the endpoint's index inside that
//! transport. Addresses compare lexicographically on their textual form; the
//! crossed-dial tie-break relies on that order being total and identical on
//! both sides of a link.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error parsing an [`EndPointAddress`] from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressParseError {
    /// No `:index` suffix was found.
    #[error("missing endpoint index in {0:?}")]
    MissingIndex(String),

    /// The index suffix is not a `u32`.
    #[error("invalid endpoint index in {0:?}")]
    InvalidIndex(String),

    /// The part before the index is not `host:port`.
    #[error("invalid transport address in {0:?}")]
    InvalidTransportAddress(String),
}

/// Stable address of one endpoint.
///
/// ```
/// use tidepool_transport::EndPointAddress;
///
/// let addr: EndPointAddress = "127.0.0.1:4500:3".parse().expect("valid address");
/// assert_eq!(addr.transport_address(), "127.0.0.1:4500");
/// assert_eq!(addr.index(), 3);
/// assert_eq!(addr.to_string(), "127.0.0.1:4500:3");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndPointAddress {
    // Ord is derived: `text` comes first and determines `index`.
    text: String,
    index: u32,
}

impl EndPointAddress {
    /// Address of endpoint `index` on the transport listening at `transport`.
    pub fn new(transport: &str, index: u32) -> Self {
        Self {
            text: format!("{}:{}", transport, index),
            index,
        }
    }

    /// The `host:port` a dialer connects to.
    pub fn transport_address(&self) -> &str {
        match self.text.rsplit_once(':') {
            Some((transport, _)) => transport,
            None => &self.text,
        }
    }

    /// Index of the endpoint inside its transport.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Textual form, as sent in the link handshake.
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for EndPointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for EndPointAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (transport, index) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressParseError::MissingIndex(s.to_string()))?;
        let index: u32 = index
            .parse()
            .map_err(|_| AddressParseError::InvalidIndex(s.to_string()))?;

        match transport.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => return Err(AddressParseError::InvalidTransportAddress(s.to_string())),
        }

        Ok(Self::new(transport, index))
    }
}

impl TryFrom<String> for EndPointAddress {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EndPointAddress> for String {
    fn from(address: EndPointAddress) -> Self {
        address.text
    }
}
