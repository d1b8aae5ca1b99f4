//! Link handshake.
//!
//! The dialer opens a socket and writes one request:
//!
//! `[magic:4][version:4][addr_len:4][source address:addr_len][target index:4][link seq:4]`
//!
//! The acceptor answers with a little-endian `u32` code
//! ([`HandshakeResponse`]), followed by its own link sequence number when
//! the code is `Accepted`. Frames only flow once the answer is `Accepted`.
//!
//! Each side remembers the other's sequence number for the link. A dial
//! carrying the number of a live link is the remote's crossed dial for that
//! same link; any other number means the remote started over.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::WireError;
use crate::EndPointAddress;

/// First word of every handshake request.
pub const MAGIC: u32 = 0x5444_504c;

/// Protocol version spoken by this crate.
pub const VERSION: u32 = 2;

/// Longest source address accepted in a request.
pub const MAX_ADDRESS_LEN: u32 = 1024;

/// Failure while reading a handshake message.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The socket failed or closed mid-handshake.
    #[error("handshake i/o: {0}")]
    Io(#[from] io::Error),

    /// The bytes read do not form a valid handshake.
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Request written by the dialing side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Address of the dialing endpoint.
    pub source: EndPointAddress,
    /// Index of the endpoint being dialed inside the remote transport.
    pub target_index: u32,
    /// The dialer's sequence number for the link.
    pub link_seq: u32,
}

impl HandshakeRequest {
    /// Serialize the request.
    pub fn encode(&self) -> Vec<u8> {
        let address = self.source.as_str().as_bytes();
        let mut buf = Vec::with_capacity(20 + address.len());
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&(address.len() as u32).to_le_bytes());
        buf.extend_from_slice(address);
        buf.extend_from_slice(&self.target_index.to_le_bytes());
        buf.extend_from_slice(&self.link_seq.to_le_bytes());
        buf
    }

    /// Read one request from `reader`.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, HandshakeError>
    where
        R: AsyncRead + Unpin,
    {
        let magic = reader.read_u32_le().await?;
        if magic != MAGIC {
            return Err(WireError::BadHandshake(format!("bad magic {:#010x}", magic)).into());
        }
        let version = reader.read_u32_le().await?;
        if version != VERSION {
            let detail = format!("unsupported version {}", version);
            return Err(WireError::BadHandshake(detail).into());
        }

        let len = reader.read_u32_le().await?;
        if len > MAX_ADDRESS_LEN {
            return Err(WireError::BadHandshake(format!("address length {}", len)).into());
        }
        let mut address = vec![0u8; len as usize];
        reader.read_exact(&mut address).await?;
        let address = String::from_utf8(address)
            .map_err(|_| WireError::BadHandshake("address is not utf-8".to_string()))?;
        let source = address
            .parse::<EndPointAddress>()
            .map_err(|e| WireError::BadHandshake(format!("{}", e)))?;

        let target_index = reader.read_u32_le().await?;
        let link_seq = reader.read_u32_le().await?;
        Ok(Self {
            source,
            target_index,
            link_seq,
        })
    }
}

/// Acceptor's answer to a [`HandshakeRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeResponse {
    /// The socket becomes the link between the two endpoints.
    Accepted {
        /// The acceptor's sequence number for the link.
        link_seq: u32,
    },
    /// No such endpoint, or it is closed.
    Refused,
    /// Both sides dialed each other and this dial lost the tie-break. The
    /// link will run over the other socket.
    Crossed,
}

impl HandshakeResponse {
    /// Serialize the response.
    pub fn encode(self) -> Vec<u8> {
        match self {
            HandshakeResponse::Accepted { link_seq } => {
                let mut buf = Vec::with_capacity(8);
                buf.extend_from_slice(&0u32.to_le_bytes());
                buf.extend_from_slice(&link_seq.to_le_bytes());
                buf
            }
            HandshakeResponse::Refused => 1u32.to_le_bytes().to_vec(),
            HandshakeResponse::Crossed => 2u32.to_le_bytes().to_vec(),
        }
    }

    /// Read one response from `reader`.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, HandshakeError>
    where
        R: AsyncRead + Unpin,
    {
        match reader.read_u32_le().await? {
            0 => Ok(HandshakeResponse::Accepted {
                link_seq: reader.read_u32_le().await?,
            }),
            1 => Ok(HandshakeResponse::Refused),
            2 => Ok(HandshakeResponse::Crossed),
            other => {
                Err(WireError::BadHandshake(format!("unknown response code {}", other)).into())
            }
        }
    }
}
