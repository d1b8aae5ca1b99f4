//! Wire format for link frames.
//!
//! Frame format: `[length:4][checksum:4][kind:1][body:N]`
//!
//! - **length**: total frame size including the header (little-endian u32)
//! - **checksum**: CRC32C of (kind + body)
//! - **kind**: which control message the frame carries
//! - **body**: a little-endian `u32` id, followed by message bytes for
//!   payload frames
//!
//! | kind | message             | body                     |
//! |------|---------------------|--------------------------|
//! | 0    | `CreatedConnection` | `id:u32`                 |
//! | 1    | `CloseConnection`   | `id:u32`                 |
//! | 2    | `CloseSocket`       | `last_recv:u32`          |
//! | 3    | `Payload`           | `id:u32` + message bytes |
//! | 4    | `AcceptedConnection`| `id:u32`                 |
//!
//! A payload frame carries the concatenation of every chunk handed to one
//! `send`, so the receiver sees one message per send regardless of how the
//! bytes were chunked or how the socket split them.

pub mod handshake;

/// Header size: 4 (length) + 4 (checksum) + 1 (kind) = 9 bytes.
pub const HEADER_SIZE: usize = 9;

/// Bytes of a payload frame body taken by the connection id.
const ID_SIZE: usize = 4;

const KIND_CREATED_CONNECTION: u8 = 0;
const KIND_CLOSE_CONNECTION: u8 = 1;
const KIND_CLOSE_SOCKET: u8 = 2;
const KIND_PAYLOAD: u8 = 3;
const KIND_ACCEPTED_CONNECTION: u8 = 4;

/// Wire format error types.
///
/// Every one of them, when hit on a live link, is a protocol violation and
/// invalidates that link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Checksum verification failed.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum from the header.
        expected: u32,
        /// Checksum computed over the received bytes.
        actual: u32,
    },

    /// Frame exceeds the configured maximum.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Frame size in bytes.
        size: usize,
        /// Largest accepted frame.
        max: usize,
    },

    /// Length field is smaller than a header.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },

    /// Kind byte names no known message.
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    /// Body does not have the shape its kind requires.
    #[error("malformed body for frame kind {kind}: {len} bytes")]
    MalformedBody {
        /// Frame kind.
        kind: u8,
        /// Body length found.
        len: usize,
    },

    /// The link handshake did not follow the protocol.
    #[error("bad handshake: {0}")]
    BadHandshake(String),
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The sender opened connection `id` toward the receiver.
    CreatedConnection(u32),
    /// The sender closed its connection `id`.
    CloseConnection(u32),
    /// The sender wants to tear the link down; the value is the highest
    /// connection id it has seen the receiver create.
    CloseSocket(u32),
    /// One message on connection `id`.
    Payload {
        /// Connection the message belongs to.
        id: u32,
        /// Message bytes.
        data: Vec<u8>,
    },
    /// The sender registered connection `id` that the receiver created.
    AcceptedConnection(u32),
}

impl Frame {
    /// Kind byte written on the wire.
    pub fn kind(&self) -> u8 {
        match self {
            Frame::CreatedConnection(_) => KIND_CREATED_CONNECTION,
            Frame::CloseConnection(_) => KIND_CLOSE_CONNECTION,
            Frame::CloseSocket(_) => KIND_CLOSE_SOCKET,
            Frame::Payload { .. } => KIND_PAYLOAD,
            Frame::AcceptedConnection(_) => KIND_ACCEPTED_CONNECTION,
        }
    }

    /// Serialize this frame.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::CreatedConnection(id)
            | Frame::CloseConnection(id)
            | Frame::CloseSocket(id)
            | Frame::AcceptedConnection(id) => seal(self.kind(), &[&id.to_le_bytes()[..]]),
            Frame::Payload { id, data } => {
                seal(KIND_PAYLOAD, &[&id.to_le_bytes()[..], data.as_slice()])
            }
        }
    }
}

/// Largest frame accepted for a given maximum message size.
pub fn max_frame_size(max_message_size: usize) -> usize {
    HEADER_SIZE + ID_SIZE + max_message_size
}

/// Serialize a payload frame from a sequence of chunks.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the chunks add up to more than
/// `max_message_size`.
///
/// # Examples
///
/// ```
/// use tidepool_transport::wire::{Frame, encode_payload, try_decode_frame};
///
/// let bytes = encode_payload(4, &[b"pi", b"ng", b""], 1024).expect("encode");
/// let (frame, consumed) = try_decode_frame(&bytes, 1024)
///     .expect("valid")
///     .expect("complete");
///
/// assert_eq!(consumed, bytes.len());
/// assert_eq!(frame, Frame::Payload { id: 4, data: b"ping".to_vec() });
/// ```
pub fn encode_payload(
    id: u32,
    chunks: &[&[u8]],
    max_message_size: usize,
) -> Result<Vec<u8>, WireError> {
    let size: usize = chunks.iter().map(|chunk| chunk.len()).sum();
    let max_frame = max_frame_size(max_message_size).min(u32::MAX as usize);
    if size > max_message_size || HEADER_SIZE + ID_SIZE + size > max_frame {
        return Err(WireError::FrameTooLarge {
            size: HEADER_SIZE + ID_SIZE + size,
            max: max_frame,
        });
    }

    let id_bytes = id.to_le_bytes();
    let mut parts: Vec<&[u8]> = Vec::with_capacity(chunks.len() + 1);
    parts.push(&id_bytes);
    parts.extend_from_slice(chunks);
    Ok(seal(KIND_PAYLOAD, &parts))
}

/// Write header, kind and body parts into one buffer, then fill in the
/// checksum.
fn seal(kind: u8, parts: &[&[u8]]) -> Vec<u8> {
    let body_len: usize = parts.iter().map(|part| part.len()).sum();
    let total = HEADER_SIZE + body_len;

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u32).to_le_bytes());
    frame.extend_from_slice(&[0u8; 4]);
    frame.push(kind);
    for part in parts {
        frame.extend_from_slice(part);
    }

    let checksum = crc32c::crc32c(&frame[8..]);
    frame[4..8].copy_from_slice(&checksum.to_le_bytes());
    frame
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Try to decode one frame from a buffer that may hold a partial frame.
///
/// # Returns
///
/// - `Ok(Some((frame, consumed)))` if a complete frame was parsed
/// - `Ok(None)` if more data is needed (not an error condition)
/// - `Err` if the data is malformed
pub fn try_decode_frame(
    data: &[u8],
    max_message_size: usize,
) -> Result<Option<(Frame, usize)>, WireError> {
    if data.len() < HEADER_SIZE {
        return Ok(None);
    }

    let length = read_u32(&data[0..4]);
    if (length as usize) < HEADER_SIZE {
        return Err(WireError::InvalidLength { length });
    }
    let max = max_frame_size(max_message_size);
    if length as usize > max {
        return Err(WireError::FrameTooLarge {
            size: length as usize,
            max,
        });
    }

    let length = length as usize;
    if data.len() < length {
        return Ok(None);
    }

    let expected = read_u32(&data[4..8]);
    let actual = crc32c::crc32c(&data[8..length]);
    if expected != actual {
        return Err(WireError::ChecksumMismatch { expected, actual });
    }

    let kind = data[8];
    let body = &data[HEADER_SIZE..length];
    let frame = match kind {
        KIND_CREATED_CONNECTION
        | KIND_CLOSE_CONNECTION
        | KIND_CLOSE_SOCKET
        | KIND_ACCEPTED_CONNECTION => {
            if body.len() != ID_SIZE {
                return Err(WireError::MalformedBody {
                    kind,
                    len: body.len(),
                });
            }
            let id = read_u32(body);
            match kind {
                KIND_CREATED_CONNECTION => Frame::CreatedConnection(id),
                KIND_CLOSE_CONNECTION => Frame::CloseConnection(id),
                KIND_CLOSE_SOCKET => Frame::CloseSocket(id),
                _ => Frame::AcceptedConnection(id),
            }
        }
        KIND_PAYLOAD => {
            if body.len() < ID_SIZE {
                return Err(WireError::MalformedBody {
                    kind,
                    len: body.len(),
                });
            }
            Frame::Payload {
                id: read_u32(body),
                data: body[ID_SIZE..].to_vec(),
            }
        }
        other => return Err(WireError::UnknownKind(other)),
    };

    Ok(Some((frame, length)))
}

/// Reassembles frames from successive socket reads.
///
/// Decoding advances a read offset; consumed bytes are dropped once per
/// [`extend`](FrameReader::extend), so a read holding many small frames
/// costs one compaction.
#[derive(Debug)]
pub struct FrameReader {
    buffer: Vec<u8>,
    start: usize,
    max_message_size: usize,
}

impl FrameReader {
    /// Empty reader enforcing `max_message_size`.
    pub fn new(max_message_size: usize, capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            start: 0,
            max_message_size,
        }
    }

    /// Append bytes read from the socket.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.start > 0 {
            self.buffer.drain(..self.start);
            self.start = 0;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete frame, or `None` until more bytes arrive.
    ///
    /// # Errors
    ///
    /// Every error of [`try_decode_frame`].
    pub fn next_frame(&mut self) -> Result<Option<Frame>, WireError> {
        match try_decode_frame(&self.buffer[self.start..], self.max_message_size)? {
            Some((frame, consumed)) => {
                self.start += consumed;
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.start
    }
}

/// Decode exactly one complete frame.
///
/// # Errors
///
/// `InsufficientData` if `data` holds less than a whole frame, plus every
/// error of [`try_decode_frame`].
pub fn decode_frame(data: &[u8], max_message_size: usize) -> Result<Frame, WireError> {
    match try_decode_frame(data, max_message_size)? {
        Some((frame, _)) => Ok(frame),
        None => {
            let needed = if data.len() < HEADER_SIZE {
                HEADER_SIZE
            } else {
                read_u32(&data[0..4]) as usize
            };
            Err(WireError::InsufficientData {
                needed,
                have: data.len(),
            })
        }
    }
}
