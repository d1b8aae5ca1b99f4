//! Link state machine.
//!
//! Pure bookkeeping: no sockets, no tasks, no events queue. Every method
//! applies one transition and returns the [`Effects`] the caller must carry
//! out (frames to write, events to emit). The caller applies a transition
//! and enqueues its frames inside one `RefCell` borrow, which is what makes
//! transitions atomic and fixes the wire order of their frames.
//!
//! ```text
//!            activate            last conn closed /        CloseSocket(x),
//!   Init ───────────────▶ Valid ──────────────────▶ Closing ─────────────▶ Closed
//!     │                    │  ▲    close_link            │    x == last_sent
//!     │                    │  └──────────────────────────┘
//!     │                    │     CreatedConnection
//!     ▼                    ▼
//!  Invalid ◀──────── socket failure / protocol violation
//! ```

use std::collections::BTreeSet;
use thiserror::Error;

use crate::{ConnectError, SendError};
use crate::wire::Frame;

/// Why a link ended up `Invalid`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum LinkFailure {
    /// The dial or its handshake failed.
    #[error("unreachable: {0}")]
    Unreachable(String),
    /// The remote transport refused the handshake.
    #[error("refused: {0}")]
    Refused(String),
    /// Our dial lost a crossed-dial tie-break and the winning dial never
    /// arrived.
    #[error("crossed dial was never completed by the remote")]
    Crossed,
    /// An established link failed.
    #[error("{0}")]
    Lost(String),
}

impl LinkFailure {
    /// What a `connect` waiting on this link reports.
    pub fn to_connect_error(&self) -> ConnectError {
        match self {
            LinkFailure::Unreachable(detail) | LinkFailure::Lost(detail) => {
                ConnectError::AddressUnreachable(detail.clone())
            }
            LinkFailure::Refused(detail) => ConnectError::HandshakeRefused(detail.clone()),
            LinkFailure::Crossed => ConnectError::Timeout,
        }
    }
}

/// A frame that no well-behaved peer can send in the current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("protocol violation: {0}")]
pub(crate) struct ProtocolViolation(pub String);

/// Counters and connection sets of one live link.
///
/// Scoped to one link instance: a new socket always starts from a fresh
/// book, which is what keeps the `CloseSocket` comparison meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct LinkBook {
    /// Highest id created locally.
    pub last_sent: u32,
    /// Highest id the remote was seen creating.
    pub last_recv: u32,
    /// Open connections created locally.
    pub outgoing: BTreeSet<u32>,
    /// Open connections created by the remote.
    pub incoming: BTreeSet<u32>,
}

impl LinkBook {
    fn is_unused(&self) -> bool {
        self.outgoing.is_empty() && self.incoming.is_empty()
    }
}

/// Side effects of one transition.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Effects {
    /// Frames to write, in order.
    pub frames: Vec<Frame>,
    /// Shut the write side down after the frames.
    pub shutdown: bool,
    /// Incoming connection that was opened.
    pub opened: Option<u32>,
    /// Outgoing connection the remote acknowledged.
    pub accepted: Option<u32>,
    /// Incoming connections that were closed.
    pub closed: Vec<u32>,
    /// Message received on an incoming connection.
    pub received: Option<(u32, Vec<u8>)>,
    /// The link reached `Closed`; the reader stops.
    pub finished: bool,
}

/// Outcome of trying to open an outgoing connection.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Open {
    /// Connection `id` is registered; announce it with `CreatedConnection`.
    Allocated(u32),
    /// The link is being established or torn down; wait for the next change.
    Wait,
    /// The link is closed; look it up again, a new one will be created.
    Retry,
    /// The link failed.
    Failed(LinkFailure),
}

/// State of one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PeerState {
    /// Dial or handshake in progress.
    Init,
    /// Socket established, connections multiplexed.
    Valid(LinkBook),
    /// We sent `CloseSocket` and wait for the remote's answer.
    Closing(LinkBook),
    /// Torn down by agreement or by endpoint close.
    Closed,
    /// Failed; every operation fails from now on.
    Invalid(LinkFailure),
}

impl PeerState {
    /// Short state name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            PeerState::Init => "Init",
            PeerState::Valid(_) => "Valid",
            PeerState::Closing(_) => "Closing",
            PeerState::Closed => "Closed",
            PeerState::Invalid(_) => "Invalid",
        }
    }

    /// Book of a live link.
    pub fn book(&self) -> Option<&LinkBook> {
        match self {
            PeerState::Valid(book) | PeerState::Closing(book) => Some(book),
            _ => None,
        }
    }

    /// `Init → Valid` with a fresh book. False in any other state.
    pub fn activate(&mut self) -> bool {
        if matches!(self, PeerState::Init) {
            *self = PeerState::Valid(LinkBook::default());
            true
        } else {
            false
        }
    }

    /// Allocate and register a new outgoing connection.
    pub fn open_outgoing(&mut self) -> Open {
        match self {
            PeerState::Valid(book) => match book.last_sent.checked_add(1) {
                Some(id) => {
                    book.last_sent = id;
                    book.outgoing.insert(id);
                    Open::Allocated(id)
                }
                None => Open::Failed(LinkFailure::Lost("connection ids exhausted".to_string())),
            },
            PeerState::Init | PeerState::Closing(_) => Open::Wait,
            PeerState::Closed => Open::Retry,
            PeerState::Invalid(failure) => Open::Failed(failure.clone()),
        }
    }

    /// Whether `send` may use outgoing connection `id`.
    pub fn check_outgoing(&self, id: u32) -> Result<(), SendError> {
        match self {
            PeerState::Valid(book) if book.outgoing.contains(&id) => Ok(()),
            PeerState::Invalid(failure) => Err(SendError::LinkBroken(failure.to_string())),
            _ => Err(SendError::ConnectionClosed),
        }
    }

    /// Close outgoing connection `id`, then start the closing handshake if
    /// the link is no longer used. Closing an unknown id does nothing.
    pub fn close_outgoing(&mut self, id: u32) -> Effects {
        let mut effects = Effects::default();
        if let PeerState::Valid(book) = self {
            if book.outgoing.remove(&id) {
                effects.frames.push(Frame::CloseConnection(id));
                self.close_if_unused(&mut effects);
            }
        }
        effects
    }

    /// Close every outgoing connection; the link closes once the remote's
    /// connections are gone too.
    pub fn close_all_outgoing(&mut self) -> Effects {
        let mut effects = Effects::default();
        if let PeerState::Valid(book) = self {
            for id in std::mem::take(&mut book.outgoing) {
                effects.frames.push(Frame::CloseConnection(id));
            }
            self.close_if_unused(&mut effects);
        }
        effects
    }

    /// `Valid → Closing` when no connection is open in either direction.
    fn close_if_unused(&mut self, effects: &mut Effects) {
        if let PeerState::Valid(book) = self {
            if book.is_unused() {
                effects.frames.push(Frame::CloseSocket(book.last_recv));
                let book = std::mem::take(book);
                *self = PeerState::Closing(book);
            }
        }
    }

    /// Apply one frame read from the socket.
    pub fn on_frame(&mut self, frame: Frame) -> Result<Effects, ProtocolViolation> {
        let mut effects = Effects::default();

        match frame {
            Frame::CreatedConnection(id) => {
                if let PeerState::Closing(book) = self {
                    // The remote opened a connection before it saw our
                    // CloseSocket; the link is in use again.
                    let book = std::mem::take(book);
                    *self = PeerState::Valid(book);
                }
                let PeerState::Valid(book) = self else {
                    return Ok(effects);
                };
                if id <= book.last_recv {
                    return Err(ProtocolViolation(format!(
                        "created connection {} not above {}",
                        id, book.last_recv
                    )));
                }
                book.last_recv = id;
                book.incoming.insert(id);
                effects.opened = Some(id);
                effects.frames.push(Frame::AcceptedConnection(id));
            }

            Frame::AcceptedConnection(id) => {
                let Some(book) = self.live_book() else {
                    return Ok(effects);
                };
                if id == 0 || id > book.last_sent {
                    return Err(ProtocolViolation(format!(
                        "accept of connection {} never created",
                        id
                    )));
                }
                // Closed locally while the acknowledgement was in flight.
                if book.outgoing.contains(&id) {
                    effects.accepted = Some(id);
                }
            }

            Frame::CloseConnection(id) => {
                let Some(book) = self.live_book() else {
                    return Ok(effects);
                };
                if !book.incoming.remove(&id) {
                    return Err(ProtocolViolation(format!("close of unknown connection {}", id)));
                }
                effects.closed.push(id);
                self.close_if_unused(&mut effects);
            }

            Frame::CloseSocket(believed_last_sent) => match self {
                PeerState::Valid(book) => {
                    // The remote has nothing open toward us any more.
                    effects.closed.extend(std::mem::take(&mut book.incoming));
                    if book.outgoing.is_empty() && believed_last_sent == book.last_sent {
                        self.confirm_close(&mut effects);
                    }
                }
                PeerState::Closing(book) => {
                    if believed_last_sent == book.last_sent {
                        self.confirm_close(&mut effects);
                    }
                }
                _ => {}
            },

            Frame::Payload { id, data } => {
                let Some(book) = self.live_book() else {
                    return Ok(effects);
                };
                if !book.incoming.contains(&id) {
                    return Err(ProtocolViolation(format!("payload on unknown connection {}", id)));
                }
                effects.received = Some((id, data));
            }
        }

        Ok(effects)
    }

    fn live_book(&mut self) -> Option<&mut LinkBook> {
        match self {
            PeerState::Valid(book) | PeerState::Closing(book) => Some(book),
            _ => None,
        }
    }

    /// Answer with our own `CloseSocket` and release the socket.
    fn confirm_close(&mut self, effects: &mut Effects) {
        if let Some(book) = self.book() {
            effects.frames.push(Frame::CloseSocket(book.last_recv));
            effects.shutdown = true;
            effects.finished = true;
            *self = PeerState::Closed;
        }
    }

    /// Tear the link down because the local endpoint is closing.
    ///
    /// Outgoing connections are closed on the wire and the remote is told
    /// the socket is going away.
    pub fn shutdown(&mut self) -> Effects {
        let mut effects = Effects::default();
        if let Some(book) = self.live_book() {
            for id in std::mem::take(&mut book.outgoing) {
                effects.frames.push(Frame::CloseConnection(id));
            }
            effects.frames.push(Frame::CloseSocket(book.last_recv));
            effects.shutdown = true;
        }
        if !matches!(self, PeerState::Invalid(_)) {
            *self = PeerState::Closed;
            effects.finished = true;
        }
        effects
    }

    /// Move to `Invalid`.
    ///
    /// Returns the incoming connections that were still open if the link
    /// was established, `None` if it never was or had already ended.
    pub fn invalidate(&mut self, failure: LinkFailure) -> Option<Vec<u32>> {
        match self {
            PeerState::Closed | PeerState::Invalid(_) => None,
            PeerState::Init => {
                *self = PeerState::Invalid(failure);
                None
            }
            PeerState::Valid(book) | PeerState::Closing(book) => {
                let incoming: Vec<u32> = std::mem::take(&mut book.incoming).into_iter().collect();
                *self = PeerState::Invalid(failure);
                Some(incoming)
            }
        }
    }
}
