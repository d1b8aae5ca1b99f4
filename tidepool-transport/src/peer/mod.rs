//! Peer links.
//!
//! A peer link (heavyweight connection) is the single socket between one
//! local endpoint and one remote endpoint. Every logical connection between
//! the two, in either direction, is multiplexed over it.
//!
//! # Lifecycle
//!
//! ```text
//! ┌──────┐  handshake  ┌───────┐  unused / close_link  ┌─────────┐  CloseSocket  ┌────────┐
//! │ Init ├────────────►│ Valid │──────────────────────►│ Closing ├──────────────►│ Closed │
//! └──┬───┘             └───┬───┘◄──────────────────────┴────┬────┘  confirmed   └────────┘
//!    │                     │       CreatedConnection        │
//!    │                     ▼                                │
//!    │                ┌─────────┐                           │
//!    └───────────────►│ Invalid │◄──────────────────────────┘
//!     dial failed     └─────────┘   socket / protocol failure
//! ```
//!
//! # Tasks
//!
//! Each established link runs one reader task, which decodes frames and
//! pushes events into the endpoint queue, and one writer task, the only code
//! that ever writes to the socket. State transitions enqueue their frames
//! inside the same `RefCell` borrow that applies them, so the writer puts
//! frames on the wire in exactly the order the transitions happened.

mod core;
mod state;

pub(crate) use self::core::{Opening, Outbound, Peer, PeerTable, start_link};
pub(crate) use self::state::LinkFailure;
