//! Logical connections.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;
use tokio::sync::mpsc;

use crate::peer::Peer;
use crate::{ConnectError, ConnectionId, EndPointAddress, Event, Reliability, SendError};

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Announced to the remote, not yet acknowledged by it.
    Requested,
    /// Usable.
    Open,
    /// Closed locally, or its link is gone.
    Closed,
}

enum Route {
    Link(Rc<Peer>),
    Loopback(Rc<Loopback>),
}

/// Sending half of one logical connection.
///
/// Messages flow one way, from the endpoint that called `connect` to the
/// remote endpoint, which sees them as [`Event::Received`]. Dropping the
/// handle closes the connection.
pub struct Connection {
    route: Route,
    id: u32,
    remote: EndPointAddress,
    state: Cell<ConnectionState>,
}

impl Connection {
    pub(crate) fn over_link(peer: Rc<Peer>, id: u32) -> Self {
        let remote = peer.remote().clone();
        Self {
            route: Route::Link(peer),
            id,
            remote,
            state: Cell::new(ConnectionState::Requested),
        }
    }

    pub(crate) fn mark_open(&self) {
        if self.state.get() == ConnectionState::Requested {
            self.state.set(ConnectionState::Open);
        }
    }

    /// Id of this connection within its link.
    ///
    /// Ids on one link strictly increase and are never reused.
    pub fn local_id(&self) -> u32 {
        self.id
    }

    /// Endpoint the connection leads to.
    pub fn remote(&self) -> &EndPointAddress {
        &self.remote
    }

    /// Current state.
    ///
    /// An open connection reads as `Closed` once its link has dropped it,
    /// through `close_link`, endpoint shutdown or a link failure.
    pub fn state(&self) -> ConnectionState {
        let state = self.state.get();
        match &self.route {
            Route::Link(peer)
                if state == ConnectionState::Open && peer.check_outgoing(self.id).is_err() =>
            {
                ConnectionState::Closed
            }
            _ => state,
        }
    }

    /// Delivery guarantee of the connection.
    pub fn reliability(&self) -> Reliability {
        Reliability::ReliableOrdered
    }

    /// Send one message made of `chunks`.
    ///
    /// The remote receives a single [`Event::Received`] holding the
    /// concatenation of the chunks. Returns once the message is on the
    /// socket.
    pub async fn send(&self, chunks: &[&[u8]]) -> Result<(), SendError> {
        if self.state.get() == ConnectionState::Closed {
            return Err(SendError::ConnectionClosed);
        }

        match &self.route {
            Route::Link(peer) => {
                let ack = peer.send(self.id, chunks)?;
                match ack.await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(detail)) => Err(SendError::LinkBroken(detail)),
                    Err(_) => Err(match peer.check_outgoing(self.id) {
                        Err(e) => e,
                        Ok(()) => SendError::LinkBroken("link writer stopped".to_string()),
                    }),
                }
            }
            Route::Loopback(loopback) => loopback.send(self.id, chunks),
        }
    }

    /// Close the connection. Closing twice is a no-op.
    pub fn close(&self) {
        if self.state.replace(ConnectionState::Closed) == ConnectionState::Closed {
            return;
        }
        match &self.route {
            Route::Link(peer) => peer.close_outgoing(self.id),
            Route::Loopback(loopback) => loopback.close(self.id),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let route = match &self.route {
            Route::Link(peer) => format!("link #{}", peer.seq()),
            Route::Loopback(_) => "loopback".to_string(),
        };
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .field("id", &self.id)
            .field("route", &route)
            .field("state", &self.state.get())
            .finish()
    }
}

#[derive(Default)]
struct LoopbackState {
    last_id: u32,
    open: BTreeSet<u32>,
    closed: bool,
}

/// Connections from an endpoint to itself. They never touch a socket.
pub(crate) struct Loopback {
    address: EndPointAddress,
    max_message_size: usize,
    events: mpsc::UnboundedSender<Event>,
    state: RefCell<LoopbackState>,
}

impl Loopback {
    pub(crate) fn new(
        address: EndPointAddress,
        max_message_size: usize,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            address,
            max_message_size,
            events,
            state: RefCell::new(LoopbackState::default()),
        }
    }

    pub(crate) fn open(self: &Rc<Self>) -> Result<Connection, ConnectError> {
        let id = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Err(ConnectError::EndpointClosed);
            }
            let id = state.last_id.checked_add(1).ok_or_else(|| {
                ConnectError::AddressUnreachable("loopback connection ids exhausted".to_string())
            })?;
            state.last_id = id;
            state.open.insert(id);
            id
        };

        let _ = self.events.send(Event::ConnectionOpened {
            id: ConnectionId::new(0, id),
            reliability: Reliability::ReliableOrdered,
            remote: self.address.clone(),
        });
        Ok(Connection {
            route: Route::Loopback(self.clone()),
            id,
            remote: self.address.clone(),
            state: Cell::new(ConnectionState::Open),
        })
    }

    fn send(&self, id: u32, chunks: &[&[u8]]) -> Result<(), SendError> {
        let size: usize = chunks.iter().map(|chunk| chunk.len()).sum();
        if size > self.max_message_size {
            return Err(SendError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        {
            let state = self.state.borrow();
            if state.closed || !state.open.contains(&id) {
                return Err(SendError::ConnectionClosed);
            }
        }
        let _ = self.events.send(Event::Received {
            id: ConnectionId::new(0, id),
            payload: chunks.concat(),
        });
        Ok(())
    }

    fn close(&self, id: u32) {
        let was_open = {
            let mut state = self.state.borrow_mut();
            state.open.remove(&id) && !state.closed
        };
        if was_open {
            let _ = self.events.send(Event::ConnectionClosed(ConnectionId::new(0, id)));
        }
    }

    /// The endpoint is closing; every loopback connection is gone.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.borrow_mut();
        state.closed = true;
        state.open.clear();
    }
}
