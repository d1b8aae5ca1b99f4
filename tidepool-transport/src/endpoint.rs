//! Endpoints: addressable event queues owning their peer links.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::connection::{Connection, Loopback};
use crate::peer::{LinkFailure, Opening, Outbound, Peer, PeerTable, start_link};
use crate::transport::TransportShared;
use crate::wire::handshake::{HandshakeRequest, HandshakeResponse};
use crate::{
    ConnectError, ConnectHints, EndPointAddress, Event, NetworkProvider, Providers, Reliability,
    TaskProvider, TimeProvider, TransportConfig,
};

/// One addressable endpoint of a [`Transport`](crate::Transport).
///
/// Outgoing traffic goes through the [`Connection`] handles returned by
/// [`connect`](Endpoint::connect). Everything that happens to incoming
/// connections, plus link failures, arrives through
/// [`receive`](Endpoint::receive).
///
/// Dropping the endpoint closes it.
pub struct Endpoint<P: Providers> {
    shared: Rc<EndpointShared<P>>,
    events: mpsc::UnboundedReceiver<Event>,
    finished: bool,
}

impl<P: Providers> Endpoint<P> {
    pub(crate) fn new(
        shared: Rc<EndpointShared<P>>,
        events: mpsc::UnboundedReceiver<Event>,
    ) -> Self {
        Self {
            shared,
            events,
            finished: false,
        }
    }

    /// Address other endpoints use to reach this one.
    pub fn address(&self) -> &EndPointAddress {
        &self.shared.address
    }

    /// Open a logical connection to `remote`.
    ///
    /// Reuses the link to `remote` if one exists, dials one otherwise. The
    /// returned connection is `Open`: its `CreatedConnection` is already on
    /// the socket. Connecting to [`address`](Endpoint::address) itself gives
    /// a loopback connection.
    ///
    /// Every reliability is served as [`Reliability::ReliableOrdered`].
    pub async fn connect(
        &self,
        remote: &EndPointAddress,
        reliability: Reliability,
        hints: ConnectHints,
    ) -> Result<Connection, ConnectError> {
        self.shared.connect(remote, reliability, hints).await
    }

    /// Next event, in arrival order.
    ///
    /// Once [`Event::EndPointClosed`] has been returned, every later call
    /// returns it again immediately.
    pub async fn receive(&mut self) -> Event {
        if self.finished {
            return Event::EndPointClosed;
        }
        match self.events.recv().await {
            Some(Event::EndPointClosed) | None => {
                self.finished = true;
                Event::EndPointClosed
            }
            Some(event) => event,
        }
    }

    /// Next event if one is already queued.
    pub fn try_receive(&mut self) -> Option<Event> {
        if self.finished {
            return Some(Event::EndPointClosed);
        }
        match self.events.try_recv() {
            Ok(Event::EndPointClosed) | Err(mpsc::error::TryRecvError::Disconnected) => {
                self.finished = true;
                Some(Event::EndPointClosed)
            }
            Ok(event) => Some(event),
            Err(mpsc::error::TryRecvError::Empty) => None,
        }
    }

    /// Close the endpoint and every link it owns.
    ///
    /// Outgoing connections are closed on the wire before the sockets go
    /// away. A pending or later `receive` returns [`Event::EndPointClosed`].
    pub fn close(&self) {
        self.shared.close();
    }

    /// Close every outgoing connection to `remote` and let the link shut
    /// down once the remote has no connection open toward us either.
    ///
    /// Does nothing if there is no link to `remote`.
    pub fn close_link(&self, remote: &EndPointAddress) {
        let peer = self.shared.peers.borrow().get(remote).cloned();
        if let Some(peer) = peer {
            tracing::debug!("Endpoint::close_link {} -> {}", self.shared.address, remote);
            peer.close_all_outgoing();
        }
    }

    /// Number of established links (`Valid` or `Closing`).
    pub fn link_count(&self) -> usize {
        self.shared
            .peers
            .borrow()
            .values()
            .filter(|peer| peer.is_live())
            .count()
    }

    /// Whether [`close`](Endpoint::close) has run.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.get()
    }
}

impl<P: Providers> Drop for Endpoint<P> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl<P: Providers> std::fmt::Debug for Endpoint<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.shared.address)
            .field("closed", &self.shared.closed.get())
            .field("links", &self.shared.peers.borrow().len())
            .finish()
    }
}

/// Endpoint state shared with its transport and background tasks.
pub(crate) struct EndpointShared<P: Providers> {
    address: EndPointAddress,
    providers: P,
    config: TransportConfig,
    peers: Rc<RefCell<PeerTable>>,
    next_seq: Cell<u32>,
    events: mpsc::UnboundedSender<Event>,
    loopback: Rc<Loopback>,
    closed: Cell<bool>,
    transport: Weak<TransportShared<P>>,
}

impl<P: Providers> EndpointShared<P> {
    pub(crate) fn new(
        address: EndPointAddress,
        providers: P,
        config: TransportConfig,
        transport: Weak<TransportShared<P>>,
    ) -> (Rc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let loopback = Rc::new(Loopback::new(
            address.clone(),
            config.max_message_size,
            events.clone(),
        ));
        let shared = Rc::new(Self {
            address,
            providers,
            config,
            peers: Rc::new(RefCell::new(PeerTable::new())),
            next_seq: Cell::new(1),
            events,
            loopback,
            closed: Cell::new(false),
            transport,
        });
        (shared, receiver)
    }

    pub(crate) fn address(&self) -> &EndPointAddress {
        &self.address
    }

    async fn connect(
        &self,
        remote: &EndPointAddress,
        reliability: Reliability,
        hints: ConnectHints,
    ) -> Result<Connection, ConnectError> {
        if self.closed.get() {
            return Err(ConnectError::EndpointClosed);
        }
        tracing::debug!(
            "Endpoint::connect {} -> {} ({:?})",
            self.address,
            remote,
            reliability
        );
        if remote == &self.address {
            return self.loopback.open();
        }

        let limit = hints.timeout.unwrap_or(self.config.connect_timeout);
        match self
            .providers
            .time()
            .timeout(limit, self.connect_link(remote))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!("Endpoint::connect {} -> {} timed out", self.address, remote);
                Err(ConnectError::Timeout)
            }
        }
    }

    async fn connect_link(&self, remote: &EndPointAddress) -> Result<Connection, ConnectError> {
        let mut peer = self.peer_for(remote);
        loop {
            if self.closed.get() {
                return Err(ConnectError::EndpointClosed);
            }
            let changed = peer.changed();
            match peer.open_outgoing() {
                Opening::Allocated { id, accepted } => {
                    let connection = Connection::over_link(peer.clone(), id);
                    return match accepted.await {
                        Ok(()) => {
                            connection.mark_open();
                            Ok(connection)
                        }
                        Err(_) if self.closed.get() => Err(ConnectError::EndpointClosed),
                        Err(_) => Err(peer.failure().to_connect_error()),
                    };
                }
                Opening::Wait => changed.await,
                Opening::Retry => {
                    drop(changed);
                    peer.detach();
                    peer = self.peer_for(remote);
                }
                Opening::Failed(failure) => return Err(failure.to_connect_error()),
            }
        }
    }

    /// Link to `remote`, dialing a new one if there is none.
    fn peer_for(&self, remote: &EndPointAddress) -> Rc<Peer> {
        let existing = self.peers.borrow().get(remote).cloned();
        if let Some(peer) = existing {
            return peer;
        }

        let peer = self.new_peer(remote);
        let dial = dial(
            self.providers.clone(),
            self.config.clone(),
            self.address.clone(),
            peer.clone(),
        );
        let handle = self.providers.task().spawn_task("link_dial", dial);
        peer.track_dial(handle);
        peer
    }

    /// Fresh `Init` link to `remote`, registered in the table.
    fn new_peer(&self, remote: &EndPointAddress) -> Rc<Peer> {
        let in_use: BTreeSet<u32> = self.peers.borrow().values().map(|p| p.seq()).collect();
        let seq = free_seq(self.next_seq.get(), &in_use);
        self.next_seq.set(seq.wrapping_add(1));
        let peer = Peer::new(
            self.address.clone(),
            remote.clone(),
            seq,
            self.config.max_message_size,
            self.events.clone(),
            Rc::downgrade(&self.peers),
        );
        self.peers.borrow_mut().insert(remote.clone(), peer.clone());
        peer
    }

    /// Decide what to do with a link dialed by `source`, which numbered it
    /// `link_seq`.
    ///
    /// On success the returned link is already `Valid` and its frames go to
    /// the returned queue. The caller still has to send `Accepted` and
    /// start the link tasks.
    pub(crate) fn accept_link(
        &self,
        source: &EndPointAddress,
        link_seq: u32,
    ) -> Result<(Rc<Peer>, mpsc::UnboundedReceiver<Outbound>), HandshakeResponse> {
        if self.closed.get() || source == &self.address {
            return Err(HandshakeResponse::Refused);
        }

        let existing = self.peers.borrow().get(source).cloned();
        let peer = match existing {
            // Both sides dialed. The dial from the smaller address wins.
            Some(peer) if peer.is_init() => {
                if source < &self.address {
                    tracing::debug!(
                        "Endpoint::accept_link {} <- {}: crossed dial won by remote",
                        self.address,
                        source
                    );
                    peer
                } else {
                    return Err(HandshakeResponse::Crossed);
                }
            }
            Some(peer) if peer.is_closing() => {
                peer.retire();
                self.new_peer(source)
            }
            // The remote's own dial for the link we already share with it.
            Some(peer) if peer.is_live() && peer.remote_seq() == Some(link_seq) => {
                return Err(HandshakeResponse::Crossed);
            }
            Some(peer) if peer.is_live() => {
                tracing::debug!(
                    "Endpoint::accept_link {} <- {}: replacing link #{}",
                    self.address,
                    source,
                    peer.seq()
                );
                peer.fail(LinkFailure::Lost("remote reconnected".to_string()));
                self.new_peer(source)
            }
            _ => self.new_peer(source),
        };

        let (writer, outbound) = mpsc::unbounded_channel();
        if !peer.activate(writer, link_seq) {
            return Err(HandshakeResponse::Refused);
        }
        Ok((peer, outbound))
    }

    pub(crate) fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        tracing::debug!("Endpoint::close {}", self.address);

        let peers = std::mem::take(&mut *self.peers.borrow_mut());
        for peer in peers.values() {
            peer.shutdown();
        }
        self.loopback.shutdown();
        let _ = self.events.send(Event::EndPointClosed);

        if let Some(transport) = self.transport.upgrade() {
            transport.deregister(self.address.index());
        }
    }
}

/// Dial `peer`'s remote, run the handshake and bring the link up.
async fn dial<P: Providers>(
    providers: P,
    config: TransportConfig,
    local: EndPointAddress,
    peer: Rc<Peer>,
) {
    let remote = peer.remote().clone();
    let request = HandshakeRequest {
        source: local,
        target_index: remote.index(),
        link_seq: peer.seq(),
    }
    .encode();
    let network = providers.network().clone();

    let attempt = async {
        let mut stream = network
            .connect(remote.transport_address())
            .await
            .map_err(|e| format!("connect to {} failed: {}", remote.transport_address(), e))?;
        stream
            .write_all(&request)
            .await
            .map_err(|e| format!("handshake write failed: {}", e))?;
        stream
            .flush()
            .await
            .map_err(|e| format!("handshake write failed: {}", e))?;
        let response = HandshakeResponse::read_from(&mut stream)
            .await
            .map_err(|e| format!("handshake failed: {}", e))?;
        Ok::<_, String>((stream, response))
    };

    let (stream, response) = match providers
        .time()
        .timeout(config.handshake_timeout, attempt)
        .await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(detail)) => {
            peer.fail(LinkFailure::Unreachable(detail));
            return;
        }
        Err(_) => {
            peer.fail(LinkFailure::Unreachable("handshake timed out".to_string()));
            return;
        }
    };

    match response {
        HandshakeResponse::Accepted { link_seq } => {
            let (writer, outbound) = mpsc::unbounded_channel();
            if peer.activate(writer, link_seq) {
                start_link(
                    providers.task(),
                    &peer,
                    stream,
                    outbound,
                    config.read_buffer_size,
                );
            } else {
                tracing::debug!("dial {}: link already {}", remote, peer.state_name());
            }
        }
        HandshakeResponse::Refused => {
            peer.fail(LinkFailure::Refused(format!("{} refused the link", remote)));
        }
        HandshakeResponse::Crossed => {
            drop(stream);
            tracing::debug!("dial {}: crossed, waiting for the remote's dial", remote);
            let _ = providers
                .time()
                .timeout(config.connect_timeout, peer.wait_while_init())
                .await;
            if peer.is_init() {
                peer.fail(LinkFailure::Crossed);
            }
        }
    }
}

/// First sequence number from `candidate` on that is neither 0 nor held by
/// a link in `in_use`.
fn free_seq(mut candidate: u32, in_use: &BTreeSet<u32>) -> u32 {
    while candidate == 0 || in_use.contains(&candidate) {
        candidate = candidate.wrapping_add(1);
    }
    candidate
}
