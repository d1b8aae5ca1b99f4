//! Transport: the listening socket and the endpoints behind it.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use crate::endpoint::{Endpoint, EndpointShared};
use crate::peer::{LinkFailure, start_link};
use crate::wire::handshake::{HandshakeRequest, HandshakeResponse};
use crate::{
    EndPointAddress, NetworkProvider, Providers, TaskProvider, TcpListenerTrait, TimeProvider,
    TransportConfig, TransportError, TransportResult,
};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// A listening socket shared by any number of endpoints.
///
/// Every endpoint created by [`new_endpoint`](Transport::new_endpoint) gets
/// the address `host:port:index`, where `host:port` is the listener's
/// address. Remote transports dial that listener and name the endpoint they
/// want in the link handshake.
///
/// ```rust,ignore
/// use tidepool_transport::{ConnectHints, Reliability, TokioProviders, Transport, TransportConfig};
///
/// let transport = Transport::new(TokioProviders::new(), TransportConfig::default()).await?;
/// let mut server = transport.new_endpoint()?;
/// let client = transport.new_endpoint()?;
///
/// let conn = client
///     .connect(server.address(), Reliability::ReliableOrdered, ConnectHints::default())
///     .await?;
/// conn.send(&[b"hello"]).await?;
/// let opened = server.receive().await;
/// ```
///
/// Dropping the transport closes it.
pub struct Transport<P: Providers> {
    shared: Rc<TransportShared<P>>,
}

impl<P: Providers> Transport<P> {
    /// Bind `config.bind_address` and start accepting links.
    pub async fn new(providers: P, config: TransportConfig) -> TransportResult<Self> {
        let bind_error = |source| TransportError::Bind {
            address: config.bind_address.clone(),
            source,
        };
        let listener = providers
            .network()
            .bind(&config.bind_address)
            .await
            .map_err(bind_error)?;
        let address = listener.local_addr().map_err(bind_error)?;
        tracing::debug!("Transport::new listening on {}", address);

        let shared = Rc::new(TransportShared {
            providers: providers.clone(),
            config,
            address,
            endpoints: RefCell::new(BTreeMap::new()),
            next_index: Cell::new(0),
            closed: Cell::new(false),
            accept_task: RefCell::new(None),
        });
        let accept = accept_loop(Rc::downgrade(&shared), providers.clone(), listener);
        let handle = providers.task().spawn_task("transport_accept", accept);
        *shared.accept_task.borrow_mut() = Some(handle);

        Ok(Self { shared })
    }

    /// Create an endpoint with a fresh index.
    pub fn new_endpoint(&self) -> TransportResult<Endpoint<P>> {
        let shared = &self.shared;
        if shared.closed.get() {
            return Err(TransportError::Closed);
        }
        let index = shared.next_index.get();
        shared.next_index.set(index.wrapping_add(1));

        let address = EndPointAddress::new(&shared.address, index);
        let (endpoint, events) = EndpointShared::new(
            address,
            shared.providers.clone(),
            shared.config.clone(),
            Rc::downgrade(shared),
        );
        tracing::debug!("Transport::new_endpoint {}", endpoint.address());
        shared.endpoints.borrow_mut().insert(index, endpoint.clone());
        Ok(Endpoint::new(endpoint, events))
    }

    /// Address of the listening socket.
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Number of endpoints not yet closed.
    pub fn endpoint_count(&self) -> usize {
        self.shared.endpoints.borrow().len()
    }

    /// Whether [`close`](Transport::close) has run.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.get()
    }

    /// Stop listening and close every endpoint.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl<P: Providers> Drop for Transport<P> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Transport state reachable from endpoints and the accept tasks.
pub(crate) struct TransportShared<P: Providers> {
    providers: P,
    config: TransportConfig,
    address: String,
    endpoints: RefCell<BTreeMap<u32, Rc<EndpointShared<P>>>>,
    next_index: Cell<u32>,
    closed: Cell<bool>,
    accept_task: RefCell<Option<JoinHandle<()>>>,
}

impl<P: Providers> TransportShared<P> {
    fn endpoint(&self, index: u32) -> Option<Rc<EndpointShared<P>>> {
        self.endpoints.borrow().get(&index).cloned()
    }

    pub(crate) fn deregister(&self, index: u32) {
        self.endpoints.borrow_mut().remove(&index);
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        tracing::debug!("Transport::close {}", self.address);
        if let Some(handle) = self.accept_task.borrow_mut().take() {
            handle.abort();
        }
        let endpoints = std::mem::take(&mut *self.endpoints.borrow_mut());
        for endpoint in endpoints.values() {
            endpoint.close();
        }
    }
}

async fn accept_loop<P: Providers>(
    transport: Weak<TransportShared<P>>,
    providers: P,
    listener: <P::Network as NetworkProvider>::TcpListener,
) {
    loop {
        let accepted = listener.accept().await;
        if transport.strong_count() == 0 {
            return;
        }
        match accepted {
            Ok((stream, from)) => {
                tracing::trace!("accept_loop: socket from {}", from);
                let handshake = accept_link(transport.clone(), providers.clone(), stream);
                let _ = providers.task().spawn_task("link_accept", handshake);
            }
            Err(e) => {
                tracing::warn!("accept_loop: accept failed: {}", e);
                providers.time().sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Read the handshake on an accepted socket and hand it to the endpoint
/// it names.
async fn accept_link<P: Providers>(
    transport: Weak<TransportShared<P>>,
    providers: P,
    mut stream: <P::Network as NetworkProvider>::TcpStream,
) {
    let Some((handshake_timeout, read_buffer_size)) = transport
        .upgrade()
        .map(|t| (t.config.handshake_timeout, t.config.read_buffer_size))
    else {
        return;
    };

    let request = match providers
        .time()
        .timeout(handshake_timeout, HandshakeRequest::read_from(&mut stream))
        .await
    {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            tracing::warn!("accept_link: bad handshake: {}", e);
            return;
        }
        Err(_) => {
            tracing::debug!("accept_link: handshake timed out");
            return;
        }
    };

    let endpoint = transport
        .upgrade()
        .and_then(|t| t.endpoint(request.target_index));
    let decision = match &endpoint {
        Some(endpoint) => endpoint.accept_link(&request.source, request.link_seq),
        None => Err(HandshakeResponse::Refused),
    };
    drop(endpoint);

    match decision {
        Ok((peer, outbound)) => {
            let reply = HandshakeResponse::Accepted {
                link_seq: peer.seq(),
            }
            .encode();
            let written = async {
                stream.write_all(&reply).await?;
                stream.flush().await
            }
            .await;
            match written {
                Ok(()) => start_link(providers.task(), &peer, stream, outbound, read_buffer_size),
                Err(e) => peer.fail(LinkFailure::Lost(format!("handshake reply failed: {}", e))),
            }
        }
        Err(response) => {
            tracing::debug!(
                "accept_link: {:?} for {} -> index {}",
                response,
                request.source,
                request.target_index
            );
            let _ = stream.write_all(&response.encode()).await;
            let _ = stream.flush().await;
        }
    }
}
