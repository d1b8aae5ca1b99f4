//! In-process network made of tokio duplex pipes.
//!
//! Every clone of a [`MemoryNetworkProvider`] shares one address table, so
//! two transports built from clones of the same provider can dial each
//! other by name without opening a single OS socket. Addresses are free-form
//! strings; binding `host:0` assigns the next unused port on that host.

use async_trait::async_trait;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::{NetworkProvider, TcpListenerTrait};

/// Capacity of each direction of an in-memory pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

type Backlog = mpsc::UnboundedSender<(DuplexStream, String)>;

#[derive(Default)]
struct MemoryHub {
    listeners: HashMap<String, Backlog>,
    next_port: u16,
    next_client: u64,
}

/// In-memory network provider.
#[derive(Clone, Default)]
pub struct MemoryNetworkProvider {
    hub: Rc<RefCell<MemoryHub>>,
}

impl MemoryNetworkProvider {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of addresses currently bound.
    pub fn listener_count(&self) -> usize {
        self.hub.borrow().listeners.len()
    }
}

impl std::fmt::Debug for MemoryNetworkProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetworkProvider")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[async_trait(?Send)]
impl NetworkProvider for MemoryNetworkProvider {
    type TcpStream = DuplexStream;
    type TcpListener = MemoryListener;

    async fn bind(&self, addr: &str) -> io::Result<Self::TcpListener> {
        let mut hub = self.hub.borrow_mut();
        let address = match addr.rsplit_once(':') {
            Some((host, "0")) => loop {
                hub.next_port = hub.next_port.wrapping_add(1).max(1);
                let candidate = format!("{}:{}", host, hub.next_port);
                if !hub.listeners.contains_key(&candidate) {
                    break candidate;
                }
            },
            _ => addr.to_string(),
        };

        if hub.listeners.contains_key(&address) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} already bound", address),
            ));
        }

        let (backlog_tx, backlog_rx) = mpsc::unbounded_channel();
        hub.listeners.insert(address.clone(), backlog_tx);
        tracing::debug!("MemoryNetworkProvider: bound {}", address);

        Ok(MemoryListener {
            address,
            backlog: tokio::sync::Mutex::new(backlog_rx),
            hub: self.hub.clone(),
        })
    }

    async fn connect(&self, addr: &str) -> io::Result<Self::TcpStream> {
        let mut hub = self.hub.borrow_mut();
        hub.next_client += 1;
        let client_addr = format!("memory-client-{}", hub.next_client);

        let backlog = hub.listeners.get(addr).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("nothing listening on {}", addr),
            )
        })?;

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        backlog.send((server, client_addr)).map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("listener on {} is gone", addr),
            )
        })?;
        Ok(client)
    }
}

/// Listener half of [`MemoryNetworkProvider`].
///
/// Dropping it frees the address.
pub struct MemoryListener {
    address: String,
    backlog: tokio::sync::Mutex<mpsc::UnboundedReceiver<(DuplexStream, String)>>,
    hub: Rc<RefCell<MemoryHub>>,
}

#[async_trait(?Send)]
impl TcpListenerTrait for MemoryListener {
    type TcpStream = DuplexStream;

    async fn accept(&self) -> io::Result<(Self::TcpStream, String)> {
        let mut backlog = self.backlog.lock().await;
        backlog.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "memory listener closed")
        })
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.address.clone())
    }
}

impl std::fmt::Debug for MemoryListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryListener")
            .field("address", &self.address)
            .finish()
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        if let Ok(mut hub) = self.hub.try_borrow_mut() {
            hub.listeners.remove(&self.address);
        }
    }
}
