//! Network provider abstraction.
//!
//! Links only need three primitives from the socket layer: bind a listener,
//! accept on it, and dial out. Everything else (framing, multiplexing,
//! teardown) lives above this trait, so swapping TCP for in-process pipes or
//! for deliberately broken streams does not change a line of transport code.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Provider trait for creating network connections and listeners.
///
/// Single-core design - no Send bounds needed.
/// Clone must be cheap: every endpoint and every dial holds a copy.
#[async_trait(?Send)]
pub trait NetworkProvider: Clone {
    /// Byte stream produced by both `connect` and `accept`.
    type TcpStream: AsyncRead + AsyncWrite + Unpin + 'static;
    /// Listener produced by `bind`.
    type TcpListener: TcpListenerTrait<TcpStream = Self::TcpStream> + 'static;

    /// Start listening on `addr`.
    async fn bind(&self, addr: &str) -> io::Result<Self::TcpListener>;

    /// Open a stream to `addr`.
    async fn connect(&self, addr: &str) -> io::Result<Self::TcpStream>;
}

/// A bound listener.
#[async_trait(?Send)]
pub trait TcpListenerTrait {
    /// Byte stream handed out for each accepted connection.
    type TcpStream: AsyncRead + AsyncWrite + Unpin + 'static;

    /// Wait for the next inbound stream and the remote's socket address.
    async fn accept(&self) -> io::Result<(Self::TcpStream, String)>;

    /// Address other processes should dial to reach this listener.
    ///
    /// For TCP this is where a requested port `0` turns into the port the
    /// kernel actually assigned.
    fn local_addr(&self) -> io::Result<String>;
}

/// Real TCP through tokio.
#[derive(Debug, Clone, Default)]
pub struct TokioNetworkProvider;

impl TokioNetworkProvider {
    /// Create a new Tokio network provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait(?Send)]
impl NetworkProvider for TokioNetworkProvider {
    type TcpStream = tokio::net::TcpStream;
    type TcpListener = TokioTcpListener;

    async fn bind(&self, addr: &str) -> io::Result<Self::TcpListener> {
        let inner = tokio::net::TcpListener::bind(addr).await?;
        let local = inner.local_addr()?.to_string();
        tracing::debug!("TokioNetworkProvider: listening on {}", local);
        Ok(TokioTcpListener { inner, local })
    }

    async fn connect(&self, addr: &str) -> io::Result<Self::TcpStream> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        // Control frames are a handful of bytes; Nagle would sit on them.
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Listener half of [`TokioNetworkProvider`].
#[derive(Debug)]
pub struct TokioTcpListener {
    inner: tokio::net::TcpListener,
    local: String,
}

#[async_trait(?Send)]
impl TcpListenerTrait for TokioTcpListener {
    type TcpStream = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::TcpStream, String)> {
        let (stream, remote) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, remote.to_string()))
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.local.clone())
    }
}
