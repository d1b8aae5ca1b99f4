//! Fault injection at the stream level.
//!
//! [`FaultyNetworkProvider`] wraps any [`NetworkProvider`] and hands out
//! [`FaultyStream`]s. A [`FaultPlan`] holds one-shot rules: the first stream
//! produced by a matching dial or accept is killed once it has completed a
//! given number of reads. Killing means the stream shuts its write side
//! down (so the remote reads EOF) and every later I/O on it fails, which is
//! indistinguishable from a socket dying under the transport.
//!
//! ```rust,ignore
//! use tidepool_core::{FaultPlan, FaultSite, FaultyNetworkProvider, MemoryNetworkProvider};
//!
//! let plan = FaultPlan::new();
//! let network = FaultyNetworkProvider::new(MemoryNetworkProvider::new(), plan.clone());
//! // The next stream accepted on "server:1" dies on its second read.
//! plan.kill_after_reads(FaultSite::Accept("server:1".into()), 1);
//! ```

use async_trait::async_trait;
use std::cell::RefCell;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{NetworkProvider, TcpListenerTrait};

/// Where a fault rule applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultSite {
    /// The stream returned by `connect(addr)`.
    Dial(String),
    /// A stream accepted by the listener bound at this address.
    Accept(String),
}

#[derive(Debug, Clone)]
struct FaultRule {
    site: FaultSite,
    reads: usize,
}

/// Shared, mutable set of pending fault rules.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    rules: Rc<RefCell<Vec<FaultRule>>>,
}

impl FaultPlan {
    /// Create a plan with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill the next stream created at `site` after `reads` successful reads.
    ///
    /// With `reads == 0` the very first read kills the stream.
    pub fn kill_after_reads(&self, site: FaultSite, reads: usize) {
        self.rules.borrow_mut().push(FaultRule { site, reads });
    }

    /// Number of rules that have not fired yet.
    pub fn pending(&self) -> usize {
        self.rules.borrow().len()
    }

    /// Drop every rule that has not fired yet.
    pub fn clear(&self) {
        self.rules.borrow_mut().clear();
    }

    fn take(&self, site: &FaultSite) -> Option<usize> {
        let mut rules = self.rules.borrow_mut();
        let index = rules.iter().position(|rule| &rule.site == site)?;
        Some(rules.remove(index).reads)
    }
}

/// Network provider that arms streams according to a [`FaultPlan`].
#[derive(Debug, Clone)]
pub struct FaultyNetworkProvider<N> {
    inner: N,
    plan: FaultPlan,
}

impl<N: NetworkProvider> FaultyNetworkProvider<N> {
    /// Wrap `inner`; rules are read from `plan` at stream creation time.
    pub fn new(inner: N, plan: FaultPlan) -> Self {
        Self { inner, plan }
    }

    /// The plan this provider consults.
    pub fn plan(&self) -> &FaultPlan {
        &self.plan
    }
}

#[async_trait(?Send)]
impl<N> NetworkProvider for FaultyNetworkProvider<N>
where
    N: NetworkProvider + 'static,
{
    type TcpStream = FaultyStream<N::TcpStream>;
    type TcpListener = FaultyListener<N::TcpListener>;

    async fn bind(&self, addr: &str) -> io::Result<Self::TcpListener> {
        let inner = self.inner.bind(addr).await?;
        let local = inner.local_addr()?;
        Ok(FaultyListener {
            inner,
            local,
            plan: self.plan.clone(),
        })
    }

    async fn connect(&self, addr: &str) -> io::Result<Self::TcpStream> {
        let stream = self.inner.connect(addr).await?;
        let budget = self.plan.take(&FaultSite::Dial(addr.to_string()));
        Ok(FaultyStream::new(stream, budget))
    }
}

/// Listener half of [`FaultyNetworkProvider`].
#[derive(Debug)]
pub struct FaultyListener<L> {
    inner: L,
    local: String,
    plan: FaultPlan,
}

#[async_trait(?Send)]
impl<L> TcpListenerTrait for FaultyListener<L>
where
    L: TcpListenerTrait,
{
    type TcpStream = FaultyStream<L::TcpStream>;

    async fn accept(&self) -> io::Result<(Self::TcpStream, String)> {
        let (stream, remote) = self.inner.accept().await?;
        let budget = self.plan.take(&FaultSite::Accept(self.local.clone()));
        Ok((FaultyStream::new(stream, budget), remote))
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.local.clone())
    }
}

/// A stream that dies after a read budget runs out.
#[derive(Debug)]
pub struct FaultyStream<S> {
    inner: S,
    reads_left: Option<usize>,
    killed: bool,
}

impl<S> FaultyStream<S> {
    /// Wrap `inner`; `None` never fails.
    pub fn new(inner: S, reads_left: Option<usize>) -> Self {
        if let Some(reads) = reads_left {
            tracing::debug!("FaultyStream: armed, dies after {} reads", reads);
        }
        Self {
            inner,
            reads_left,
            killed: false,
        }
    }

    /// Whether the fault has fired.
    pub fn is_killed(&self) -> bool {
        self.killed
    }
}

fn killed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "stream killed by fault plan")
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for FaultyStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.killed {
            return Poll::Ready(Err(killed_error()));
        }

        if this.reads_left == Some(0) {
            // Close our write side first so the remote observes EOF.
            if Pin::new(&mut this.inner).poll_shutdown(cx).is_pending() {
                return Poll::Pending;
            }
            this.killed = true;
            tracing::debug!("FaultyStream: read budget exhausted, stream killed");
            return Poll::Ready(Err(killed_error()));
        }

        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            if buf.filled().len() > before {
                if let Some(reads) = this.reads_left.as_mut() {
                    *reads -= 1;
                }
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FaultyStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.killed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream killed by fault plan",
            )));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.killed {
            return Poll::Ready(Err(killed_error()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.killed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
