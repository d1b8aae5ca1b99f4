//! Provider bundle trait for simplified type parameters.
//!
//! Without bundling, every transport type would carry three parameters:
//!
//! ```text
//! struct Endpoint<N, T, TP>
//! where
//!     N: NetworkProvider + Clone + 'static,
//!     T: TimeProvider + Clone + 'static,
//!     TP: TaskProvider + Clone + 'static,
//! ```
//!
//! With bundling this becomes `struct Endpoint<P: Providers>`.

use crate::{
    MemoryNetworkProvider, NetworkProvider, TaskProvider, TimeProvider, TokioNetworkProvider,
    TokioTaskProvider, TokioTimeProvider,
};

/// Bundle of the provider types one transport runs on.
pub trait Providers: Clone + 'static {
    /// Network provider type for streams and listeners.
    type Network: NetworkProvider + Clone + 'static;

    /// Time provider type for sleeps and timeouts.
    type Time: TimeProvider + Clone + 'static;

    /// Task provider type for spawning local tasks.
    type Task: TaskProvider + Clone + 'static;

    /// Get the network provider instance.
    fn network(&self) -> &Self::Network;

    /// Get the time provider instance.
    fn time(&self) -> &Self::Time;

    /// Get the task provider instance.
    fn task(&self) -> &Self::Task;
}

/// Tokio time and tasks over a pluggable network.
///
/// The default network is real TCP. Tests swap in
/// [`MemoryNetworkProvider`] or a
/// [`FaultyNetworkProvider`](crate::FaultyNetworkProvider) through
/// [`TokioProviders::with_network`].
///
/// ```rust,ignore
/// use tidepool_core::{MemoryNetworkProvider, Providers, TokioProviders};
///
/// let tcp = TokioProviders::new();
/// let in_process = TokioProviders::with_network(MemoryNetworkProvider::new());
/// ```
#[derive(Clone)]
pub struct TokioProviders<N = TokioNetworkProvider> {
    network: N,
    time: TokioTimeProvider,
    task: TokioTaskProvider,
}

impl TokioProviders {
    /// Providers backed by real TCP sockets.
    pub fn new() -> Self {
        Self::with_network(TokioNetworkProvider::new())
    }
}

impl Default for TokioProviders {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioProviders<MemoryNetworkProvider> {
    /// Providers backed by a fresh, private in-memory network.
    pub fn in_memory() -> Self {
        Self::with_network(MemoryNetworkProvider::new())
    }
}

impl<N: NetworkProvider + 'static> TokioProviders<N> {
    /// Tokio time and tasks over the given network provider.
    pub fn with_network(network: N) -> Self {
        Self {
            network,
            time: TokioTimeProvider::new(),
            task: TokioTaskProvider,
        }
    }
}

impl<N: NetworkProvider + 'static> Providers for TokioProviders<N> {
    type Network = N;
    type Time = TokioTimeProvider;
    type Task = TokioTaskProvider;

    fn network(&self) -> &Self::Network {
        &self.network
    }

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn task(&self) -> &Self::Task {
        &self.task
    }
}
