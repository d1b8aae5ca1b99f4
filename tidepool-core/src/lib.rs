//! # tidepool-core
//!
//! Runtime abstractions shared by the tidepool crates.
//!
//! The transport never touches tokio sockets, timers or the task spawner
//! directly. It goes through provider traits so the same code runs over
//! real TCP, over in-process pipes, or over streams that break on purpose:
//!
//! - [`NetworkProvider`]: listener creation and outbound dials
//! - [`TimeProvider`]: sleep, timeout and elapsed time
//! - [`TaskProvider`]: named `spawn_local` tasks
//! - [`Providers`]: the three bundled behind one type parameter
//!
//! ## Network implementations
//!
//! - [`TokioNetworkProvider`]: real TCP sockets
//! - [`MemoryNetworkProvider`]: in-process duplex pipes, no ports involved
//! - [`FaultyNetworkProvider`]: wraps another provider and kills selected
//!   streams after a fixed number of reads
//!
//! All providers are single-core: no `Send` bounds, everything runs on a
//! tokio `LocalSet`.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod fault;
mod memory;
mod network;
mod providers;
mod task;
mod time;

pub use fault::{FaultPlan, FaultSite, FaultyListener, FaultyNetworkProvider, FaultyStream};
pub use memory::{MemoryListener, MemoryNetworkProvider};
pub use network::{NetworkProvider, TcpListenerTrait, TokioNetworkProvider, TokioTcpListener};
pub use providers::{Providers, TokioProviders};
pub use task::{TaskProvider, TokioTaskProvider};
pub use time::{TimeError, TimeProvider, TokioTimeProvider};
