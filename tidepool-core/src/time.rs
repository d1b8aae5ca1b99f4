//! Time provider abstraction.
//!
//! The transport needs time for exactly two things: bounding connects and
//! handshakes, and parking a losing crossed dial until the winning one
//! lands. Both go through [`TimeProvider`].

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors that can occur during time operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    /// The operation timed out.
    #[error("operation timed out")]
    Elapsed,
}

/// Provider trait for time operations.
#[async_trait(?Send)]
pub trait TimeProvider: Clone {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration);

    /// Time elapsed since the provider was created.
    fn now(&self) -> Duration;

    /// Run a future with a timeout.
    ///
    /// Returns `Ok(result)` if the future completes within `duration`,
    /// `Err(TimeError::Elapsed)` otherwise. The future is dropped on expiry.
    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: Future<Output = T>;
}

/// Wall-clock time through tokio's timer.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start: Instant,
}

impl TokioTimeProvider {
    /// Create a new Tokio time provider.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: Future<Output = T>,
    {
        tokio::time::timeout(duration, future)
            .await
            .map_err(|_| TimeError::Elapsed)
    }
}
