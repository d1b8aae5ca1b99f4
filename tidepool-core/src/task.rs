//! Task spawning for the single-threaded runtime.

use std::future::Future;

/// Spawns named tasks on the current thread.
///
/// Every link runs a reader and a writer task; the name only feeds
/// tracing, but it makes a stuck link easy to find in a trace.
pub trait TaskProvider: Clone {
    /// Spawn `future` with `spawn_local`.
    ///
    /// Must be called from inside a `LocalSet`.
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static;
}

/// [`TaskProvider`] backed by `tokio::task::spawn_local`.
#[derive(Clone, Debug, Default)]
pub struct TokioTaskProvider;

impl TaskProvider for TokioTaskProvider {
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        let task_name = name.to_string();
        tokio::task::spawn_local(async move {
            tracing::trace!("Task {} starting", task_name);
            future.await;
            tracing::trace!("Task {} completed", task_name);
        })
    }
}
