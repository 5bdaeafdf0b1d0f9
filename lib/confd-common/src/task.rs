//! Helpers for working with asynchronous tasks.

use std::future::Future;

use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug_span, Instrument as _};

/// Traced spawning for [`JoinSet`].
pub trait JoinSetExt<T> {
    /// Spawns a new named asynchronous task into the set, returning an [`AbortHandle`] for it.
    fn spawn_traced_named<S, F>(&mut self, name: S, f: F) -> AbortHandle
    where
        S: Into<String>,
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static;
}

impl<T> JoinSetExt<T> for JoinSet<T> {
    fn spawn_traced_named<S, F>(&mut self, name: S, f: F) -> AbortHandle
    where
        S: Into<String>,
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let name = name.into();
        self.spawn(f.instrument(debug_span!("task", task_name = %name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_set_collects_results() {
        let mut tasks = JoinSet::new();
        tasks.spawn_traced_named("one", async { 1 });
        tasks.spawn_traced_named("two", async { 2 });

        let mut results = Vec::new();
        while let Some(result) = tasks.join_next().await {
            results.push(result.unwrap());
        }
        results.sort();
        assert_eq!(results, vec![1, 2]);
    }
}
