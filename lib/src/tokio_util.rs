//! Bridging the blocking tar pipelines into Tokio.

use anyhow::Result;
use futures_util::{Future, FutureExt};

/// Run `f` on the blocking thread pool and wait for it.
///
/// A worker that panics, or whose task is torn down with the runtime,
/// comes back as an ordinary error.
pub(crate) fn spawn_blocking_flatten<F, T>(f: F) -> impl Future<Output = Result<T>>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).map(|r| match r {
        Ok(r) => r,
        Err(e) if e.is_panic() => Err(anyhow::anyhow!("Worker thread panicked: {e}")),
        Err(e) => Err(anyhow::anyhow!("Worker task failed: {e}")),
    })
}
