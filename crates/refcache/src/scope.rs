use std::future::Future;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// The lifetime of a single cache entry.
///
/// Every entry owns one scope, derived from the scope of the cache it lives in. The factory
/// of a cache can use it to run background work on behalf of the element it creates, which
/// is cancelled once the entry is evicted or the cache is closed.
#[derive(Debug, Clone)]
pub struct EntryScope {
    token: CancellationToken,
    tracker: TaskTracker,
    runtime: Handle,
}

impl EntryScope {
    pub(crate) fn new(token: CancellationToken, runtime: Handle) -> Self {
        Self {
            token,
            tracker: TaskTracker::new(),
            runtime,
        }
    }

    /// Spawns `future` as background work owned by this scope.
    ///
    /// The future is dropped as soon as the scope is cancelled. The returned handle resolves
    /// to `None` in that case.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let token = self.token.clone();
        let task = async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => None,
                output = future => Some(output),
            }
        };
        self.tracker.spawn_on(task, &self.runtime)
    }

    /// Waits until this scope is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Whether this scope has been cancelled already.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A token that is cancelled together with this scope.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// The runtime work of this scope is spawned on.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Cancels the scope and everything spawned within it.
    pub(crate) fn cancel(&self) {
        self.tracker.close();
        self.token.cancel();
    }

    /// Waits until all work spawned within this scope has stopped.
    ///
    /// This only resolves after the scope has been cancelled.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
        // the scope may have been cancelled through its parent
        self.tracker.close();
        self.tracker.wait().await;
    }
}
