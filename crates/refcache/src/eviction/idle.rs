use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use tokio::sync::watch;

use super::EvictionPolicy;
use crate::error::PolicyError;

/// Idle entries waiting for their expiration, in the order they became idle.
///
/// The number of waiters is published through a [`watch`] channel, so that policy logic can
/// react to changes of the idle count.
pub struct IdleQueue<K> {
    waiters: Mutex<Waiters<K>>,
    count: watch::Sender<usize>,
}

struct Waiters<K> {
    next_id: u64,
    /// Ordered by registration, which makes the first entry the oldest idle one.
    waiting: BTreeMap<u64, Waiter<K>>,
}

struct Waiter<K> {
    key: K,
    expire: oneshot::Sender<()>,
}

impl<K> fmt::Debug for IdleQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleQueue")
            .field("idle", &*self.count.borrow())
            .finish()
    }
}

impl<K> Default for IdleQueue<K> {
    fn default() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            waiters: Mutex::new(Waiters {
                next_id: 0,
                waiting: BTreeMap::new(),
            }),
            count,
        }
    }
}

impl<K: fmt::Debug> IdleQueue<K> {
    fn waiters(&self) -> MutexGuard<'_, Waiters<K>> {
        // the waiters are consistent at all times, a panic elsewhere does not affect them
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a waiter for `key` to the queue.
    ///
    /// The returned future resolves once the waiter is expired. Dropping it removes the
    /// waiter from the queue again.
    pub fn register(self: &Arc<Self>, key: K) -> IdleWaiter<K> {
        let (expire, expired) = oneshot::channel();

        let mut waiters = self.waiters();
        let id = waiters.next_id;
        waiters.next_id += 1;
        waiters.waiting.insert(id, Waiter { key, expire });
        self.count.send_replace(waiters.waiting.len());

        IdleWaiter {
            queue: Arc::clone(self),
            id,
            expired,
        }
    }

    /// The number of currently idle waiters.
    pub fn len(&self) -> usize {
        self.waiters().waiting.len()
    }

    /// Whether there are no idle waiters.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes to changes of the idle count.
    pub fn watch_count(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    /// Expires up to `n` of the oldest waiters.
    ///
    /// Returns the number of waiters that were expired.
    pub fn expire_oldest(&self, n: usize) -> usize {
        let mut waiters = self.waiters();
        self.expire_locked(&mut waiters, n)
    }

    /// Expires the oldest waiters until at most `max_idle` remain.
    pub fn expire_overflow(&self, max_idle: usize) -> usize {
        let mut waiters = self.waiters();
        let overflow = waiters.waiting.len().saturating_sub(max_idle);
        self.expire_locked(&mut waiters, overflow)
    }

    fn expire_locked(&self, waiters: &mut Waiters<K>, n: usize) -> usize {
        let mut expired = 0;
        while expired < n {
            let Some((_, waiter)) = waiters.waiting.pop_first() else {
                break;
            };
            tracing::trace!(key = ?waiter.key, "Expiring idle entry");
            // a waiter that is gone already has nothing left to evict
            waiter.expire.send(()).ok();
            expired += 1;
        }
        if expired > 0 {
            self.count.send_replace(waiters.waiting.len());
        }
        expired
    }

    fn remove(&self, id: u64) {
        let mut waiters = self.waiters();
        if waiters.waiting.remove(&id).is_some() {
            self.count.send_replace(waiters.waiting.len());
        }
    }
}

/// A registration in an [`IdleQueue`], resolving once it has been expired.
pub struct IdleWaiter<K: fmt::Debug> {
    queue: Arc<IdleQueue<K>>,
    id: u64,
    expired: oneshot::Receiver<()>,
}

impl<K: fmt::Debug> Future for IdleWaiter<K> {
    type Output = Result<(), PolicyError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.expired.poll_unpin(cx).map(|result| {
            result.map_err(|_| PolicyError::Failed("idle waiter was discarded".into()))
        })
    }
}

impl<K: fmt::Debug> Drop for IdleWaiter<K> {
    fn drop(&mut self) {
        self.queue.remove(self.id);
    }
}

/// Exposes the number of idle entries to caller defined eviction logic.
///
/// Idle entries are kept until they are explicitly dropped with
/// [`drop_oldest`](Self::drop_oldest), which evicts them in the order they became idle.
/// Clones share the same queue, so one clone can be handed to a cache while another one is
/// used to observe and control it.
pub struct UnusedCount<K> {
    queue: Arc<IdleQueue<K>>,
}

impl<K> Clone for UnusedCount<K> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<K> Default for UnusedCount<K> {
    fn default() -> Self {
        Self {
            queue: Default::default(),
        }
    }
}

impl<K> fmt::Debug for UnusedCount<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UnusedCount").field(&self.queue).finish()
    }
}

impl<K: fmt::Debug> UnusedCount<K> {
    /// Creates a policy with an empty idle queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of entries currently idle.
    pub fn idle_count(&self) -> usize {
        self.queue.len()
    }

    /// Subscribes to the number of idle entries.
    pub fn watch_count(&self) -> watch::Receiver<usize> {
        self.queue.watch_count()
    }

    /// Evicts up to `n` of the entries that have been idle the longest.
    ///
    /// Returns how many entries were released for eviction.
    pub fn drop_oldest(&self, n: usize) -> usize {
        self.queue.expire_oldest(n)
    }

    pub(crate) fn queue(&self) -> &Arc<IdleQueue<K>> {
        &self.queue
    }
}

impl<K, V> EvictionPolicy<K, V> for UnusedCount<K>
where
    K: fmt::Debug + Clone + Send + Sync + 'static,
{
    fn wait_for_expiration(
        &self,
        key: &K,
        _value: &V,
    ) -> BoxFuture<'static, Result<(), PolicyError>> {
        self.queue.register(key.clone()).boxed()
    }
}

/// Keeps at most `max_idle` idle entries, evicting the oldest idle ones first.
///
/// The overflow is evaluated on the queue itself right after each registration, so there is
/// no window in which a freshly idle entry is not yet counted.
pub struct BoundedIdle<K> {
    unused: UnusedCount<K>,
    max_idle: usize,
}

impl<K> fmt::Debug for BoundedIdle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedIdle")
            .field("max_idle", &self.max_idle)
            .field("unused", &self.unused)
            .finish()
    }
}

impl<K: fmt::Debug> BoundedIdle<K> {
    /// Creates a policy that retains up to `max_idle` idle entries.
    pub fn new(max_idle: usize) -> Self {
        Self {
            unused: UnusedCount::new(),
            max_idle,
        }
    }

    /// The maximum number of idle entries.
    pub fn max_idle(&self) -> usize {
        self.max_idle
    }

    /// The shared idle queue, to observe the idle count.
    pub fn unused(&self) -> &UnusedCount<K> {
        &self.unused
    }
}

impl<K, V> EvictionPolicy<K, V> for BoundedIdle<K>
where
    K: fmt::Debug + Clone + Send + Sync + 'static,
{
    fn wait_for_expiration(
        &self,
        key: &K,
        _value: &V,
    ) -> BoxFuture<'static, Result<(), PolicyError>> {
        let queue = self.unused.queue();
        let waiter = queue.register(key.clone());
        queue.expire_overflow(self.max_idle);
        waiter.boxed()
    }
}
