//! Eviction policies decide when an idle cache entry is actually removed.
//!
//! Whenever the reference count of an entry drops to zero, the cache asks its policy to
//! [`wait_for_expiration`](EvictionPolicy::wait_for_expiration). The entry is evicted once the
//! returned future resolves, unless it was acquired again in the meantime. In that case the
//! future is simply dropped.
//!
//! A cache without a policy removes entries as soon as they become idle.

use std::time::Duration;

use futures::FutureExt;
use futures::future::{self, BoxFuture};

use crate::error::PolicyError;

mod idle;

pub use idle::*;

/// A strategy deciding when an idle entry should be evicted.
///
/// The policy is invoked exactly once per idle period of an entry.
pub trait EvictionPolicy<K, V>: Send + Sync + 'static {
    /// Registers the idle entry for `key` and waits for its expiration.
    ///
    /// Calling this method is the registration step: it runs synchronously while the cache
    /// is locked, possibly outside of a runtime context, and must not block or call back into
    /// the cache. The
    /// returned future resolves once the entry should be evicted. It may never resolve, which
    /// keeps the entry cached until it is used again.
    ///
    /// The future is dropped when the entry is reacquired before it resolves, so dropping it
    /// must undo the registration without any other side effects.
    fn wait_for_expiration(
        &self,
        key: &K,
        value: &V,
    ) -> BoxFuture<'static, Result<(), PolicyError>>;
}

impl<K, V, F> EvictionPolicy<K, V> for F
where
    F: Fn(&K, &V) -> BoxFuture<'static, Result<(), PolicyError>> + Send + Sync + 'static,
{
    fn wait_for_expiration(
        &self,
        key: &K,
        value: &V,
    ) -> BoxFuture<'static, Result<(), PolicyError>> {
        self(key, value)
    }
}

/// Evicts entries after they have been idle for a fixed amount of time.
#[derive(Debug, Clone, Copy)]
pub struct GracePeriod {
    period: Duration,
}

impl GracePeriod {
    /// Creates a policy that keeps idle entries around for `period`.
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    /// The idle grace period.
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl<K, V> EvictionPolicy<K, V> for GracePeriod {
    fn wait_for_expiration(
        &self,
        _key: &K,
        _value: &V,
    ) -> BoxFuture<'static, Result<(), PolicyError>> {
        // the idle period starts at registration, not when the eviction task first polls
        let deadline = tokio::time::Instant::now() + self.period;
        async move {
            tokio::time::sleep_until(deadline).await;
            Ok(())
        }
        .boxed()
    }
}

/// Never evicts anything.
///
/// Entries stay cached for the lifetime of the cache once they have been created.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetainForever;

impl<K, V> EvictionPolicy<K, V> for RetainForever {
    fn wait_for_expiration(
        &self,
        _key: &K,
        _value: &V,
    ) -> BoxFuture<'static, Result<(), PolicyError>> {
        future::pending().boxed()
    }
}
