//! Shares continuously updating per-key streams between subscribers.
//!
//! A [`BroadcastCache`] is a [`KeyedCache`] whose elements are [`Broadcast`]s. The producer of
//! a key is started with its first subscriber, publishes into a channel that always holds the
//! latest value, and is stopped once the entry is evicted. How long a broadcast without
//! subscribers is kept alive is up to the configured eviction policy.

use std::fmt;
use std::future::Future;
use std::hash::Hash;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::cache::{KeyedCache, KeyedCacheBuilder};
use crate::config::CacheConfig;
use crate::eviction::EvictionPolicy;
use crate::scope::EntryScope;

/// The live channel of a single key, holding the latest produced value.
pub struct Broadcast<E> {
    latest: watch::Receiver<Option<E>>,
}

impl<E> Clone for Broadcast<E> {
    fn clone(&self) -> Self {
        Self {
            latest: self.latest.clone(),
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for Broadcast<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcast")
            .field("latest", &*self.latest.borrow())
            .finish()
    }
}

impl<E> Broadcast<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Starts `producer` on `scope`, publishing everything it yields.
    fn start(scope: &EntryScope, mut producer: BoxStream<'static, E>) -> Self {
        let (sender, latest) = watch::channel(None);
        scope.spawn(async move {
            while let Some(value) = producer.next().await {
                sender.send_replace(Some(value));
            }
        });
        Self { latest }
    }

    /// The most recently produced value.
    pub fn latest(&self) -> Option<E> {
        self.latest.borrow().clone()
    }

    /// Whether the producer has finished or was stopped.
    pub fn is_finished(&self) -> bool {
        self.latest.has_changed().is_err()
    }

    /// Subscribes to the produced values.
    ///
    /// The stream starts with the latest value, if one was produced already. After that it
    /// yields the newest value whenever it changes, skipping values the subscriber was too
    /// slow to observe. It ends when the producer does.
    pub fn subscribe(&self) -> BoxStream<'static, E> {
        let mut latest = self.latest.clone();
        latest.mark_changed();

        stream::unfold(latest, |mut latest| async move {
            loop {
                latest.changed().await.ok()?;
                let value = latest.borrow_and_update().clone();
                if let Some(value) = value {
                    return Some((value, latest));
                }
            }
        })
        .boxed()
    }
}

/// A cache of [`Broadcast`]s, one per key.
pub struct BroadcastCache<K, E> {
    cache: KeyedCache<K, Broadcast<E>>,
}

impl<K, E> Clone for BroadcastCache<K, E> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<K, E> fmt::Debug for BroadcastCache<K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BroadcastCache").field(&self.cache).finish()
    }
}

impl<K, E> BroadcastCache<K, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a broadcast cache that stops producers as soon as their last subscriber is gone.
    pub fn new<F>(create_stream: F) -> Self
    where
        F: Fn(&EntryScope, &K) -> BoxStream<'static, E> + Send + Sync + 'static,
    {
        Self::builder(create_stream).build()
    }

    /// Starts building a broadcast cache producing values with `create_stream`.
    ///
    /// `create_stream` is called when the first subscriber of a key arrives. The stream it
    /// returns is driven on the scope of the cache entry.
    pub fn builder<F>(create_stream: F) -> BroadcastCacheBuilder<K, E>
    where
        F: Fn(&EntryScope, &K) -> BoxStream<'static, E> + Send + Sync + 'static,
    {
        let builder = KeyedCache::builder(move |scope: &EntryScope, key: &K| {
            Broadcast::start(scope, create_stream(scope, key))
        });
        BroadcastCacheBuilder { builder }
    }

    /// Runs `consume` with a subscription to the broadcast of `key`.
    ///
    /// The broadcast is kept alive for as long as `consume` runs.
    pub async fn subscribe<F, Fut, R>(&self, key: K, consume: F) -> R
    where
        F: FnOnce(BoxStream<'static, E>) -> Fut,
        Fut: Future<Output = R>,
    {
        self.cache
            .with(key, |broadcast| consume(broadcast.subscribe()))
            .await
    }

    /// Waits for the first value of `key` that matches `predicate`.
    ///
    /// Resolves to `None` if the producer finishes before that.
    pub fn wait_for<P>(&self, key: K, mut predicate: P) -> BoxFuture<'static, Option<E>>
    where
        P: FnMut(&E) -> bool + Send + 'static,
    {
        let this = self.clone();
        async move {
            this.subscribe(key, |values| async move {
                values
                    .filter(|value| futures::future::ready(predicate(value)))
                    .boxed()
                    .next()
                    .await
            })
            .await
        }
        .boxed()
    }

    /// The underlying cache of broadcasts.
    pub fn cache(&self) -> &KeyedCache<K, Broadcast<E>> {
        &self.cache
    }
}

/// Builds a [`BroadcastCache`], see [`BroadcastCache::builder`].
pub struct BroadcastCacheBuilder<K, E> {
    builder: KeyedCacheBuilder<K, Broadcast<E>>,
}

impl<K, E> BroadcastCacheBuilder<K, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Names the cache for logs and metrics.
    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            builder: self.builder.name(name),
        }
    }

    /// Keeps broadcasts without subscribers according to `policy`.
    pub fn eviction_policy<P>(self, policy: P) -> Self
    where
        P: EvictionPolicy<K, Broadcast<E>>,
    {
        Self {
            builder: self.builder.eviction_policy(policy),
        }
    }

    /// Configures the eviction policy from `config`.
    pub fn config(self, config: &CacheConfig) -> Self {
        Self {
            builder: self.builder.config(config),
        }
    }

    /// Runs producers and eviction tasks on `runtime`.
    pub fn runtime(self, runtime: Handle) -> Self {
        Self {
            builder: self.builder.runtime(runtime),
        }
    }

    /// Builds the broadcast cache.
    pub fn build(self) -> BroadcastCache<K, E> {
        BroadcastCache {
            cache: self.builder.build(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::channel::mpsc;

    use super::*;
    use crate::eviction::GracePeriod;

    type Feeds = mpsc::UnboundedReceiver<mpsc::UnboundedSender<u32>>;

    /// A broadcast cache fed through channels, one per created producer.
    fn channel_cache(producers: Arc<AtomicUsize>) -> (BroadcastCache<&'static str, u32>, Feeds) {
        let (feeds, feed_rx) = mpsc::unbounded();
        let cache = BroadcastCache::new(move |_scope: &EntryScope, _key: &&'static str| {
            producers.fetch_add(1, Ordering::SeqCst);
            let (sender, receiver) = mpsc::unbounded();
            feeds.unbounded_send(sender).ok();
            receiver.boxed()
        });
        (cache, feed_rx)
    }

    #[tokio::test]
    async fn test_subscribers_share_producer() {
        refcache_test::setup();

        let producers = Arc::new(AtomicUsize::new(0));
        let (cache, mut feeds) = channel_cache(Arc::clone(&producers));

        let first = tokio::spawn(cache.wait_for("ticks", |value| *value == 2));
        let second = tokio::spawn(cache.wait_for("ticks", |value| *value >= 1));

        let feed = feeds.next().await.unwrap();
        while cache.cache().ref_count(&"ticks") != Some(2) {
            tokio::task::yield_now().await;
        }

        feed.unbounded_send(1).unwrap();
        feed.unbounded_send(2).unwrap();

        // a slow subscriber only sees the latest value
        assert!(matches!(second.await.unwrap(), Some(1 | 2)));
        assert_eq!(first.await.unwrap(), Some(2));
        assert_eq!(producers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_replays_latest() {
        let producers = Arc::new(AtomicUsize::new(0));
        let (cache, mut feeds) = channel_cache(Arc::clone(&producers));

        let entry = cache.cache().acquire("ticks");
        let feed = feeds.next().await.unwrap();
        feed.unbounded_send(5).unwrap();
        feed.unbounded_send(6).unwrap();
        while entry.latest() != Some(6) {
            tokio::task::yield_now().await;
        }

        let latest = cache
            .subscribe("ticks", |mut values| async move { values.next().await })
            .await;
        assert_eq!(latest, Some(6));
        assert!(!entry.is_finished());
        drop(entry);
    }

    #[tokio::test]
    async fn test_producer_stops_on_eviction() {
        let producers = Arc::new(AtomicUsize::new(0));
        let (cache, mut feeds) = channel_cache(Arc::clone(&producers));

        cache.subscribe("ticks", |_values| async {}).await;
        let feed = feeds.next().await.unwrap();

        // without a policy, the last subscriber leaving tears down the producer
        assert!(cache.cache().is_empty());
        while !feed.is_closed() {
            tokio::task::yield_now().await;
        }

        cache.subscribe("ticks", |_values| async {}).await;
        assert_eq!(producers.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_producer_outlives_subscribers_in_grace_period() {
        tokio::time::pause();

        let producers = Arc::new(AtomicUsize::new(0));
        let cache = {
            let producers = Arc::clone(&producers);
            BroadcastCache::builder(move |_scope: &EntryScope, key: &u32| {
                producers.fetch_add(1, Ordering::SeqCst);
                stream::iter([*key, *key + 1])
                    .chain(stream::pending())
                    .boxed()
            })
            .name("grace")
            .eviction_policy(GracePeriod::new(Duration::from_secs(10)))
            .build()
        };

        let value = cache.wait_for(1, |value| *value == 2).await;
        assert_eq!(value, Some(2));
        assert_eq!(cache.cache().idle_count(), 1);

        // a subscriber within the grace period joins the running producer
        let value = cache.wait_for(1, |_| true).await;
        assert_eq!(value, Some(2));
        assert_eq!(producers.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        while !cache.cache().is_empty() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_finished_producer_ends_streams() {
        let cache = BroadcastCache::new(|_scope: &EntryScope, _key: &()| {
            stream::iter([1u32, 2, 3]).boxed()
        });

        let values: Vec<u32> = cache.subscribe((), |values| values.collect()).await;
        // values may be skipped, but the stream always ends with the latest one
        assert_eq!(values.last(), Some(&3));
        assert!(values.len() <= 3);
    }
}
