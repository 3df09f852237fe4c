use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::task::{Context, Poll, ready};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::error::PolicyError;
use crate::eviction::EvictionPolicy;
use crate::race::race;
use crate::scope::EntryScope;

type Factory<K, V> = dyn Fn(&EntryScope, &K) -> V + Send + Sync;

/// A lazily populated, reference counted cache of resources.
///
/// Elements are created by a factory on first use of their key, and are shared by everyone
/// using the same key concurrently. Once the last user of a key is done, the idle entry is
/// either removed right away, or handed to an [`EvictionPolicy`] which decides when to
/// remove it. Using the key again before that point reuses the existing element.
///
/// Each entry owns an [`EntryScope`], which is cancelled when the entry is evicted. The
/// factory can use it to spawn background work tied to the lifetime of the element.
///
/// Cloning the cache is cheap, all clones share the same entries.
pub struct KeyedCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for KeyedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for KeyedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (entries, idle) = self
            .inner
            .state
            .try_lock()
            .map(|state| (state.entries.len(), state.idle))
            .unwrap_or_default();
        f.debug_struct("KeyedCache")
            .field("name", &self.inner.name)
            .field("entries", &entries)
            .field("idle", &idle)
            .field("has_policy", &self.inner.policy.is_some())
            .finish()
    }
}

struct Inner<K, V> {
    name: Arc<str>,
    factory: Box<Factory<K, V>>,
    policy: Option<Arc<dyn EvictionPolicy<K, V>>>,
    state: Mutex<State<K, V>>,
    /// The scope of the cache itself, every entry scope is a child of this.
    scope: CancellationToken,
    runtime: Handle,
    policy_error: OnceLock<PolicyError>,
}

impl<K, V> Drop for Inner<K, V> {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

struct State<K, V> {
    entries: HashMap<K, Entry<V>>,
    next_registration: u64,
    /// The number of entries with a pending registration.
    idle: usize,
}

struct Entry<V> {
    value: V,
    scope: EntryScope,
    refs: usize,
    /// Set while the entry is idle and registered with the eviction policy.
    pending: Option<Pending>,
}

impl<V> Entry<V> {
    fn is_registered_as(&self, registration: u64) -> bool {
        self.refs == 0
            && self
                .pending
                .as_ref()
                .is_some_and(|pending| pending.id == registration)
    }
}

/// The registration of an idle entry with the eviction policy.
///
/// Dropping it withdraws the registration: the policy wait is dropped on the spot, and the
/// eviction task is woken up to finish.
struct Pending {
    id: u64,
    expiration: ExpirationSlot,
    _wake: oneshot::Sender<()>,
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.expiration.withdraw();
    }
}

/// The wait of an eviction policy, shared between an idle entry and its eviction task.
///
/// Resolves to `None` once the registration has been withdrawn.
#[derive(Clone)]
struct ExpirationSlot(Arc<Mutex<Option<BoxFuture<'static, Result<(), PolicyError>>>>>);

impl ExpirationSlot {
    fn new(expiration: BoxFuture<'static, Result<(), PolicyError>>) -> Self {
        Self(Arc::new(Mutex::new(Some(expiration))))
    }

    fn slot(&self) -> MutexGuard<'_, Option<BoxFuture<'static, Result<(), PolicyError>>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn withdraw(&self) {
        let expiration = self.slot().take();
        // policies may lock their own state when the wait is dropped
        drop(expiration);
    }
}

impl Future for ExpirationSlot {
    type Output = Option<Result<(), PolicyError>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot();
        let Some(expiration) = slot.as_mut() else {
            return Poll::Ready(None);
        };
        let result = ready!(expiration.poll_unpin(cx));
        *slot = None;
        Poll::Ready(Some(result))
    }
}

/// How an acquire was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acquired {
    /// The entry was in use already.
    Shared,
    /// The entry was idle, and its pending eviction was cancelled.
    Reacquired,
    /// A new entry was created.
    Created,
}

/// The possible outcomes of an idle period.
enum IdleOutcome {
    Expired(Result<(), PolicyError>),
    Withdrawn,
    Closed,
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache that removes entries as soon as they become idle.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&EntryScope, &K) -> V + Send + Sync + 'static,
    {
        Self::builder(factory).build()
    }

    /// Starts building a cache that creates its elements with `factory`.
    ///
    /// The factory is called at most once per key for as long as the key stays cached. It
    /// runs while the cache is locked, so it has to return right away and must not use the
    /// cache itself. Anything that takes time should be spawned on the provided
    /// [`EntryScope`] instead.
    pub fn builder<F>(factory: F) -> KeyedCacheBuilder<K, V>
    where
        F: Fn(&EntryScope, &K) -> V + Send + Sync + 'static,
    {
        KeyedCacheBuilder {
            name: "default".into(),
            factory: Box::new(factory),
            policy: None,
            runtime: None,
        }
    }

    /// The name of this cache, as used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Runs `block` with the element for `key`, creating it if necessary.
    ///
    /// The reference to the element is released once `block` completes, panics, or the
    /// returned future is dropped. If that makes the entry idle, the eviction policy has
    /// registered it by the time this returns.
    ///
    /// It is fine for `block` to use the cache for other keys. Using the same key again
    /// just adds another reference.
    pub async fn with<F, Fut, R>(&self, key: K, block: F) -> R
    where
        F: FnOnce(V) -> Fut,
        Fut: Future<Output = R>,
    {
        let entry = self.acquire(key);
        let output = block(entry.value().clone()).await;
        drop(entry);
        output
    }

    /// Runs `block` with the elements of all `keys`, creating them if necessary.
    ///
    /// All keys are acquired at once, and released together after `block`, just like
    /// [`with`](Self::with). Duplicate keys are only acquired once.
    pub async fn with_all<I, F, Fut, R>(&self, keys: I, block: F) -> R
    where
        I: IntoIterator<Item = K>,
        F: FnOnce(HashMap<K, V>) -> Fut,
        Fut: Future<Output = R>,
    {
        let entries = self.acquire_all(keys);
        let elements = entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let output = block(elements).await;
        drop(entries);
        output
    }

    /// Acquires a reference to the element for `key`, creating it if necessary.
    ///
    /// The reference is released when the returned [`CacheRef`] is dropped.
    pub fn acquire(&self, key: K) -> CacheRef<K, V> {
        let (value, acquired, idle) = {
            let mut state = self.inner.state();
            let (value, acquired) = self.inner.acquire_locked(&mut state, &key);
            (value, acquired, state.idle)
        };
        self.inner.record(&key, acquired, idle);
        CacheRef::new(Arc::clone(&self.inner), key, value)
    }

    /// Acquires references to the elements of all distinct `keys` under a single lock.
    pub fn acquire_all<I>(&self, keys: I) -> Vec<CacheRef<K, V>>
    where
        I: IntoIterator<Item = K>,
    {
        // declared before the lock guard: if a factory panics, the guard is released first
        // and the references acquired so far are returned afterwards
        let mut entries = Vec::new();
        let mut outcomes = Vec::new();

        let mut seen = HashSet::new();
        let mut state = self.inner.state();
        for key in keys {
            if !seen.insert(key.clone()) {
                continue;
            }
            let (value, acquired) = self.inner.acquire_locked(&mut state, &key);
            outcomes.push(acquired);
            entries.push(CacheRef::new(Arc::clone(&self.inner), key, value));
        }
        let idle = state.idle;
        drop(state);

        for (entry, acquired) in entries.iter().zip(outcomes) {
            self.inner.record(entry.key(), acquired, idle);
        }
        entries
    }

    /// The number of cached entries, including idle ones.
    pub fn len(&self) -> usize {
        self.inner.state().entries.len()
    }

    /// Whether there are no cached entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an entry for `key` is cached, either in use or idle.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.state().entries.contains_key(key)
    }

    /// The number of outstanding references to the entry for `key`.
    pub fn ref_count(&self, key: &K) -> Option<usize> {
        self.inner.state().entries.get(key).map(|entry| entry.refs)
    }

    /// The number of idle entries waiting for their eviction.
    pub fn idle_count(&self) -> usize {
        self.inner.state().idle
    }

    /// The first error an eviction policy has failed with, if any.
    pub fn policy_error(&self) -> Option<PolicyError> {
        self.inner.policy_error.get().cloned()
    }

    /// Closes the cache.
    ///
    /// This cancels the scopes of all entries and removes those that are idle. Entries in
    /// use are removed once they are released. The cache stays usable afterwards, but new
    /// entries start out with a cancelled scope and are removed as soon as they become idle.
    pub fn close(&self) {
        self.inner.scope.cancel();

        let mut state = self.inner.state();
        let mut removed = Vec::new();
        let mut withdrawn = 0;
        state.entries.retain(|_, entry| {
            if entry.refs > 0 {
                return true;
            }
            withdrawn += usize::from(entry.pending.is_some());
            removed.push(entry.scope.clone());
            false
        });
        state.idle -= withdrawn;
        let idle = state.idle;
        drop(state);

        self.inner.report_idle(idle);
        tracing::debug!(
            cache = %self.inner.name,
            removed = removed.len(),
            "Closed cache"
        );
        for scope in removed {
            scope.cancel();
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.scope.is_cancelled()
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn state(&self) -> MutexGuard<'_, State<K, V>> {
        // a panicking factory or policy is the only way to poison the lock, and both run
        // before the table is touched
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire_locked(&self, state: &mut State<K, V>, key: &K) -> (V, Acquired) {
        if let Some(entry) = state.entries.get_mut(key) {
            entry.refs += 1;
            // dropping the registration withdraws it from the policy right away
            let acquired = match entry.pending.take() {
                Some(_) => Acquired::Reacquired,
                None => Acquired::Shared,
            };
            let value = entry.value.clone();
            if acquired == Acquired::Reacquired {
                state.idle -= 1;
            }
            return (value, acquired);
        }

        let scope = EntryScope::new(self.scope.child_token(), self.runtime.clone());
        let value = (self.factory)(&scope, key);
        let entry = Entry {
            value: value.clone(),
            scope,
            refs: 1,
            pending: None,
        };
        state.entries.insert(key.clone(), entry);

        (value, Acquired::Created)
    }

    fn record(&self, key: &K, acquired: Acquired, idle: usize) {
        metric!(counter("cache.access") += 1, "cache" => &self.name);
        match acquired {
            Acquired::Shared => {
                tracing::trace!(cache = %self.name, ?key, "Shared cache entry");
            }
            Acquired::Reacquired => {
                metric!(counter("cache.entry.reacquired") += 1, "cache" => &self.name);
                self.report_idle(idle);
                tracing::trace!(cache = %self.name, ?key, "Reacquired idle cache entry");
            }
            Acquired::Created => {
                metric!(counter("cache.entry.created") += 1, "cache" => &self.name);
                tracing::debug!(cache = %self.name, ?key, "Created cache entry");
            }
        }
    }

    fn report_idle(&self, idle: usize) {
        metric!(gauge("cache.idle") = idle as u64, "cache" => &self.name);
    }

    /// Releases one reference to `key`.
    ///
    /// If this makes the entry idle and a policy is configured, the entry is registered with
    /// the policy before the lock is released.
    ///
    /// # Panics
    ///
    /// Panics if `key` has no outstanding references.
    fn release(self: &Arc<Self>, key: &K) {
        let mut state = self.state();
        let registration = state.next_registration;

        let Some(entry) = state.entries.get_mut(key) else {
            panic!("released {key:?} which is not cached");
        };
        assert!(entry.refs > 0, "released {key:?} more often than acquired");

        entry.refs -= 1;
        if entry.refs > 0 {
            return;
        }

        let policy = match &self.policy {
            Some(policy) if !self.scope.is_cancelled() => policy,
            _ => {
                let removed = state.entries.remove(key);
                drop(state);

                if let Some(entry) = removed {
                    self.evicted(key, entry);
                }
                return;
            }
        };

        let expiration = ExpirationSlot::new(policy.wait_for_expiration(key, &entry.value));
        let (wake, withdrawn) = oneshot::channel();
        entry.pending = Some(Pending {
            id: registration,
            expiration: expiration.clone(),
            _wake: wake,
        });
        state.next_registration += 1;
        state.idle += 1;
        let idle = state.idle;
        drop(state);

        self.report_idle(idle);
        tracing::trace!(cache = %self.name, ?key, "Cache entry became idle");

        self.spawn_eviction(key.clone(), registration, expiration, withdrawn);
    }

    /// Spawns the task waiting for the end of an idle period.
    ///
    /// The idle period ends when the policy expires the entry, when the registration is
    /// withdrawn, or when the cache is closed, whichever happens first.
    fn spawn_eviction(
        self: &Arc<Self>,
        key: K,
        registration: u64,
        expiration: ExpirationSlot,
        withdrawn: oneshot::Receiver<()>,
    ) {
        let inner: Weak<Self> = Arc::downgrade(self);
        let closed = self.scope.clone();

        self.runtime.spawn(async move {
            let outcome = race([
                expiration
                    .map(|result| match result {
                        Some(result) => IdleOutcome::Expired(result),
                        None => IdleOutcome::Withdrawn,
                    })
                    .boxed(),
                withdrawn.map(|_| IdleOutcome::Withdrawn).boxed(),
                async move {
                    closed.cancelled().await;
                    IdleOutcome::Closed
                }
                .boxed(),
            ])
            .await;

            match outcome {
                IdleOutcome::Expired(result) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.expire(&key, registration, result);
                    }
                }
                IdleOutcome::Withdrawn => {
                    tracing::trace!(?key, "Idle period ended by reacquire");
                }
                IdleOutcome::Closed => {
                    tracing::trace!(?key, "Idle period ended by closing the cache");
                }
            }
        });
    }

    /// Removes the entry for `key` if it is still idle under the given `registration`.
    fn expire(&self, key: &K, registration: u64, result: Result<(), PolicyError>) {
        let mut state = self.state();
        let is_current = state
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_registered_as(registration));
        if !is_current {
            // acquired again while the policy was deciding
            return;
        }
        state.idle -= 1;

        if let Err(err) = result {
            // keep the entry as it is, only forget about the failed registration
            if let Some(entry) = state.entries.get_mut(key) {
                entry.pending = None;
            }
            let idle = state.idle;
            drop(state);
            self.report_idle(idle);
            self.policy_failed(key, err);
            return;
        }

        let removed = state.entries.remove(key);
        let idle = state.idle;
        drop(state);
        self.report_idle(idle);
        if let Some(entry) = removed {
            self.evicted(key, entry);
        }
    }

    fn evicted(&self, key: &K, entry: Entry<V>) {
        entry.scope.cancel();
        metric!(counter("cache.entry.evicted") += 1, "cache" => &self.name);
        tracing::debug!(cache = %self.name, ?key, "Evicted cache entry");
    }

    fn policy_failed(&self, key: &K, err: PolicyError) {
        tracing::error!(
            cache = %self.name,
            ?key,
            error = &err as &dyn std::error::Error,
            "Eviction policy failed, keeping idle entry"
        );
        metric!(counter("cache.policy.error") += 1, "cache" => &self.name);
        self.policy_error.set(err).ok();
    }
}

/// Builds a [`KeyedCache`], see [`KeyedCache::builder`].
pub struct KeyedCacheBuilder<K, V> {
    name: String,
    factory: Box<Factory<K, V>>,
    policy: Option<Arc<dyn EvictionPolicy<K, V>>>,
    runtime: Option<Handle>,
}

impl<K, V> KeyedCacheBuilder<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Names the cache for logs and metrics.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Hands idle entries to `policy` instead of removing them right away.
    pub fn eviction_policy<P>(mut self, policy: P) -> Self
    where
        P: EvictionPolicy<K, V>,
    {
        self.policy = Some(Arc::new(policy));
        self
    }

    /// Configures the eviction policy from `config`.
    pub fn config(mut self, config: &CacheConfig) -> Self {
        self.policy = config.eviction.policy();
        self
    }

    /// Runs eviction tasks and entry background work on `runtime`.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Builds the cache.
    ///
    /// # Panics
    ///
    /// Panics if no runtime was configured and this is called outside of a tokio runtime.
    pub fn build(self) -> KeyedCache<K, V> {
        let runtime = self.runtime.unwrap_or_else(Handle::current);
        let inner = Inner {
            name: self.name.into(),
            factory: self.factory,
            policy: self.policy,
            state: Mutex::new(State {
                entries: HashMap::new(),
                next_registration: 0,
                idle: 0,
            }),
            scope: CancellationToken::new(),
            runtime,
            policy_error: OnceLock::new(),
        };
        KeyedCache {
            inner: Arc::new(inner),
        }
    }
}

/// A reference to a cached element.
///
/// Dropping the reference releases it. If that makes the entry idle, it is registered with
/// the eviction policy right away.
pub struct CacheRef<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<K, V>>,
    key: K,
    value: V,
}

impl<K, V> CacheRef<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn new(inner: Arc<Inner<K, V>>, key: K, value: V) -> Self {
        Self { inner, key, value }
    }

    /// The key of the referenced entry.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The referenced element.
    pub fn value(&self) -> &V {
        &self.value
    }
}

impl<K, V> Clone for CacheRef<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        let mut state = self.inner.state();
        // an outstanding reference keeps the entry in the table
        if let Some(entry) = state.entries.get_mut(&self.key) {
            entry.refs += 1;
        }
        drop(state);
        Self::new(Arc::clone(&self.inner), self.key.clone(), self.value.clone())
    }
}

impl<K, V> Deref for CacheRef<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Target = V;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<K, V> fmt::Debug for CacheRef<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRef")
            .field("cache", &self.inner.name)
            .field("key", &self.key)
            .finish()
    }
}

impl<K, V> Drop for CacheRef<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::{self, join_all};
    use refcache_test::{CallCounter, eventually};
    use tokio::sync::{Barrier, oneshot as tokio_oneshot};

    use super::*;
    use crate::eviction::{BoundedIdle, GracePeriod, RetainForever, UnusedCount};

    #[derive(Debug)]
    struct Resource {
        key: &'static str,
        serial: usize,
        scope: EntryScope,
    }

    type ResourceCache = KeyedCache<&'static str, Arc<Resource>>;

    fn factory(
        calls: &CallCounter,
    ) -> impl Fn(&EntryScope, &&'static str) -> Arc<Resource> + Send + Sync + 'static {
        let calls = calls.clone();
        move |scope: &EntryScope, key: &&'static str| {
            Arc::new(Resource {
                key: *key,
                serial: calls.tick(),
                scope: scope.clone(),
            })
        }
    }

    async fn get(cache: &ResourceCache, key: &'static str) -> Arc<Resource> {
        cache.with(key, |resource| async move { resource }).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_creation() {
        refcache_test::setup();

        let calls = CallCounter::default();
        let cache = KeyedCache::new(factory(&calls));
        let barrier = Arc::new(Barrier::new(32));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let cache = cache.clone();
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    cache
                        .with("shared", |resource| async move {
                            // everyone holds the element at the same time
                            barrier.wait().await;
                            resource
                        })
                        .await
                })
            })
            .collect();

        let resources: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(calls.get(), 1);
        assert!(
            resources
                .iter()
                .all(|resource| Arc::ptr_eq(resource, &resources[0]))
        );
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_ref_count_conservation() {
        let calls = CallCounter::default();
        let cache = KeyedCache::new(factory(&calls));

        let first = cache.acquire("a");
        let second = cache.acquire("a");
        let third = first.clone();
        assert_eq!(cache.ref_count(&"a"), Some(3));
        assert_eq!(first.key(), &"a");
        assert_eq!(third.serial, 0);

        drop(first);
        drop(second);
        assert_eq!(cache.ref_count(&"a"), Some(1));

        // releasing the last reference removes the entry when there is no policy
        let scope = third.scope.clone();
        drop(third);
        assert_eq!(cache.ref_count(&"a"), None);
        assert!(scope.is_cancelled());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_reacquire_cancels_eviction() {
        let calls = CallCounter::default();
        let policy = UnusedCount::new();
        let cache = KeyedCache::builder(factory(&calls))
            .eviction_policy(policy.clone())
            .build();

        let first = get(&cache, "a").await;
        assert_eq!(cache.idle_count(), 1);
        assert_eq!(policy.idle_count(), 1);

        let second = get(&cache, "a").await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.get(), 1);

        // the first idle period ended with the reacquire, only the second one is waiting
        assert_eq!(policy.idle_count(), 1);
        assert_eq!(cache.idle_count(), 1);
        assert!(!first.scope.is_cancelled());

        assert_eq!(policy.drop_oldest(1), 1);
        first.scope.cancelled().await;
        eventually(|| cache.is_empty()).await;

        let third = get(&cache, "a").await;
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_bounded_idle_evicts_oldest() {
        let calls = CallCounter::default();
        let cache = KeyedCache::builder(factory(&calls))
            .name("bounded")
            .eviction_policy(BoundedIdle::new(2))
            .build();

        let a = get(&cache, "a").await;
        let b = get(&cache, "b").await;
        let c = get(&cache, "c").await;

        tokio::time::timeout(Duration::from_secs(5), a.scope.cancelled())
            .await
            .unwrap();
        eventually(|| !cache.contains_key(&"a")).await;
        assert!(cache.contains_key(&"b"));
        assert!(cache.contains_key(&"c"));
        assert_eq!(cache.idle_count(), 2);
        assert!(!b.scope.is_cancelled());
        assert!(!c.scope.is_cancelled());

        let recreated = get(&cache, "a").await;
        assert_eq!(recreated.key, "a");
        assert!(!Arc::ptr_eq(&a, &recreated));
        assert_eq!(calls.get(), 4);

        // recreating `a` made `b` the oldest idle entry
        b.scope.cancelled().await;
        eventually(|| !cache.contains_key(&"b")).await;
    }

    #[tokio::test]
    async fn test_reacquire_before_eviction_task_runs() {
        let calls = CallCounter::default();
        let policy = BoundedIdle::new(2);
        let unused = policy.unused().clone();
        let cache = KeyedCache::builder(factory(&calls))
            .eviction_policy(policy)
            .build();

        let a = get(&cache, "a").await;

        // release and take `b` back without giving its eviction task a chance to run
        let b = cache.acquire("b");
        drop(b);
        let b = cache.acquire("b");

        let c = get(&cache, "c").await;
        assert_eq!(unused.idle_count(), 2);
        assert_eq!(cache.idle_count(), 2);

        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        assert!(cache.contains_key(&"a"));
        assert!(cache.contains_key(&"c"));
        assert!(!a.scope.is_cancelled());
        assert!(!c.scope.is_cancelled());
        assert_eq!(cache.ref_count(&"b"), Some(1));
        assert_eq!(unused.idle_count(), 2);
        assert_eq!(cache.idle_count(), 2);

        drop(b);
        assert_eq!(unused.idle_count(), 2);
        a.scope.cancelled().await;
        eventually(|| !cache.contains_key(&"a")).await;
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_overflow_is_evaluated_at_release() {
        let calls = CallCounter::default();
        let policy = BoundedIdle::new(1);
        let unused = policy.unused().clone();
        let cache = KeyedCache::builder(factory(&calls))
            .eviction_policy(policy)
            .build();

        let a = get(&cache, "a").await;

        // `b` is idle next to `a` for a moment, which overflows the policy right away
        let b = cache.acquire("b");
        drop(b);
        let b = cache.acquire("b");
        assert_eq!(unused.idle_count(), 0);

        a.scope.cancelled().await;
        eventually(|| cache.idle_count() == 0).await;
        assert!(!cache.contains_key(&"a"));
        assert_eq!(cache.ref_count(&"b"), Some(1));
        assert!(!b.scope.is_cancelled());
        assert_eq!(unused.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_release_on_cancellation() {
        let calls = CallCounter::default();
        let cache = KeyedCache::new(factory(&calls));

        let task = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.with("a", |_| future::pending::<()>()).await })
        };
        eventually(|| cache.ref_count(&"a") == Some(1)).await;

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(cache.ref_count(&"a"), None);
    }

    #[tokio::test]
    async fn test_release_on_panic() {
        let calls = CallCounter::default();
        let cache = KeyedCache::new(factory(&calls));

        let result = std::panic::AssertUnwindSafe(cache.with("a", |resource| async move {
            assert!(resource.key.is_empty(), "block failed");
        }))
        .catch_unwind()
        .await;

        assert!(result.is_err());
        assert!(cache.is_empty());

        // the cache stays usable
        assert_eq!(get(&cache, "a").await.serial, 1);
    }

    #[tokio::test]
    async fn test_no_cross_key_blocking() {
        let calls = CallCounter::default();
        let cache = KeyedCache::new(factory(&calls));
        let (unblock, blocked) = tokio_oneshot::channel::<()>();

        let holder = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .with("slow", |_| async move {
                        blocked.await.ok();
                    })
                    .await
            })
        };
        eventually(|| cache.contains_key(&"slow")).await;

        // using another key neither waits for the holder nor disturbs it
        let nested = cache
            .with("fast", |fast| {
                let cache = cache.clone();
                async move {
                    let other = get(&cache, "other").await;
                    (fast.key, other.key)
                }
            })
            .await;
        assert_eq!(nested, ("fast", "other"));
        assert_eq!(cache.ref_count(&"slow"), Some(1));

        unblock.send(()).unwrap();
        holder.await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_with_all() {
        let calls = CallCounter::default();
        let cache = KeyedCache::new(factory(&calls));

        let keys = cache
            .with_all(["a", "b", "a"], |resources| {
                let cache = cache.clone();
                async move {
                    assert_eq!(cache.ref_count(&"a"), Some(1));
                    assert_eq!(cache.ref_count(&"b"), Some(1));
                    let mut keys: Vec<_> = resources.values().map(|r| r.key).collect();
                    keys.sort();
                    keys
                }
            })
            .await;

        assert_eq!(keys, ["a", "b"]);
        assert_eq!(calls.get(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_grace_period() {
        tokio::time::pause();

        let calls = CallCounter::default();
        let cache = KeyedCache::builder(factory(&calls))
            .eviction_policy(GracePeriod::new(Duration::from_secs(10)))
            .build();

        let resource = get(&cache, "a").await;
        assert_eq!(cache.idle_count(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(cache.contains_key(&"a"));

        resource.scope.cancelled().await;
        assert!(!cache.contains_key(&"a"));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_policy_failure_keeps_entry() {
        refcache_test::setup();

        let calls = CallCounter::default();
        let cache = KeyedCache::builder(factory(&calls))
            .eviction_policy(|_key: &&'static str, _value: &Arc<Resource>| {
                future::ready(Err::<(), _>(PolicyError::Failed("unavailable".into()))).boxed()
            })
            .build();

        let resource = get(&cache, "a").await;
        eventually(|| cache.policy_error().is_some()).await;

        assert_eq!(
            cache.policy_error(),
            Some(PolicyError::Failed("unavailable".into()))
        );
        assert!(cache.contains_key(&"a"));
        assert_eq!(cache.idle_count(), 0);
        assert!(!resource.scope.is_cancelled());

        // the entry is still served from the cache
        let again = get(&cache, "a").await;
        assert!(Arc::ptr_eq(&resource, &again));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_close_cancels_scopes() {
        let calls = CallCounter::default();
        let cache = KeyedCache::builder(factory(&calls))
            .eviction_policy(RetainForever)
            .build();

        let idle = get(&cache, "idle").await;
        let used = cache.acquire("used");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.idle_count(), 1);

        cache.close();
        assert!(cache.is_closed());
        assert_eq!(cache.idle_count(), 0);
        assert!(idle.scope.is_cancelled());
        assert!(used.scope.is_cancelled());
        assert!(!cache.contains_key(&"idle"));

        // in-use entries go away once released, without consulting the policy
        drop(used);
        assert!(cache.is_empty());

        let late = cache.acquire("late");
        assert!(late.scope.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_element_is_shared() {
        let calls = CallCounter::default();
        let cache = {
            let calls = calls.clone();
            KeyedCache::builder(move |_scope: &EntryScope, key: &u32| {
                calls.tick();
                Arc::new(Err::<u32, String>(format!("no resource for {key}")))
            })
            .eviction_policy(RetainForever)
            .build()
        };

        let first = cache.with(7, |result| async move { result }).await;
        let second = cache.with(7, |result| async move { result }).await;

        assert_eq!(*first, Err("no resource for 7".to_owned()));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "which is not cached")]
    async fn test_release_unknown_key() {
        let calls = CallCounter::default();
        let cache: ResourceCache = KeyedCache::new(factory(&calls));
        cache.inner.release(&"missing");
    }
}
