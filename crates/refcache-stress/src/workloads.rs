use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use refcache::{EntryScope, KeyedCache};
use serde::{Deserialize, Serialize};

/// Identifies a resource: the workload it belongs to and its index in the key space.
pub type ResourceKey = (usize, u64);

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// The number of operations running at the same time.
    pub concurrency: usize,
    /// The size of the key space the operations pick their keys from.
    pub keys: u64,
    /// How long each operation holds on to its resources.
    #[serde(with = "humantime_serde", default)]
    pub hold: Duration,
    /// The number of keys used by a single operation.
    #[serde(default = "default_fanout")]
    pub fanout: usize,
}

fn default_fanout() -> usize {
    1
}

/// The resource created by the stresstest cache.
#[derive(Debug)]
pub struct Resource {
    pub key: ResourceKey,
    pub payload: Box<[u8]>,
}

pub type ResourceCache = KeyedCache<ResourceKey, Arc<Resource>>;

/// Creates a resource with a bit of payload, and keeps the scope busy while it is cached.
pub fn create_resource(scope: &EntryScope, key: &ResourceKey) -> Arc<Resource> {
    let resource = Arc::new(Resource {
        key: *key,
        payload: vec![key.1 as u8; 1024].into_boxed_slice(),
    });

    let heartbeat = Arc::downgrade(&resource);
    scope.spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        loop {
            interval.tick().await;
            if heartbeat.strong_count() == 0 {
                break;
            }
        }
    });

    resource
}

/// A prepared workload, picking the keys of its operations.
#[derive(Debug)]
pub struct PreparedWorkload {
    pub index: usize,
    pub concurrency: usize,
    keys: u64,
    hold: Duration,
    fanout: usize,
    next_op: AtomicU64,
}

impl PreparedWorkload {
    pub fn new(index: usize, workload: Workload) -> Self {
        Self {
            index,
            concurrency: workload.concurrency,
            keys: workload.keys.max(1),
            hold: workload.hold,
            fanout: workload.fanout.max(1),
            next_op: AtomicU64::new(0),
        }
    }

    /// The keys of the next operation.
    ///
    /// Keys are spread over the key space with a multiplicative hash of the operation number,
    /// so that consecutive operations hit different keys.
    fn next_keys(&self) -> Vec<ResourceKey> {
        let op = self.next_op.fetch_add(1, Ordering::Relaxed);
        (0..self.fanout as u64)
            .map(|i| {
                let spread = op.wrapping_add(i).wrapping_mul(0x9E37_79B9_7F4A_7C15);
                (self.index, spread % self.keys)
            })
            .collect()
    }
}

/// Runs a single operation of `workload` against `cache`.
pub async fn process_operation(cache: &ResourceCache, workload: &PreparedWorkload) {
    let mut keys = workload.next_keys();
    let hold = workload.hold;

    if keys.len() == 1 {
        let key = keys.remove(0);
        cache
            .with(key, |resource| async move {
                debug_assert_eq!(resource.key, key);
                tokio::time::sleep(hold).await;
            })
            .await;
    } else {
        cache
            .with_all(keys, |resources| async move {
                debug_assert!(resources.values().all(|r| !r.payload.is_empty()));
                tokio::time::sleep(hold).await;
            })
            .await;
    }
}
