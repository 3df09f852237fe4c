use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::eviction::{BoundedIdle, EvictionPolicy, GracePeriod, RetainForever};

/// Configuration of a single [`KeyedCache`](crate::KeyedCache).
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// How idle entries are evicted.
    pub eviction: EvictionConfig,
}

/// Selects one of the built-in eviction policies.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvictionConfig {
    /// Remove entries as soon as they become idle.
    #[default]
    Immediate,
    /// Keep up to `max_idle` idle entries, evicting the oldest idle ones first.
    BoundedIdle {
        /// The maximum number of idle entries.
        max_idle: usize,
    },
    /// Keep idle entries for a fixed duration.
    GracePeriod {
        /// How long an entry stays cached after it became idle.
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    /// Never evict entries.
    RetainForever,
}

impl EvictionConfig {
    /// Creates the configured policy.
    ///
    /// Returns `None` for [`Immediate`](Self::Immediate), which needs no policy.
    pub fn policy<K, V>(&self) -> Option<Arc<dyn EvictionPolicy<K, V>>>
    where
        K: fmt::Debug + Clone + Send + Sync + 'static,
    {
        match *self {
            Self::Immediate => None,
            Self::BoundedIdle { max_idle } => Some(Arc::new(BoundedIdle::<K>::new(max_idle))),
            Self::GracePeriod { duration } => Some(Arc::new(GracePeriod::new(duration))),
            Self::RetainForever => Some(Arc::new(RetainForever)),
        }
    }
}
