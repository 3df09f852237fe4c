//! Helpers for testing the cache and its consumers.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test that is interesting to debug, call [`setup`]. This will set up the logger
//!    so that all console output is captured by the test runner.
//!
//!  - Eviction happens on background tasks. Instead of sleeping, use [`eventually`] to wait
//!    for its effects, which also works with a paused clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `refcache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("refcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Counts calls, typically of a cache factory.
///
/// Clones share the same count.
#[derive(Clone, Debug, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    /// Records a call and returns the number of calls before this one.
    pub fn tick(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// The number of recorded calls.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Yields to the runtime until `condition` holds.
///
/// # Panics
///
/// Panics if the condition does not hold after a generous number of attempts.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not met after yielding repeatedly");
}
