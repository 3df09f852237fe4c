//! A keyed cache of shared resources with reference counting and deferred eviction.
//!
//! The [`KeyedCache`] lazily creates one element per key and shares it between everyone
//! using that key at the same time. Once an element is no longer in use, an
//! [`EvictionPolicy`] decides when it is actually removed. Using the key again before that
//! point reuses the cached element.
//!
//! Building on top of that, the [`BroadcastCache`] shares one continuously updating stream per
//! key among all of its subscribers.
//!
//! The [`race`] module contains the future combinators the cache is built with.

#![warn(missing_docs)]

#[macro_use]
pub mod metrics;

mod broadcast;
mod cache;
mod config;
mod error;
mod eviction;
pub mod race;
mod scope;

pub use broadcast::*;
pub use cache::*;
pub use config::*;
pub use error::*;
pub use eviction::*;
pub use scope::*;
