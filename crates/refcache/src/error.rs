use thiserror::Error;

/// An error raised by an [`EvictionPolicy`](crate::EvictionPolicy) while waiting for an idle
/// entry to expire.
///
/// The cache never removes an entry whose policy failed. The error is logged and kept around
/// as [`KeyedCache::policy_error`](crate::KeyedCache::policy_error).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// The policy was unable to come to a decision.
    ///
    /// The attached string describes the underlying problem.
    #[error("eviction policy failed: {0}")]
    Failed(String),
}
