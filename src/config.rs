//! Crate-level configuration (C10).
//!
//! Mirrors the teacher's builder-chain pattern for constructing a
//! configured store (`InMemoryTaskStore::new().with_config(...)`):
//! [`EngineConfig`] wraps [`crate::store::StoreConfig`] and exposes the
//! same fluent `with_*` methods `TaskService::new` expects.

use std::time::Duration;

use crate::store::StoreConfig;

/// Top-level knobs for a [`crate::service::TaskService`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use taskgraph_engine::config::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_lock_timeout(Duration::from_secs(5))
///     .with_retry_budget(3);
/// assert_eq!(config.store.lock_acquire_budget, Duration::from_secs(5));
/// assert_eq!(config.lock_retry_budget, 3);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lock acquisition and backoff tuning, passed through to the store.
    pub store: StoreConfig,
    /// How many times [`crate::service::TaskService`]'s internal
    /// `with_lock_retry` helper re-attempts an operation that failed with
    /// [`crate::error::EngineError::LockBusy`] before surfacing it to the
    /// caller (§7 propagation policy).
    pub lock_retry_budget: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            lock_retry_budget: 3,
        }
    }
}

impl EngineConfig {
    /// Overrides the total budget for acquiring the cooperative file lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.store.lock_acquire_budget = timeout;
        self
    }

    /// Overrides the number of service-level retries on `LockBusy`.
    pub fn with_retry_budget(mut self, retries: u32) -> Self {
        self.lock_retry_budget = retries;
        self
    }

    /// Overrides the stale-lock age threshold.
    pub fn with_stale_lock_threshold(mut self, threshold: Duration) -> Self {
        self.store.stale_lock_threshold = threshold;
        self
    }
}
