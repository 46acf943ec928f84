//! Store abstraction
//!
//! The lock client only relies on four atomic primitives of the backing
//! key-value store. Each one must be atomic from the store's point of view;
//! how that is achieved (SET NX, Lua scripts, a local map shard lock) is up to
//! the implementation.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Atomic primitives required from the backing key-value store.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` to `token` with a TTL of `lease` only if `key` does not exist.
    ///
    /// Returns `true` if the value was written.
    async fn set_if_absent(&self, key: &str, token: &str, lease: Duration)
    -> Result<bool, StoreError>;

    /// Like [`set_if_absent`](Self::set_if_absent), but if `key` already holds
    /// `token` the TTL is reset to `lease` and the call succeeds.
    ///
    /// Used by retrying acquisition, where an attempt that timed out locally may
    /// still have been applied by the store.
    async fn acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool, StoreError>;

    /// Reset the TTL of `key` to `lease` if its value equals `token`.
    ///
    /// Returns `false` without mutating anything on mismatch or absence.
    async fn extend_if_owner(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete `key` if its value equals `token`; returns the number of keys
    /// deleted.
    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<u64, StoreError>;
}
