//! rlock - distributed lock client
//!
//! This crate provides:
//! - Lock acquisition against any store implementing [`LockStore`]:
//!   single attempt, retrying with pluggable backoff, and coalesced across
//!   concurrent local callers
//! - [`LockHandle`] with manual refresh, background auto refresh and unlock
//! - An in-process [`MemoryLockStore`]
//! - Configuration loading for lease, timeouts and retry policy
//!
//! Ownership is proven by a random token stored as the key's value; every
//! renewal and release is a compare-and-mutate against that token executed
//! atomically by the store.

mod coalesce;

pub mod client;
pub mod config;
pub mod error;
pub mod handle;
pub mod memory;
pub mod retry;
pub mod store;

pub use client::{LockClient, TokenGenerator};
pub use config::{ConfigError, LockConfig, RetryPolicyConfig};
pub use error::{LockError, Result, StoreError};
pub use handle::{AutoRefreshTask, LockHandle, LockState};
pub use memory::MemoryLockStore;
pub use retry::{ExponentialBackoffRetry, FixedIntervalRetry, NoRetry, RetryStrategy};
pub use store::LockStore;

// Re-exported so callers do not need a direct tokio-util dependency
pub use tokio_util::sync::CancellationToken;
