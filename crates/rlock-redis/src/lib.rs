//! Redis backend for the rlock distributed lock client
//!
//! [`RedisLockStore`] implements [`rlock::LockStore`] with `SET NX PX` for
//! single-shot acquisition and server-side Lua scripts for the
//! compare-and-mutate primitives, so every ownership check happens atomically
//! on the server.

pub mod config;
pub mod store;

pub use config::{ENV_PREFIX, RedisStoreConfig};
pub use store::RedisLockStore;
