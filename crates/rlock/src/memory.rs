//! In-process lock store
//!
//! Keeps tokens in a `DashMap` with a per-entry deadline. Every primitive runs
//! under the shard lock of its key through the entry API, which gives the same
//! atomicity the client expects from a remote store. Deadlines use
//! `tokio::time::Instant` so paused-clock tests observe expiry.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::StoreError;
use crate::store::LockStore;

#[derive(Debug, Clone)]
struct StoredToken {
    token: String,
    expires_at: Instant,
}

impl StoredToken {
    fn new(token: &str, lease: Duration) -> Self {
        Self {
            token: token.to_string(),
            expires_at: Instant::now() + lease,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Lease-expiring token map implementing [`LockStore`].
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    entries: DashMap<String, StoredToken>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a background task purging expired entries every `period`.
    ///
    /// Expired entries are already ignored by every primitive; purging only
    /// bounds memory. The task stops once the store is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(count = purged, "Purged expired lock entries");
                }
            }
        })
    }

    /// Remove expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.entries.len())
    }

    /// Current live token under `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.token.clone())
    }

    /// Remaining lease of `key`, `None` if absent or expired.
    pub fn remaining_lease(&self, key: &str) -> Option<Duration> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.expires_at.saturating_duration_since(Instant::now()))
    }

    /// Unconditionally write `key`, bypassing ownership checks.
    pub fn put(&self, key: &str, token: &str, lease: Duration) {
        self.entries
            .insert(key.to_string(), StoredToken::new(token, lease));
    }

    /// Unconditionally delete `key`.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredToken::new(token, lease));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredToken::new(token, lease));
                Ok(true)
            }
        }
    }

    async fn acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool, StoreError> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.is_expired() || current.token == token {
                    occupied.insert(StoredToken::new(token, lease));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredToken::new(token, lease));
                Ok(true)
            }
        }
    }

    async fn extend_if_owner(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired() && entry.token == token => {
                entry.expires_at = Instant::now() + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<u64, StoreError> {
        let removed = self
            .entries
            .remove_if(key, |_, entry| !entry.is_expired() && entry.token == token);
        Ok(u64::from(removed.is_some()))
    }
}
