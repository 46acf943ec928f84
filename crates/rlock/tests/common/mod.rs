//! Shared helpers for rlock integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rlock::{LockStore, MemoryLockStore, StoreError};

static TRACING: Once = Once::new();

/// Install a test-writer subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rlock=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    SetIfAbsent,
    Acquire,
    Extend,
    Delete,
}

#[derive(Debug, Clone, Copy)]
struct Delay {
    duration: Duration,
    remaining: usize,
}

/// Memory store with per-operation call counters, response delays and
/// injected failures.
///
/// A delay is applied after the inner operation ran, modelling a reply that
/// arrives late: a caller timing out still leaves the write applied.
#[derive(Default)]
pub struct InstrumentedStore {
    pub inner: MemoryLockStore,
    calls: Mutex<HashMap<Op, usize>>,
    delays: Mutex<HashMap<Op, Delay>>,
    failures: Mutex<HashMap<Op, StoreError>>,
}

impl InstrumentedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self, op: Op) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    /// Delay the reply of the next `times` calls of `op`.
    pub fn delay(&self, op: Op, duration: Duration, times: usize) {
        self.delays.lock().insert(
            op,
            Delay {
                duration,
                remaining: times,
            },
        );
    }

    /// Fail every call of `op` with `err` until cleared.
    pub fn fail(&self, op: Op, err: StoreError) {
        self.failures.lock().insert(op, err);
    }

    pub fn clear_failure(&self, op: Op) {
        self.failures.lock().remove(&op);
    }

    fn enter(&self, op: Op) -> Result<Option<Duration>, StoreError> {
        *self.calls.lock().entry(op).or_default() += 1;
        if let Some(err) = self.failures.lock().get(&op) {
            return Err(err.clone());
        }
        let mut delays = self.delays.lock();
        Ok(match delays.get_mut(&op) {
            Some(delay) if delay.remaining > 0 => {
                delay.remaining -= 1;
                Some(delay.duration)
            }
            _ => None,
        })
    }

    async fn reply<T>(&self, delay: Option<Duration>, value: T) -> T {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        value
    }
}

#[async_trait]
impl LockStore for InstrumentedStore {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let delay = self.enter(Op::SetIfAbsent)?;
        let result = self.inner.set_if_absent(key, token, lease).await;
        self.reply(delay, result).await
    }

    async fn acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool, StoreError> {
        let delay = self.enter(Op::Acquire)?;
        let result = self.inner.acquire(key, token, lease).await;
        self.reply(delay, result).await
    }

    async fn extend_if_owner(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let delay = self.enter(Op::Extend)?;
        let result = self.inner.extend_if_owner(key, token, lease).await;
        self.reply(delay, result).await
    }

    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<u64, StoreError> {
        let delay = self.enter(Op::Delete)?;
        let result = self.inner.delete_if_owner(key, token).await;
        self.reply(delay, result).await
    }
}
