//! Lock acquisition: single attempt, retrying, and coalesced

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coalesce::CallGroup;
use crate::config::LockConfig;
use crate::error::{LockError, Result};
use crate::handle::LockHandle;
use crate::retry::RetryStrategy;
use crate::store::LockStore;

/// Produces ownership tokens
pub type TokenGenerator = Arc<dyn Fn() -> String + Send + Sync>;

type SharedOutcome = Result<Arc<LockHandle>>;

/// Entry point for acquiring distributed locks.
///
/// Cheap to clone; clones share the store and the coalescing table.
#[derive(Clone)]
pub struct LockClient {
    store: Arc<dyn LockStore>,
    calls: Arc<CallGroup<SharedOutcome>>,
    token_generator: TokenGenerator,
}

impl LockClient {
    /// Create a client generating UUID v4 ownership tokens.
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            calls: Arc::new(CallGroup::new()),
            token_generator: Arc::new(|| uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Replace the ownership token generator.
    ///
    /// Tokens must be unique across every process contending for the same keys.
    pub fn with_token_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.token_generator = Arc::new(generator);
        self
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    /// Number of keys with a coalesced acquisition in flight
    pub fn coalesced_in_flight(&self) -> usize {
        self.calls.in_flight()
    }

    /// Make a single acquisition attempt.
    ///
    /// Fails with [`LockError::Contended`] if the key is held, and with
    /// [`LockError::Timeout`] if the store does not answer within `timeout`.
    pub async fn try_acquire(
        &self,
        key: &str,
        lease: Duration,
        timeout: Duration,
    ) -> Result<LockHandle> {
        validate(key, lease)?;
        let token = (self.token_generator)();

        let acquired = tokio::time::timeout(timeout, self.store.set_if_absent(key, &token, lease))
            .await
            .map_err(|_| LockError::Timeout(timeout))??;

        if !acquired {
            debug!(key = %key, "Lock is held by another owner");
            return Err(LockError::contended(key));
        }

        debug!(key = %key, lease = ?lease, "Lock acquired");
        Ok(LockHandle::new(self.store.clone(), key, token, lease))
    }

    /// Acquire `key`, retrying on contention and on attempt timeouts.
    ///
    /// Each attempt is bounded by `attempt_timeout`. Between attempts the
    /// interval from `retry` is awaited unless `cancel` fires first. The
    /// terminal error tells the caller how safe it is to retry:
    ///
    /// - [`LockError::Contended`]: retries exhausted. If its source is a
    ///   [`LockError::Timeout`] the last attempt's outcome is unknown.
    /// - [`LockError::Store`]: the store failed; nothing is known.
    /// - [`LockError::Cancelled`]: `cancel` fired first.
    pub async fn acquire<R>(
        &self,
        key: &str,
        lease: Duration,
        mut retry: R,
        attempt_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockHandle>
    where
        R: RetryStrategy,
    {
        validate(key, lease)?;
        // One token for every attempt, so an attempt applied by the store after
        // its local timeout is recognised by the next one.
        let token = (self.token_generator)();
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled);
            }
            attempts += 1;

            let attempt =
                tokio::time::timeout(attempt_timeout, self.store.acquire(key, &token, lease)).await;
            let last_error = match attempt {
                Ok(Ok(true)) => {
                    debug!(key = %key, attempts, lease = ?lease, "Lock acquired");
                    return Ok(LockHandle::new(self.store.clone(), key, token, lease));
                }
                Ok(Ok(false)) => None,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => Some(LockError::Timeout(attempt_timeout)),
            };

            let Some(interval) = retry.next() else {
                warn!(
                    key = %key,
                    attempts,
                    last_attempt_timed_out = last_error.is_some(),
                    "Lock retries exhausted"
                );
                return Err(LockError::Contended {
                    key: key.to_string(),
                    source: last_error.map(Box::new),
                });
            };

            debug!(key = %key, attempts, ?interval, "Lock busy, backing off");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LockError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// [`acquire`](Self::acquire) with lease, timeout and retry policy taken
    /// from `config`.
    pub async fn acquire_with_config(
        &self,
        key: &str,
        config: &LockConfig,
        cancel: &CancellationToken,
    ) -> Result<LockHandle> {
        self.acquire(
            key,
            config.lease(),
            config.retry_strategy(),
            config.attempt_timeout(),
            cancel,
        )
        .await
    }

    /// Acquire `key`, sharing the work with concurrent local callers.
    ///
    /// The first caller for a key runs [`acquire`](Self::acquire) with its own
    /// arguments on a background task; callers arriving while it is in flight
    /// wait for the same outcome and receive the same handle or error. A waiter
    /// whose `cancel` fires returns [`LockError::Cancelled`] and leaves the
    /// in-flight acquisition alone. The acquisition itself observes the
    /// leader's `cancel`; if that ends it, waiters whose own `cancel` has not
    /// fired join or lead a fresh acquisition with their own arguments.
    pub async fn acquire_coalesced<R>(
        &self,
        key: &str,
        lease: Duration,
        retry: R,
        attempt_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<LockHandle>>
    where
        R: RetryStrategy + Send + 'static,
    {
        validate(key, lease)?;

        // Only consumed if this caller ends up leading a sequence
        let mut retry = Some(retry);
        loop {
            let client = self.clone();
            let owned_key = key.to_string();
            let owned_cancel = cancel.clone();
            let slot = &mut retry;
            let outcome = self
                .calls
                .run(key, cancel, move || {
                    let retry = slot.take();
                    async move {
                        let Some(retry) = retry else {
                            return Err(LockError::Cancelled);
                        };
                        client
                            .acquire(&owned_key, lease, retry, attempt_timeout, &owned_cancel)
                            .await
                            .map(Arc::new)
                    }
                })
                .await;

            match outcome {
                None => return Err(LockError::Cancelled),
                Some(Err(LockError::Cancelled)) if !cancel.is_cancelled() && retry.is_some() => {
                    debug!(key = %key, "Shared acquisition cancelled by its leader, rejoining");
                }
                Some(outcome) => return outcome,
            }
        }
    }
}

impl fmt::Debug for LockClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockClient")
            .field("coalesced_in_flight", &self.calls.in_flight())
            .finish_non_exhaustive()
    }
}

fn validate(key: &str, lease: Duration) -> Result<()> {
    if key.is_empty() {
        return Err(LockError::InvalidArgument(
            "lock key must not be empty".to_string(),
        ));
    }
    if lease.is_zero() {
        return Err(LockError::InvalidArgument(
            "lease must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
