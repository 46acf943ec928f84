//! Held lock handle: manual refresh, automatic refresh and unlock

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::error::{LockError, Result};
use crate::store::LockStore;

/// Lifecycle of a [`LockHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Acquired and, as far as this process knows, still owned
    Held,
    /// A refresh found the token gone or replaced
    Lost,
    /// Unlock was called
    Released,
}

const STATE_HELD: u8 = 0;
const STATE_LOST: u8 = 1;
const STATE_RELEASED: u8 = 2;

const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(1);

impl LockState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_LOST => LockState::Lost,
            STATE_RELEASED => LockState::Released,
            _ => LockState::Held,
        }
    }
}

/// A lock acquired through [`LockClient`](crate::LockClient).
///
/// Dropping a handle does not release the lock; the store lets it expire when
/// the lease runs out. Call [`unlock`](Self::unlock) to release it early.
pub struct LockHandle {
    store: Arc<dyn LockStore>,
    key: String,
    token: String,
    lease: Duration,
    state: AtomicU8,
    released_tx: watch::Sender<bool>,
    release_signalled: AtomicBool,
}

impl LockHandle {
    pub(crate) fn new(
        store: Arc<dyn LockStore>,
        key: impl Into<String>,
        token: impl Into<String>,
        lease: Duration,
    ) -> Self {
        let (released_tx, _) = watch::channel(false);
        Self {
            store,
            key: key.into(),
            token: token.into(),
            lease,
            state: AtomicU8::new(STATE_HELD),
            released_tx,
            release_signalled: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Ownership token written to the store
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn state(&self) -> LockState {
        LockState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_held(&self) -> bool {
        self.state() == LockState::Held
    }

    /// Whether the release signal has fired
    pub fn is_released(&self) -> bool {
        *self.released_tx.borrow()
    }

    /// Receiver that flips to `true` once [`unlock`](Self::unlock) is called.
    pub fn subscribe_release(&self) -> watch::Receiver<bool> {
        self.released_tx.subscribe()
    }

    /// Refresh period used by [`spawn_auto_refresh`](Self::spawn_auto_refresh)
    /// callers that have no better value: a third of the lease, at least 1ms.
    pub fn default_refresh_interval(&self) -> Duration {
        (self.lease / 3).max(MIN_REFRESH_INTERVAL)
    }

    /// Extend the lease back to its full duration.
    ///
    /// Fails with [`LockError::NotHeld`] if the stored token no longer matches,
    /// in which case the handle becomes [`LockState::Lost`]. Store failures and
    /// an elapsed `timeout` leave the lock state unknown and are returned
    /// unchanged. Once [`unlock`](Self::unlock) has started, refresh reports
    /// `NotHeld` without contacting the store.
    pub async fn refresh(&self, timeout: Duration) -> Result<()> {
        if !self.is_held() || self.is_released() {
            return Err(LockError::not_held(&self.key));
        }

        let extended = tokio::time::timeout(
            timeout,
            self.store
                .extend_if_owner(&self.key, &self.token, self.lease),
        )
        .await
        .map_err(|_| LockError::Timeout(timeout))??;

        if extended {
            debug!(key = %self.key, lease = ?self.lease, "Lock refreshed");
            Ok(())
        } else if self.is_released() {
            // Raced with our own unlock: the key is gone because we deleted it
            debug!(key = %self.key, "Refresh overtaken by unlock");
            Err(LockError::not_held(&self.key))
        } else {
            let _ = self.state.compare_exchange(
                STATE_HELD,
                STATE_LOST,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            warn!(key = %self.key, "Lock lost: token no longer matches");
            Err(LockError::not_held(&self.key))
        }
    }

    /// Release the lock.
    ///
    /// The release signal fires exactly once, before the delete is sent and
    /// whatever the store answers, so that an auto refresh loop never renews a
    /// lock its owner is giving up. Calls after the handle reached a terminal
    /// state return [`LockError::NotHeld`] without contacting the store.
    pub async fn unlock(&self, timeout: Duration) -> Result<()> {
        if !self.is_held() {
            self.signal_release();
            return Err(LockError::not_held(&self.key));
        }

        self.signal_release();
        let deleted = tokio::time::timeout(
            timeout,
            self.store.delete_if_owner(&self.key, &self.token),
        )
        .await;
        self.state.store(STATE_RELEASED, Ordering::SeqCst);

        match deleted {
            Err(_) => Err(LockError::Timeout(timeout)),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(1)) => {
                debug!(key = %self.key, "Lock released");
                Ok(())
            }
            Ok(Ok(_)) => {
                warn!(key = %self.key, "Unlock found the lock held by another owner or expired");
                Err(LockError::not_held(&self.key))
            }
        }
    }

    /// Fire the release signal; returns `false` if it had already fired.
    fn signal_release(&self) -> bool {
        if self.release_signalled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.released_tx.send_replace(true);
        true
    }

    /// Refresh the lease every `interval` until the lock is unlocked.
    ///
    /// Returns `Ok(())` once the release signal is observed and the error of
    /// the first refresh that fails for any reason other than a timeout. A
    /// timed-out refresh is retried right away instead of waiting for the next
    /// tick; timeouts that pile up while a retry is pending collapse into that
    /// single retry.
    ///
    /// `interval` must be non-zero and shorter than the lease, otherwise
    /// [`LockError::InvalidArgument`] is returned before any refresh.
    pub async fn auto_refresh(&self, interval: Duration, timeout: Duration) -> Result<()> {
        if interval.is_zero() || interval >= self.lease {
            return Err(LockError::InvalidArgument(format!(
                "refresh interval {:?} must be within (0, {:?})",
                interval, self.lease
            )));
        }

        let mut released = self.released_tx.subscribe();
        if *released.borrow_and_update() {
            return Ok(());
        }

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (retry_tx, mut retry_rx) = mpsc::channel::<()>(1);

        loop {
            tokio::select! {
                biased;
                _ = released.changed() => return Ok(()),
                _ = ticker.tick() => {}
                Some(()) = retry_rx.recv() => {}
            }

            match self.refresh(timeout).await {
                Ok(()) => {}
                Err(LockError::Timeout(elapsed)) => {
                    debug!(key = %self.key, ?elapsed, "Refresh timed out, retrying immediately");
                    let _ = retry_tx.try_send(());
                }
                Err(_) if self.is_released() => return Ok(()),
                Err(e) => {
                    error!(key = %self.key, error = %e, "Auto refresh stopped");
                    return Err(e);
                }
            }
        }
    }

    /// Run [`auto_refresh`](Self::auto_refresh) on a tokio task.
    pub fn spawn_auto_refresh(
        self: &Arc<Self>,
        interval: Duration,
        timeout: Duration,
    ) -> AutoRefreshTask {
        let handle = Arc::clone(self);
        AutoRefreshTask {
            task: Some(tokio::spawn(async move {
                handle.auto_refresh(interval, timeout).await
            })),
        }
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("lease", &self.lease)
            .field("state", &self.state())
            .finish()
    }
}

/// Background auto refresh loop bound to a [`LockHandle`].
///
/// Dropping the task aborts the loop.
#[derive(Debug)]
pub struct AutoRefreshTask {
    task: Option<JoinHandle<Result<()>>>,
}

impl AutoRefreshTask {
    /// Wait for the loop to end and return its result.
    pub async fn join(mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(LockError::Cancelled),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Stop the loop without releasing the lock.
    pub fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

impl Drop for AutoRefreshTask {
    fn drop(&mut self) {
        self.abort();
    }
}
