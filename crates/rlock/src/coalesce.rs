//! Call coalescing keyed by string
//!
//! The first caller for a key becomes the leader: its work is spawned on a
//! task and every caller for that key, leader included, waits on a watch
//! channel for the outcome. The entry is dropped from the table as soon as the
//! work finishes, before the outcome is published, so later callers always
//! start fresh work.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub(crate) struct CallGroup<T> {
    calls: DashMap<String, watch::Receiver<Option<T>>>,
}

/// Removes the table entry when the leader's work ends, even if the task is
/// aborted.
struct Forget<T> {
    group: Arc<CallGroup<T>>,
    key: String,
    rx: watch::Receiver<Option<T>>,
}

impl<T> Drop for Forget<T> {
    fn drop(&mut self) {
        self.group
            .calls
            .remove_if(&self.key, |_, rx| rx.same_channel(&self.rx));
    }
}

impl<T> CallGroup<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    /// Number of keys with work in flight
    pub(crate) fn in_flight(&self) -> usize {
        self.calls.len()
    }

    /// Join the in-flight call for `key`, or start one with `work`.
    ///
    /// `work` is only invoked by the leader. Returns `None` if `cancel` fires
    /// before the outcome is ready, or if the work was torn down without
    /// producing one. Cancelling a waiter never touches the in-flight work.
    pub(crate) async fn run<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        cancel: &CancellationToken,
        work: F,
    ) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (mut rx, leader) = match self.calls.entry(key.to_string()) {
            Entry::Occupied(occupied) => (occupied.get().clone(), None),
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(rx.clone());
                (rx, Some(tx))
            }
        };

        if let Some(tx) = leader {
            let forget = Forget {
                group: Arc::clone(self),
                key: key.to_string(),
                rx: rx.clone(),
            };
            let fut = work();
            tokio::spawn(async move {
                let outcome = fut.await;
                drop(forget);
                tx.send_replace(Some(outcome));
            });
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = wait_outcome(&mut rx) => outcome,
        }
    }
}

async fn wait_outcome<T: Clone>(rx: &mut watch::Receiver<Option<T>>) -> Option<T> {
    loop {
        let current = rx.borrow_and_update().clone();
        if current.is_some() {
            return current;
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}
