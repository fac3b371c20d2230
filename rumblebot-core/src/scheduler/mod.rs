//! src/scheduler/mod.rs
//!
//! Cancellable delayed callbacks keyed by activity identifier. Engines use
//! this for recruitment timeouts, battle rounds and duration-based endings.
//!
//! Cancellation here is best-effort only: a callback may still fire after
//! the activity it belongs to has ended. Every `advance` entry point
//! re-reads current state and verifies the expected status before acting,
//! so a stale firing is a harmless no-op.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Clone)]
pub struct Scheduler {
    pending: Arc<DashMap<String, JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Register `fut` to run after `delay`. Any timer already pending under
    /// the same key is aborted and replaced.
    pub fn schedule<F>(&self, key: &str, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!("scheduling '{}' in {:?}", key, delay);
        let pending = Arc::clone(&self.pending);
        let cleanup_key = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
            // Only drop our own entry; a newer timer may have replaced us.
            let id = tokio::task::id();
            pending.remove_if(&cleanup_key, |_, h| h.id() == id);
        });
        if let Some(old) = self.pending.insert(key.to_string(), handle) {
            old.abort();
        }
    }

    /// Abort the pending timer for `key`, if any. Returns whether a timer
    /// was actually cancelled.
    pub fn cancel(&self, key: &str) -> bool {
        match self.pending.remove(key) {
            Some((_, handle)) => {
                debug!("cancelled pending timer '{}'", key);
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
