//! Named cancellable timers for reconnect backoff and translation deadlines.
//!
//! Each timer is a spawned task keyed by purpose (e.g. "reconnect",
//! "translate:<request_id>"). Scheduling under an existing key cancels and
//! replaces it, so at most one timer per key is ever outstanding. Cancel is
//! idempotent: aborting a finished task is a no-op.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Registry of named delayed tasks.
#[derive(Default)]
pub struct TaskTimers {
    inner: Mutex<HashMap<String, TimerEntry>>,
    generation: AtomicU64,
}

impl TaskTimers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `fut` after `delay`. An existing timer under the same key is
    /// cancelled and replaced, never stacked.
    pub async fn schedule<F>(self: &Arc<Self>, key: &str, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let timers = Arc::clone(self);
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
            timers.discard(&owned_key, generation).await;
        });
        let mut g = self.inner.lock().await;
        if let Some(old) = g.insert(key.to_string(), TimerEntry { generation, handle }) {
            old.handle.abort();
        }
    }

    /// Cancel the timer under `key`, if any. Safe to call after the timer has
    /// fired or been cancelled already.
    pub async fn cancel(&self, key: &str) -> bool {
        let mut g = self.inner.lock().await;
        match g.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Remove a fired timer's own entry, but only if it has not been replaced
    /// by a newer schedule under the same key.
    async fn discard(&self, key: &str, generation: u64) {
        let mut g = self.inner.lock().await;
        if g.get(key).map(|e| e.generation) == Some(generation) {
            g.remove(key);
        }
    }

    /// Number of outstanding (scheduled, not yet fired) timers.
    pub async fn outstanding(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn schedule_replaces_existing_key() {
        let timers = TaskTimers::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let f = Arc::clone(&fired);
            timers
                .schedule("reconnect", Duration::from_millis(30), async move {
                    f.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }
        assert_eq!(timers.outstanding().await, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timers.outstanding().await, 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let timers = TaskTimers::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        timers
            .schedule("deadline", Duration::from_millis(20), async move {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(timers.cancel("deadline").await);
        assert!(!timers.cancel("deadline").await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fired_timer_cleans_up_and_cancel_is_noop() {
        let timers = TaskTimers::new();
        timers
            .schedule("deadline", Duration::from_millis(10), async {})
            .await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(timers.outstanding().await, 0);
        assert!(!timers.cancel("deadline").await);
    }
}
