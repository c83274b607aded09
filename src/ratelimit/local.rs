//! In-process window store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backend::{Decision, WindowStore};
use super::window::WindowState;
use crate::error::RateLimitError;

/// Window store that keeps all state in this process.
///
/// One lock covers the whole table, so every decision for a key is a single
/// critical section: expiry checks, comparison and increment happen together
/// and concurrent callers are strictly serialized. The lock is never held
/// across an await point.
#[derive(Default)]
pub struct LocalStore {
    /// Window and block state indexed by store key
    entries: Mutex<HashMap<String, WindowState>>,
}

impl LocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide for `key` as if the request arrived at `now`.
    pub fn allow_at(&self, key: &str, limit: u32, block: Duration, now: Instant) -> Decision {
        let mut entries = self.entries.lock();

        let state = entries.entry(key.to_string()).or_insert_with(|| {
            trace!(key = %key, "Creating window state");
            WindowState::new()
        });

        state.decide(now, limit, block)
    }

    /// Forget everything known about `key`.
    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Drop entries whose block or window has fully expired.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, state| !state.is_stale(now));
        before - entries.len()
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Requests admitted for `key` in its current window.
    ///
    /// Returns `None` if the key has never been seen or was swept.
    pub fn count(&self, key: &str) -> Option<u32> {
        self.entries.lock().get(key).map(WindowState::count)
    }

    /// Run [`LocalStore::sweep`] every `interval` on a background task.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let removed = self.sweep();
                if removed > 0 {
                    debug!(removed = removed, remaining = self.len(), "Swept expired rate limit state");
                }
            }
        })
    }
}

#[async_trait]
impl WindowStore for LocalStore {
    async fn allow(
        &self,
        key: &str,
        limit: u32,
        block: Duration,
    ) -> Result<Decision, RateLimitError> {
        Ok(self.allow_at(key, limit, block, Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_sixth_request_denied() {
        let store = LocalStore::new();
        let block = Duration::from_secs(2);

        for i in 1..=5 {
            let decision = assert_ok!(store.allow("ip:1.2.3.4", 5, block).await);
            assert!(decision.allowed, "Request {} should be allowed", i);
        }

        let decision = assert_ok!(store.allow("ip:1.2.3.4", 5, block).await);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, block);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_expires() {
        let store = LocalStore::new();
        let block = Duration::from_millis(100);

        assert!(store.allow("test-key", 1, block).await.unwrap().allowed);

        let denied = store.allow("test-key", 1, block).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after > Duration::ZERO && denied.retry_after <= block);

        tokio::time::advance(block + Duration::from_millis(50)).await;

        assert!(store.allow("test-key", 1, block).await.unwrap().allowed);
        assert_eq!(store.count("test-key"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_non_increasing_while_blocked() {
        let store = LocalStore::new();
        let block = Duration::from_secs(1);

        store.allow("k", 1, block).await.unwrap();
        let mut previous = store.allow("k", 1, block).await.unwrap().retry_after;

        for _ in 0..9 {
            tokio::time::advance(Duration::from_millis(100)).await;
            let decision = store.allow("k", 1, block).await.unwrap();
            assert!(!decision.allowed);
            assert!(decision.retry_after > Duration::ZERO);
            assert!(decision.retry_after <= previous);
            previous = decision.retry_after;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_are_exact() {
        let store = Arc::new(LocalStore::new());
        let block = Duration::from_secs(1);

        let handles: Vec<_> = (0..15)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.allow("ip:shared", 10, block).await })
            })
            .collect();

        let mut admitted = 0;
        let mut denied = 0;
        for result in futures::future::join_all(handles).await {
            if result.unwrap().unwrap().allowed {
                admitted += 1;
            } else {
                denied += 1;
            }
        }

        assert_eq!(admitted, 10);
        assert_eq!(denied, 5);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let store = LocalStore::new();
        let block = Duration::from_secs(1);

        store.allow("a", 1, block).await.unwrap();
        assert!(!store.allow("a", 1, block).await.unwrap().allowed);

        assert!(store.allow("b", 1, block).await.unwrap().allowed);
        assert_eq!(store.count("b"), Some(1));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_clear_resets_key() {
        let store = LocalStore::new();
        let block = Duration::from_secs(60);

        store.allow("k", 1, block).await.unwrap();
        assert!(!store.allow("k", 1, block).await.unwrap().allowed);

        store.clear("k");
        assert_eq!(store.count("k"), None);
        assert!(store.allow("k", 1, block).await.unwrap().allowed);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let store = LocalStore::new();
        let start = Instant::now();
        let block = Duration::from_secs(10);

        // Open key whose window will expire.
        store.allow_at("open", 5, block, start);
        // Key that enters a long block.
        store.allow_at("blocked", 1, block, start);
        store.allow_at("blocked", 1, block, start);

        assert_eq!(store.sweep_at(start), 0);
        assert_eq!(store.sweep_at(start + Duration::from_secs(2)), 1);
        assert_eq!(store.count("open"), None);
        assert_eq!(store.count("blocked"), Some(1));

        assert_eq!(store.sweep_at(start + block), 1);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_reclaims_state() {
        let store = Arc::new(LocalStore::new());
        store.allow("k", 5, Duration::from_secs(1)).await.unwrap();

        let handle = store.clone().spawn_sweeper(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.is_empty());

        handle.abort();
    }
}
