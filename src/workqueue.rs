use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay(&self, failures: u32) -> Duration {
        // 2^31 times any sane base delay is already far past the cap
        let factor = 2u32.saturating_pow(failures.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    // keys that need processing, whether queued or waiting for an in-flight run to finish
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

/// Deduplicating work queue of string keys with in-flight exclusion and
/// rate-limited requeueing.
///
/// A key is queued at most once. A key that is re-added while it is being
/// processed is held back and queued again when [`WorkQueue::done`] is called,
/// so the same key is never processed by two consumers at once.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: ExponentialBackoff,
}

impl WorkQueue {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // The state stays consistent across every critical section, so a poisoned lock is still usable
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            debug!("Key {} is in flight, deferring until it is done", key);
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            // Registered before the lock is released so no wakeup is lost in between
            let notified = self.inner.notify.notified();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks the end of processing for a key handed out by [`WorkQueue::get`].
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut state = self.state();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.inner.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        debug!("Requeueing key {} in {:?}", key, delay);
        self.add_after(key, delay);
    }

    /// Resets the failure count of a key. Call on every terminal outcome.
    pub fn forget(&self, key: &str) {
        self.state().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    async fn try_get(queue: &WorkQueue) -> Option<String> {
        timeout(Duration::from_millis(50), queue.get()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_add_deduplicates_pending_keys() {
        let queue = WorkQueue::default();
        queue.add("deployment/default/app");
        queue.add("deployment/default/app");
        assert_eq!(queue.len(), 1);

        assert_eq!(try_get(&queue).await.as_deref(), Some("deployment/default/app"));
        assert_eq!(try_get(&queue).await, None);
    }

    #[tokio::test]
    async fn test_readd_while_in_flight_is_deferred_until_done() {
        let queue = WorkQueue::default();
        queue.add("daemonset/default/agent");
        let key = try_get(&queue).await.unwrap();

        queue.add("daemonset/default/agent");
        assert_eq!(queue.len(), 0);
        assert_eq!(try_get(&queue).await, None);

        queue.done(&key);
        assert_eq!(try_get(&queue).await.as_deref(), Some("daemonset/default/agent"));
    }

    #[tokio::test]
    async fn test_done_without_readd_does_not_requeue() {
        let queue = WorkQueue::default();
        queue.add("deployment/default/app");
        let key = try_get(&queue).await.unwrap();
        queue.done(&key);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_keys_are_fifo() {
        let queue = WorkQueue::default();
        queue.add("a");
        queue.add("b");
        queue.add("a");
        queue.add("c");
        assert_eq!(try_get(&queue).await.as_deref(), Some("a"));
        assert_eq!(try_get(&queue).await.as_deref(), Some("b"));
        assert_eq!(try_get(&queue).await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_get_wakes_up_on_add() {
        let queue = WorkQueue::default();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.add("deployment/default/app");
        let key = timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();
        assert_eq!(key.as_deref(), Some("deployment/default/app"));
    }

    #[tokio::test]
    async fn test_shut_down_releases_blocked_get() {
        let queue = WorkQueue::default();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shut_down();
        let key = timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();
        assert_eq!(key, None);

        queue.add("deployment/default/app");
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_requeue_and_forget() {
        let queue = WorkQueue::new(ExponentialBackoff::new(
            Duration::from_millis(1),
            Duration::from_millis(20),
        ));
        queue.add_rate_limited("deployment/default/app");
        queue.add_rate_limited("deployment/default/app");
        assert_eq!(queue.num_requeues("deployment/default/app"), 2);

        let key = timeout(Duration::from_secs(1), queue.get()).await.unwrap();
        assert_eq!(key.as_deref(), Some("deployment/default/app"));

        queue.forget("deployment/default/app");
        assert_eq!(queue.num_requeues("deployment/default/app"), 0);
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::from_millis(5));
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(3), Duration::from_millis(40));
        assert_eq!(backoff.delay(20), Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }
}
