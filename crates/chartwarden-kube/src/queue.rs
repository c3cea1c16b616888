//! Deduplicating, rate-limited work queue of release keys
//!
//! A key waiting in the queue is never added twice. A key handed to a
//! worker is "processing" until [`WorkQueue::done`]; adding it in the
//! meantime marks it dirty and it is queued again once, after `done`, so two
//! workers never hold the same key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chartwarden_source::ReleaseQueue;
use tokio::sync::Notify;

/// Per-key exponential backoff for failed items
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl RateLimit {
    /// Delay before the `requeues`-th retry (0-based)
    pub fn delay(&self, requeues: u32) -> Duration {
        let factor = 2u32.checked_pow(requeues).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).map_or(self.max, |d| d.min(self.max))
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    /// Keys that need processing: queued, or re-added while processing
    dirty: HashSet<String>,
    processing: HashSet<String>,
    requeues: HashMap<String, u32>,
    shutting_down: bool,
}

pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    rate_limit: RateLimit,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(RateLimit::default())
    }
}

impl WorkQueue {
    pub fn new(rate_limit: RateLimit) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            rate_limit,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue `key` unless it is already waiting
    pub fn add(&self, key: &str) {
        let mut state = self.state();
        if state.shutting_down || !state.dirty.insert(key.to_string()) {
            return;
        }
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Next key to process; `None` once the queue is shut down
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Finish processing `key`; queues it again if it was added meanwhile
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Add `key` after its backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state();
            let requeues = state.requeues.entry(key.to_string()).or_insert(0);
            let delay = self.rate_limit.delay(*requeues);
            *requeues = requeues.saturating_add(1);
            delay
        };

        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Reset the backoff of `key`
    pub fn forget(&self, key: &str) {
        self.state().requeues.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state().requeues.get(key).copied().unwrap_or(0)
    }

    /// Keys waiting to be processed
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys; pending `get` calls return `None`
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

impl ReleaseQueue for WorkQueue {
    fn enqueue(&self, key: &str) {
        self.add(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_keys_are_collapsed() {
        let queue = WorkQueue::default();
        queue.add("flux/app");
        queue.add("flux/app");
        queue.add("flux/other");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("flux/app"));
        assert_eq!(queue.get().await.as_deref(), Some("flux/other"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_key_added_while_processing_is_requeued_once_on_done() {
        let queue = WorkQueue::default();
        queue.add("flux/app");
        let key = queue.get().await.unwrap();

        queue.add("flux/app");
        queue.add("flux/app");
        assert!(queue.is_empty(), "a key being processed must not be handed out twice");

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("flux/app"));
        queue.done("flux/app");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let queue = Arc::new(WorkQueue::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.add("flux/app");
        assert_eq!(waiter.await.unwrap().as_deref(), Some("flux/app"));
    }

    #[tokio::test]
    async fn test_shut_down_releases_waiters() {
        let queue = Arc::new(WorkQueue::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add("flux/app");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_rate_limit_delay() {
        let limit = RateLimit::default();
        assert_eq!(limit.delay(0), Duration::from_millis(5));
        assert_eq!(limit.delay(1), Duration::from_millis(10));
        assert_eq!(limit.delay(10), Duration::from_millis(5120));
        assert_eq!(limit.delay(30), Duration::from_secs(1000));
        assert_eq!(limit.delay(64), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited_backs_off_until_forget() {
        let queue = Arc::new(WorkQueue::default());

        queue.add_rate_limited("flux/app");
        queue.add_rate_limited("flux/app");
        assert_eq!(queue.num_requeues("flux/app"), 2);
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.len(), 1);

        queue.forget("flux/app");
        assert_eq!(queue.num_requeues("flux/app"), 0);
    }
}
