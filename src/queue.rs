//! The per-controller work queue.
//!
//! Items are coalesced while they wait: adding an item that is already pending is a no-op.
//! An item handed out by [WorkQueue::get] is *processing* until [WorkQueue::done] is called
//! for it; adding it again in the meantime only marks it dirty, and it is queued again once
//! the current reconcile finishes. This guarantees at most one reconcile in flight per item.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::BackoffConfig;

/// The unit of work: one object on one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkItem {
    pub target: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl WorkItem {
    pub fn new(target: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            namespace: namespace.map(str::to_owned),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}/{}", self.target, namespace, self.name),
            None => write!(f, "{}/{}", self.target, self.name),
        }
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<WorkItem>,
    dirty: HashSet<WorkItem>,
    processing: HashSet<WorkItem>,
    failures: HashMap<WorkItem, u32>,
    shutting_down: bool,
}

pub struct WorkQueue {
    state: Mutex<State>,
    ready: Notify,
    shutdown: CancellationToken,
    backoff: BackoffConfig,
}

impl WorkQueue {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ready: Notify::new(),
            shutdown: CancellationToken::new(),
            backoff,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // No critical section leaves the state half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, item: WorkItem) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }

        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }

        state.queue.push_back(item);
        drop(state);
        self.ready.notify_one();
    }

    /// Adds `item` once `delay` has passed, unless the queue shuts down first.
    pub fn add_after(self: &Arc<Self>, item: WorkItem, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(item),
                _ = queue.shutdown.cancelled() => {}
            }
        });
    }

    /// Adds `item` after its exponential backoff delay and counts the failure.
    pub fn add_rate_limited(self: &Arc<Self>, item: WorkItem) {
        let delay = {
            let mut state = self.state();
            let failures = state.failures.entry(item.clone()).or_default();
            *failures = failures.saturating_add(1);
            self.backoff.delay(*failures)
        };
        self.add_after(item, delay);
    }

    /// Resets the backoff of `item` after it was reconciled successfully.
    pub fn forget(&self, item: &WorkItem) {
        self.state().failures.remove(item);
    }

    pub fn num_requeues(&self, item: &WorkItem) -> u32 {
        self.state().failures.get(item).copied().unwrap_or_default()
    }

    /// Waits for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<WorkItem> {
        loop {
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    if !state.queue.is_empty() {
                        self.ready.notify_one();
                    }
                    return Some(item);
                }
            }

            tokio::select! {
                _ = self.ready.notified() => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    /// Marks `item` as finished, queueing it again if it was added while processing.
    pub fn done(&self, item: &WorkItem) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.ready.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str) -> WorkItem {
        WorkItem::new("seed-a", None, name)
    }

    fn queue() -> Arc<WorkQueue> {
        Arc::new(WorkQueue::new(BackoffConfig::default()))
    }

    #[tokio::test]
    async fn test_repeated_adds_coalesce() {
        // Given: The same item added three times
        let queue = queue();
        queue.add(item("a"));
        queue.add(item("a"));
        queue.add(item("a"));

        // Then: Only one is pending
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(item("a")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_item_added_while_processing_waits_for_done() {
        // Given: An item being processed
        let queue = queue();
        queue.add(item("a"));
        let processing = queue.get().await.unwrap();

        // When: It is added again
        queue.add(item("a"));

        // Then: It is not handed out a second time yet
        assert!(queue.is_empty());

        // When: The first reconcile finishes
        queue.done(&processing);

        // Then: It is queued again exactly once
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(item("a")));
    }

    #[tokio::test]
    async fn test_done_without_readd_does_not_requeue() {
        let queue = queue();
        queue.add(item("a"));
        let processing = queue.get().await.unwrap();

        queue.done(&processing);

        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_items_are_fifo() {
        let queue = queue();
        queue.add(item("a"));
        queue.add(item("b"));

        assert_eq!(queue.get().await, Some(item("a")));
        assert_eq!(queue.get().await, Some(item("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delays_item() {
        // Given: An item scheduled in ten seconds
        let queue = queue();
        queue.add_after(item("a"), Duration::from_secs(10));

        // When: Less time has passed
        tokio::time::sleep(Duration::from_secs(9)).await;

        // Then: Nothing is pending
        assert!(queue.is_empty());

        // When: The delay elapsed
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Then: The item is pending
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backoff_grows_and_forget_resets() {
        // Given: An item that failed twice
        let queue = queue();
        queue.add_rate_limited(item("a"));
        queue.add_rate_limited(item("a"));
        assert_eq!(queue.num_requeues(&item("a")), 2);

        // Then: The first retry arrives after one second
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(queue.len(), 1);

        // When: The item succeeds
        queue.forget(&item("a"));

        // Then: Its backoff starts over
        assert_eq!(queue.num_requeues(&item("a")), 0);
    }

    #[tokio::test]
    async fn test_shut_down_releases_waiting_workers() {
        // Given: A worker waiting on an empty queue
        let queue = queue();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        // When: Shutting down
        queue.shut_down();

        // Then: The worker gets None and new items are ignored
        assert_eq!(waiter.await.unwrap(), None);
        queue.add(item("a"));
        assert!(queue.is_empty());
        assert!(queue.is_shutting_down());
    }

    #[tokio::test]
    async fn test_waiting_worker_wakes_on_add() {
        let queue = queue();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.add(item("a"));

        assert_eq!(waiter.await.unwrap(), Some(item("a")));
    }

    #[test]
    fn test_work_item_display() {
        assert_eq!(WorkItem::new("seed-a", Some("kubermatic"), "c").to_string(), "seed-a/kubermatic/c");
        assert_eq!(WorkItem::new("master", None, "p").to_string(), "master/p");
    }
}
