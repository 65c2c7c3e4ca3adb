//! Work queue and reconcile workers.
//!
//! A key is held at most once in the queue and is never handed to two
//! workers at the same time. A key added while it is being processed is
//! queued again once the worker calls [`WorkQueue::done`].

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use slinky_reconcile::Backoff;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::api::ObjectKey;
use crate::nodeset::NodeSetReconciler;

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    shutting_down: bool,
}

/// Deduplicating FIFO of NodeSet keys.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // a poisoned queue still holds valid keys
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, key: ObjectKey) {
        let mut state = self.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key. Returns `None` once the queue shuts down.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as no longer being processed.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pulls keys off the queue and reconciles them.
pub struct NodeSetWorker {
    reconciler: Arc<NodeSetReconciler>,
    queue: Arc<WorkQueue>,
    retry: Backoff,
}

impl NodeSetWorker {
    pub fn new(reconciler: Arc<NodeSetReconciler>, queue: Arc<WorkQueue>) -> Self {
        Self {
            reconciler,
            queue,
            retry: Backoff::default(),
        }
    }

    /// Spawn `workers` concurrent loops.
    pub fn spawn(
        self: Arc<Self>,
        workers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|id| {
                let worker = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(id, shutdown).await })
            })
            .collect()
    }

    /// Process keys until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, id: usize, mut shutdown: watch::Receiver<bool>) {
        info!("Starting NodeSet worker");
        loop {
            tokio::select! {
                key = self.queue.get() => {
                    let Some(key) = key else {
                        break;
                    };
                    self.process(key).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.queue.shutdown();
                        break;
                    }
                }
            }
        }
        info!("NodeSet worker shutting down");
    }

    async fn process(&self, key: ObjectKey) {
        let id = key.to_string();
        let result = self.reconciler.reconcile(&key).await;
        self.queue.done(&key);

        match result {
            Ok(stats) => {
                self.retry.reset(&id);
                if let Some(after) = stats.requeue_after {
                    debug!(nodeset = %key, after_ms = after.as_millis() as u64, "Requeueing NodeSet");
                    self.queue.add_after(key, after);
                }
            }
            Err(err) => {
                let delay = self.retry.next(&id, Instant::now());
                error!(nodeset = %key, error = %err, retry_ms = delay.as_millis() as u64, "NodeSet sync failed");
                self.queue.add_after(key, delay);
            }
        }
    }

    /// Drop retry entries nobody has touched in a while.
    pub fn gc(&self) {
        self.retry.gc(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("slurm", name)
    }

    #[tokio::test]
    async fn test_add_deduplicates() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("b"));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await, Some(key("a")));
        assert_eq!(queue.get().await, Some(key("b")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_key_in_flight_is_requeued_on_done() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        let taken = queue.get().await.unwrap();

        queue.add(key("a"));
        assert!(queue.is_empty());

        queue.done(&taken);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key("a")));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add(key("late"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_after_delays() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_after(key("a"), Duration::from_millis(20));
        assert!(queue.is_empty());

        let got = tokio::time::timeout(Duration::from_secs(2), queue.get())
            .await
            .unwrap();
        assert_eq!(got, Some(key("a")));
    }
}
