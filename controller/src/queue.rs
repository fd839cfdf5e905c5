use crate::kubernetes::ObjectKey;
use std::collections::{HashSet, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A deduplicated FIFO of object keys, drained by a single worker.
///
/// Enqueueing a key that is already pending is a no-op. A key is removed from
/// the pending set before its sync runs, so a key re-enqueued during its own
/// sync is processed again afterwards. Ordering across different keys is not
/// guaranteed.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct State {
    order: VecDeque<ObjectKey>,
    pending: HashSet<ObjectKey>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn enqueue(&self, key: ObjectKey) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.pending.insert(key.clone()) {
            state.order.push_back(key);
            self.inner.notify.notify_one();
        }
    }

    pub fn requeue(&self, key: ObjectKey, err: &dyn Display) {
        error!(key = %key, %err, "requeuing");
        self.enqueue(key);
    }

    /// Schedules a future enqueue without blocking the worker.
    pub fn requeue_after(&self, key: ObjectKey, err: &dyn Display, delay: Duration) {
        error!(key = %key, %err, delay = ?delay, "requeuing after delay");
        let queue = self.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            queue.enqueue(key);
        });
    }

    /// Stops the worker after it finishes its current item.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
    }

    /// Pops keys and hands each to `sync` serially until shutdown. `period`
    /// bounds how long the worker sleeps between polls when idle.
    pub async fn run<F, Fut>(&self, period: Duration, sync: F)
    where
        F: Fn(ObjectKey) -> Fut,
        Fut: Future<Output = ()>,
    {
        while let Some(key) = self.next(period).await {
            debug!(key = %key, "syncing from task queue");
            sync(key).await;
        }
    }

    async fn next(&self, period: Duration) -> Option<ObjectKey> {
        loop {
            if self.inner.shutdown.is_cancelled() {
                return None;
            }

            {
                let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(key) = state.order.pop_front() {
                    state.pending.remove(&key);
                    return Some(key);
                }
            }

            tokio::select! {
                () = self.inner.notify.notified() => {}
                () = self.inner.shutdown.cancelled() => return None,
                () = sleep(period) => {}
            }
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn key(s: &str) -> ObjectKey {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn keys_are_deduplicated_while_pending() {
        let queue = TaskQueue::new();
        queue.enqueue(key("default/a"));
        queue.enqueue(key("default/a"));
        queue.enqueue(key("default/b"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .run(Duration::from_millis(10), |key| {
                        let tx = tx.clone();
                        async move {
                            tx.send(key).unwrap();
                        }
                    })
                    .await;
            })
        };

        assert_eq!(rx.recv().await.unwrap(), key("default/a"));
        assert_eq!(rx.recv().await.unwrap(), key("default/b"));

        queue.shutdown();
        worker.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn key_enqueued_during_its_own_sync_runs_again() {
        let queue = TaskQueue::new();
        let syncs = Arc::new(AtomicUsize::new(0));

        queue.enqueue(key("default/a"));

        let worker = {
            let queue = queue.clone();
            let inner_queue = queue.clone();
            let syncs = syncs.clone();
            tokio::spawn(async move {
                queue
                    .run(Duration::from_millis(10), |key| {
                        let queue = inner_queue.clone();
                        let syncs = syncs.clone();
                        async move {
                            if syncs.fetch_add(1, Ordering::SeqCst) == 0 {
                                // Re-enqueue while this key's sync is running.
                                queue.enqueue(key);
                            } else {
                                queue.shutdown();
                            }
                        }
                    })
                    .await;
            })
        };

        worker.await.unwrap();
        assert_eq!(syncs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_after_defers_the_enqueue() {
        let queue = TaskQueue::new();
        queue.requeue_after(key("default/a"), &"sync failed", Duration::from_secs(5));

        // Nothing pending until the delay elapses.
        tokio::time::sleep(Duration::from_secs(1)).await;
        {
            let state = queue.inner.state.lock().unwrap();
            assert!(state.order.is_empty());
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        let popped = queue.next(Duration::from_millis(10)).await;
        assert_eq!(popped, Some(key("default/a")));
    }

    #[tokio::test]
    async fn shutdown_stops_an_idle_worker() {
        let queue = TaskQueue::new();
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.run(Duration::from_millis(10), |_| async {}).await;
            })
        };

        queue.shutdown();
        worker.await.unwrap();
    }
}
