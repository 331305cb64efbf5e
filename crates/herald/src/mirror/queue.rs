use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::utils::epoch_millis;

use super::MirrorTask;

/// One queued item. The key joins the native queue key components with `/`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueEntry {
    pub key: String,
    pub value: MirrorTask,
    /// Epoch millis before which the entry is not handed out. Not part of
    /// the wire format; restored entries are immediately ready.
    #[serde(skip)]
    pub not_before: u64,
}

/// Per bucket FIFO with per entry delay and a single consumer.
///
/// Entries stay visible until [`ack`](Self::ack): a consumer takes the head
/// with [`next_ready`](Self::next_ready), processes it to a terminal outcome
/// and only then removes it, so a snapshot taken mid flight still contains
/// the task.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    state: Mutex<VecDeque<QueueEntry>>,
    notify: Notify,
}

impl TaskQueue {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub async fn enqueue(&self, task: MirrorTask, delay: Duration) {
        let entry = QueueEntry {
            key: format!("{}/{}", self.inner.name, task.nonce),
            value: task,
            not_before: epoch_millis().saturating_add(delay.as_millis() as u64),
        };
        self.inner.state.lock().await.push_back(entry);
        self.inner.notify.notify_one();
    }

    /// Waits for the head entry to become ready and returns a copy of it.
    /// FIFO order holds even when a later entry's delay expires first.
    pub async fn next_ready(&self) -> QueueEntry {
        loop {
            let notified = self.inner.notify.notified();
            let wait = {
                let state = self.inner.state.lock().await;
                match state.front() {
                    Some(entry) => {
                        let now = epoch_millis();
                        if entry.not_before <= now {
                            return entry.clone();
                        }
                        Some(Duration::from_millis(entry.not_before - now))
                    }
                    None => None,
                }
            };
            match wait {
                Some(delay) => {
                    let _ = tokio::time::timeout(delay, notified).await;
                }
                None => notified.await,
            }
        }
    }

    /// Removes the entry after a terminal outcome.
    pub async fn ack(&self, key: &str) {
        let mut state = self.inner.state.lock().await;
        if let Some(pos) = state.iter().position(|entry| entry.key == key) {
            state.remove(pos);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.state.lock().await.is_empty()
    }

    /// All current entries, for the periodic snapshot.
    pub async fn snapshot(&self) -> Vec<QueueEntry> {
        self.inner.state.lock().await.iter().cloned().collect()
    }

    /// Re-inserts entries rebuilt from a snapshot.
    pub async fn restore(&self, entries: Vec<QueueEntry>) {
        let mut state = self.inner.state.lock().await;
        for entry in entries {
            state.push_back(entry);
        }
        drop(state);
        self.inner.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;

    use crate::backend::{ProxiedRequest, S3Op};
    use crate::config::Registry;
    use crate::config::tests::sample_config;

    fn task(key: &str) -> MirrorTask {
        let registry = Registry::resolve(&sample_config()).unwrap();
        let bucket = registry.get("photos").unwrap();
        let request = ProxiedRequest {
            method: "PUT".to_owned(),
            object_key: Some(key.to_owned()),
            query: Vec::new(),
            headers: Vec::new(),
        };
        MirrorTask::new(bucket, &bucket.replicas[0], &S3Op::PutObject, request, &Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let queue = TaskQueue::new("photos");
        queue.enqueue(task("a"), Duration::ZERO).await;
        queue.enqueue(task("b"), Duration::ZERO).await;

        let first = queue.next_ready().await;
        assert_eq!(first.value.original_request.object_key.as_deref(), Some("a"));
        queue.ack(&first.key).await;

        let second = queue.next_ready().await;
        assert_eq!(second.value.original_request.object_key.as_deref(), Some("b"));
        queue.ack(&second.key).await;
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn entries_stay_until_acked() {
        let queue = TaskQueue::new("photos");
        queue.enqueue(task("a"), Duration::ZERO).await;

        let entry = queue.next_ready().await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.snapshot().await.len(), 1);

        queue.ack(&entry.key).await;
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_entries_wait() {
        let queue = TaskQueue::new("photos");
        queue.enqueue(task("a"), Duration::from_millis(200)).await;

        let result = tokio::time::timeout(Duration::from_millis(50), queue.next_ready()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip() {
        let queue = TaskQueue::new("photos");
        queue.enqueue(task("a"), Duration::ZERO).await;
        queue.enqueue(task("b"), Duration::ZERO).await;

        let entries = queue.snapshot().await;
        let json = serde_json::to_string(&entries).unwrap();
        assert!(json.contains("\"key\":\"photos/"));

        let rebuilt: Vec<QueueEntry> = serde_json::from_str(&json).unwrap();
        let restored = TaskQueue::new("photos");
        restored.restore(rebuilt).await;
        assert_eq!(restored.len().await, 2);

        let head = restored.next_ready().await;
        assert_eq!(head.value.original_request.object_key.as_deref(), Some("a"));
    }
}
