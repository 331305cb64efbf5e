use bytes::Bytes;
use tokio::sync::mpsc;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::{ProxiedRequest, Resolvers, S3Op};
use crate::config::{Bucket, Registry};
use crate::keystone::{KeystoneClient, SerializableTokenStore};
use crate::task_store::StorageLocks;

use super::{MirrorTask, MirrorWorker, TaskQueue, WorkerMessage};

const WORKER_INBOX_CAPACITY: usize = 8;

/// Owns one queue per configured bucket and the workers consuming them.
pub struct MirrorEngine {
    queues: Vec<(String, TaskQueue)>,
    inboxes: Mutex<HashMap<String, mpsc::Sender<WorkerMessage>>>,
}

impl MirrorEngine {
    #[must_use]
    pub fn new(registry: &Registry) -> Self {
        let queues = registry
            .mirrored_bucket_names()
            .map(|name| (name.to_owned(), TaskQueue::new(name)))
            .collect();
        Self {
            queues,
            inboxes: Mutex::new(HashMap::new()),
        }
    }

    /// All queues, in registry order. The task store snapshots these.
    #[must_use]
    pub fn queues(&self) -> &[(String, TaskQueue)] {
        &self.queues
    }

    #[must_use]
    pub fn queue(&self, bucket: &str) -> Option<&TaskQueue> {
        self.queues
            .iter()
            .find(|(name, _)| name == bucket)
            .map(|(_, queue)| queue)
    }

    /// Spawns one worker per bucket and sends the initial context.
    pub fn start(
        &self,
        resolvers: &Resolvers,
        keystone: &KeystoneClient,
        locks: &StorageLocks,
        snapshot: &SerializableTokenStore,
    ) {
        let mut inboxes = self.inboxes.lock().expect("inbox registry poisoned");
        for (name, queue) in &self.queues {
            let (tx, rx) = mpsc::channel(WORKER_INBOX_CAPACITY);
            let worker = MirrorWorker::new(
                name.clone(),
                queue.clone(),
                rx,
                resolvers.clone(),
                keystone.clone(),
                locks.clone(),
            );
            tokio::spawn(worker.run());
            let started = tx.try_send(WorkerMessage::Start {
                keystone: snapshot.clone(),
            });
            if started.is_err() {
                tracing::error!(bucket = %name, "mirror worker rejected its start message");
            }
            inboxes.insert(name.clone(), tx);
        }
    }

    /// Hands every worker a refreshed keystone snapshot.
    pub async fn broadcast_context(&self, snapshot: &SerializableTokenStore) {
        let inboxes: Vec<(String, mpsc::Sender<WorkerMessage>)> = {
            let guard = self.inboxes.lock().expect("inbox registry poisoned");
            guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (name, inbox) in inboxes {
            let message = WorkerMessage::UpdateContext {
                keystone: snapshot.clone(),
            };
            if inbox.send(message).await.is_err() {
                tracing::error!(bucket = %name, "mirror worker is gone, context update dropped");
            }
        }
    }

    /// Fans a successful mutating op out to every replica of its bucket.
    /// The primary response is already on its way to the client.
    pub async fn enqueue_mirrors(&self, bucket: &Bucket, op: &S3Op, request: &ProxiedRequest, body: &Bytes) {
        if bucket.replicas.is_empty() {
            return;
        }
        let Some(queue) = self.queue(&bucket.name) else {
            tracing::error!(bucket = %bucket.name, "no mirror queue for bucket");
            return;
        };
        for replica in &bucket.replicas {
            let Some(task) = MirrorTask::new(bucket, replica, op, request.clone(), body) else {
                return;
            };
            tracing::debug!(
                bucket = %bucket.name,
                replica = %replica.name,
                nonce = %task.nonce,
                "mirror task enqueued"
            );
            queue.enqueue(task, Duration::ZERO).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::Registry;
    use crate::config::tests::sample_config;

    #[tokio::test]
    async fn engine_builds_queue_per_mirrored_bucket() {
        let registry = Registry::resolve(&sample_config()).unwrap();
        let engine = MirrorEngine::new(&registry);

        // The task store bucket never mirrors.
        assert_eq!(engine.queues().len(), 1);
        assert!(engine.queue("photos").is_some());
        assert!(engine.queue("task-store").is_none());
    }

    #[tokio::test]
    async fn enqueue_creates_one_task_per_replica() {
        let registry = Registry::resolve(&sample_config()).unwrap();
        let engine = MirrorEngine::new(&registry);
        let bucket = registry.get("photos").unwrap();

        let request = ProxiedRequest {
            method: "PUT".to_owned(),
            object_key: Some("k".to_owned()),
            query: Vec::new(),
            headers: Vec::new(),
        };
        engine
            .enqueue_mirrors(bucket, &S3Op::PutObject, &request, &Bytes::from_static(b"x"))
            .await;
        engine
            .enqueue_mirrors(bucket, &S3Op::GetObject, &request, &Bytes::new())
            .await;

        let queue = engine.queue("photos").unwrap();
        assert_eq!(queue.len().await, 1);
    }
}
