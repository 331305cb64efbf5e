//! Durable state snapshots.
//!
//! Queue contents and the advisory lock map are persisted into the reserved
//! `task-store` bucket so mirror tasks survive restarts. The writes loop back
//! through the proxy's own front door; they carry `UNSIGNED-PAYLOAD` and rely
//! on the trusted CIDR check instead of a signature.

use bytes::Bytes;
use hyper::StatusCode;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::TASK_STORE_BUCKET;
use crate::error::{HeraldError, HeraldResult};
use crate::header;
use crate::mirror::{MirrorEngine, QueueEntry};
use crate::utils::epoch_millis;

/// Cadence of `sync_to_remote`.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Cadence of the worker `UpdateContext` broadcast.
pub const WORKER_CONTEXT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

const STORAGE_LOCKS_KEY: &str = "storage_locks.json";

/// Advisory locks marking in flight destructive replays, keyed by storage
/// key with the acquisition time in epoch millis.
#[derive(Debug, Clone, Default)]
pub struct StorageLocks {
    inner: Arc<Mutex<HashMap<String, u64>>>,
}

impl StorageLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: String) {
        self.inner.lock().expect("lock map poisoned").insert(key, epoch_millis());
    }

    pub fn release(&self, key: &str) {
        self.inner.lock().expect("lock map poisoned").remove(key);
    }

    #[must_use]
    pub fn is_locked(&self, key: &str) -> bool {
        self.inner.lock().expect("lock map poisoned").contains_key(key)
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.inner.lock().expect("lock map poisoned").clone()
    }

    pub fn restore(&self, map: HashMap<String, u64>) {
        *self.inner.lock().expect("lock map poisoned") = map;
    }
}

/// Reads and writes the proxy's durable state through the loopback listener.
pub struct TaskStore {
    base_url: String,
    client: reqwest::Client,
}

impl TaskStore {
    #[must_use]
    pub fn new(port: u16, client: reqwest::Client) -> Self {
        Self {
            base_url: format!("http://localhost:{port}/{TASK_STORE_BUCKET}"),
            client,
        }
    }

    /// Serializes every queue and the lock map into the task store bucket.
    pub async fn sync_to_remote(&self, engine: &MirrorEngine, locks: &StorageLocks) -> HeraldResult {
        for (name, queue) in engine.queues() {
            let entries = queue.snapshot().await;
            let body = serde_json::to_vec(&entries).map_err(HeraldError::internal)?;
            self.put_blob(&format!("{name}/queue.json"), body).await?;
            tracing::debug!(bucket = %name, entries = entries.len(), "queue snapshot written");
        }
        let body = serde_json::to_vec(&locks.snapshot()).map_err(HeraldError::internal)?;
        self.put_blob(STORAGE_LOCKS_KEY, body).await?;
        Ok(())
    }

    /// Rebuilds local queues and locks from the task store bucket. A missing
    /// blob is initialized empty so the next snapshot round finds it.
    pub async fn sync_from_remote(&self, engine: &MirrorEngine, locks: &StorageLocks) -> HeraldResult {
        for (name, queue) in engine.queues() {
            let key = format!("{name}/queue.json");
            match self.get_blob(&key).await? {
                Some(raw) => {
                    let entries: Vec<QueueEntry> =
                        serde_json::from_slice(&raw).map_err(HeraldError::internal)?;
                    tracing::info!(bucket = %name, entries = entries.len(), "queue rehydrated");
                    queue.restore(entries).await;
                }
                None => {
                    self.put_blob(&key, b"[]".to_vec()).await?;
                }
            }
        }
        match self.get_blob(STORAGE_LOCKS_KEY).await? {
            Some(raw) => {
                let map: HashMap<String, u64> =
                    serde_json::from_slice(&raw).map_err(HeraldError::internal)?;
                locks.restore(map);
            }
            None => {
                self.put_blob(STORAGE_LOCKS_KEY, b"{}".to_vec()).await?;
            }
        }
        Ok(())
    }

    async fn put_blob(&self, key: &str, body: Vec<u8>) -> HeraldResult {
        let url = format!("{}/{key}", self.base_url);
        let response = self
            .client
            .put(&url)
            .header(header::X_AMZ_CONTENT_SHA256, header::UNSIGNED_PAYLOAD)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(HeraldError::upstream(std::io::Error::other(format!(
                "task store write of {key} returned {}",
                response.status()
            ))));
        }
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> HeraldResult<Option<Bytes>> {
        let url = format!("{}/{key}", self.base_url);
        let response = self
            .client
            .get(&url)
            .header(header::X_AMZ_CONTENT_SHA256, header::UNSIGNED_PAYLOAD)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(HeraldError::upstream(std::io::Error::other(format!(
                "task store read of {key} returned {}",
                response.status()
            ))));
        }
        Ok(Some(response.bytes().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locks_track_acquire_and_release() {
        let locks = StorageLocks::new();
        locks.acquire("backup/photos/k".to_owned());
        assert!(locks.is_locked("backup/photos/k"));

        let snapshot = locks.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot["backup/photos/k"] > 0);

        locks.release("backup/photos/k");
        assert!(!locks.is_locked("backup/photos/k"));
    }

    #[test]
    fn locks_survive_snapshot_round_trip() {
        let locks = StorageLocks::new();
        locks.acquire("a".to_owned());
        locks.acquire("b".to_owned());

        let json = serde_json::to_string(&locks.snapshot()).unwrap();
        let restored: HashMap<String, u64> = serde_json::from_str(&json).unwrap();

        let rebuilt = StorageLocks::new();
        rebuilt.restore(restored);
        assert!(rebuilt.is_locked("a"));
        assert!(rebuilt.is_locked("b"));
    }

    #[test]
    fn loopback_urls_target_the_task_store_bucket() {
        let store = TaskStore::new(8000, reqwest::Client::new());
        assert_eq!(store.base_url, "http://localhost:8000/task-store");
    }
}
