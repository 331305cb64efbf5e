use tokio::sync::mpsc;

use std::time::Duration;

use crate::backend::{BackendResponse, Resolvers};
use crate::error::HeraldResult;
use crate::keystone::{KeystoneClient, SerializableTokenStore, TokenStore};
use crate::task_store::StorageLocks;

use super::{MirrorTask, QueueEntry, TaskQueue};

/// A task execution races this timer; the loser is abandoned.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// After this many retries the task is dead lettered.
pub const MAX_RETRIES: u32 = 10;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Exponential backoff for a task that failed with `retry_count` prior
/// attempts: `min(2^retry_count * 1s, 60s)`.
#[must_use]
pub fn backoff_delay(retry_count: u32) -> Duration {
    let exp = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    Duration::from_secs(exp).min(MAX_BACKOFF)
}

/// Control messages for a worker. Tasks themselves arrive via the queue.
#[derive(Debug)]
pub enum WorkerMessage {
    Start { keystone: SerializableTokenStore },
    UpdateContext { keystone: SerializableTokenStore },
}

/// Consumes one bucket's queue serially.
pub struct MirrorWorker {
    bucket: String,
    queue: TaskQueue,
    inbox: mpsc::Receiver<WorkerMessage>,
    resolvers: Resolvers,
    keystone: KeystoneClient,
    locks: StorageLocks,
    tokens: Option<TokenStore>,
}

impl MirrorWorker {
    #[must_use]
    pub fn new(
        bucket: String,
        queue: TaskQueue,
        inbox: mpsc::Receiver<WorkerMessage>,
        resolvers: Resolvers,
        keystone: KeystoneClient,
        locks: StorageLocks,
    ) -> Self {
        Self {
            bucket,
            queue,
            inbox,
            resolvers,
            keystone,
            locks,
            tokens: None,
        }
    }

    pub async fn run(mut self) {
        // Consumption starts on the first Start message.
        loop {
            match self.inbox.recv().await {
                Some(message) => {
                    self.apply_message(message);
                    if self.tokens.is_some() {
                        break;
                    }
                }
                None => return,
            }
        }
        tracing::info!(bucket = %self.bucket, "mirror worker started");

        loop {
            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(message) => self.apply_message(message),
                    None => {
                        tracing::info!(bucket = %self.bucket, "mirror worker inbox closed, stopping");
                        return;
                    }
                },
                entry = self.queue.next_ready() => {
                    self.handle_entry(entry).await;
                }
            }
        }
    }

    fn apply_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Start { keystone } | WorkerMessage::UpdateContext { keystone } => {
                self.tokens = Some(TokenStore::from_serializable(keystone, self.keystone.clone()));
            }
        }
    }

    /// Drives one dequeued task to a terminal outcome, then acks it.
    async fn handle_entry(&self, entry: QueueEntry) {
        let mut task = entry.value.clone();
        loop {
            let outcome = tokio::time::timeout(TASK_TIMEOUT, self.process_task(&task)).await;
            match task_disposition(&outcome) {
                Disposition::Done => {
                    tracing::debug!(bucket = %self.bucket, nonce = %task.nonce, "mirror task replayed");
                    break;
                }
                Disposition::Terminal(reason) => {
                    tracing::warn!(
                        bucket = %self.bucket,
                        nonce = %task.nonce,
                        reason,
                        "mirror task finished without effect"
                    );
                    break;
                }
                Disposition::Retry(reason) => {
                    if task.retry_count >= MAX_RETRIES {
                        tracing::error!(
                            bucket = %self.bucket,
                            nonce = %task.nonce,
                            retries = task.retry_count,
                            reason,
                            "mirror task dead lettered"
                        );
                        break;
                    }
                    let delay = backoff_delay(task.retry_count);
                    task.retry_count += 1;
                    tracing::warn!(
                        bucket = %self.bucket,
                        nonce = %task.nonce,
                        retry = task.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        reason,
                        "mirror task failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        self.queue.ack(&entry.key).await;
    }

    async fn process_task(&self, task: &MirrorTask) -> HeraldResult<BackendResponse> {
        let Some(ref tokens) = self.tokens else {
            return Err(herald_error!(ServiceUnavailable, "worker has no keystone snapshot yet"));
        };
        let op = task.op()?;
        let body = task.body_bytes()?;

        let lock_key = task.command.is_destructive().then(|| task.storage_key());
        if let Some(ref key) = lock_key {
            self.locks.acquire(key.clone());
        }
        let result = self
            .resolvers
            .execute(
                tokens,
                &task.backup_bucket_config.backend.config,
                &task.backup_bucket_config.name,
                &op,
                &task.original_request,
                body,
            )
            .await;
        if let Some(ref key) = lock_key {
            self.locks.release(key);
        }
        result
    }
}

enum Disposition {
    Done,
    Terminal(&'static str),
    Retry(&'static str),
}

/// Errors and 5xx answers retry; 4xx answers are terminal since the write is
/// already durable on the primary and a replica schema mismatch will not fix
/// itself.
fn task_disposition(outcome: &Result<HeraldResult<BackendResponse>, tokio::time::error::Elapsed>) -> Disposition {
    match outcome {
        Err(_) => Disposition::Retry("timeout"),
        Ok(Err(_)) => Disposition::Retry("transport error"),
        Ok(Ok(response)) if response.status.is_server_error() => Disposition::Retry("backend 5xx"),
        Ok(Ok(response)) if response.status.is_client_error() => Disposition::Terminal("backend 4xx"),
        Ok(Ok(_)) => Disposition::Done,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use hyper::StatusCode;

    #[test]
    fn backoff_schedule() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(5), Duration::from_secs(32));
        assert_eq!(backoff_delay(6), Duration::from_secs(60));
        assert_eq!(backoff_delay(30), Duration::from_secs(60));
        assert_eq!(backoff_delay(120), Duration::from_secs(60));
    }

    #[test]
    fn disposition_rules() {
        let ok = Ok(Ok(BackendResponse::empty(StatusCode::OK)));
        assert!(matches!(task_disposition(&ok), Disposition::Done));

        let server_err = Ok(Ok(BackendResponse::empty(StatusCode::SERVICE_UNAVAILABLE)));
        assert!(matches!(task_disposition(&server_err), Disposition::Retry(_)));

        let client_err = Ok(Ok(BackendResponse::empty(StatusCode::FORBIDDEN)));
        assert!(matches!(task_disposition(&client_err), Disposition::Terminal(_)));

        let transport: Result<HeraldResult<BackendResponse>, _> =
            Ok(Err(herald_error!(ServiceUnavailable, "down")));
        assert!(matches!(task_disposition(&transport), Disposition::Retry(_)));
    }
}
