//! Asynchronous replication.
//!
//! Every successful mutating response from a primary backend fans out into
//! one task per replica. Tasks live in per bucket FIFO queues, are consumed
//! by one worker per bucket, and survive restarts through the task store
//! snapshots.

mod engine;
mod queue;
mod task;
mod worker;

pub use self::engine::MirrorEngine;
pub use self::queue::{QueueEntry, TaskQueue};
pub use self::task::{MirrorCommand, MirrorTask};
pub use self::worker::{MAX_RETRIES, MirrorWorker, TASK_TIMEOUT, WorkerMessage, backoff_delay};
