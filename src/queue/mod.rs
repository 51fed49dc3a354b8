//! Pending-mutation queue and the worker that drains it.

mod mutations;
pub mod types;
mod worker;

pub use mutations::{MutationQueue, QueueEvent};
pub use types::{Operation, QueueCounts, QueueItem, QueueStatus, Withdrawal};
pub use worker::{DrainReport, QueueWorker, RetryPolicy, WorkerHandle, WorkerOptions};
