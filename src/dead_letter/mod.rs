//! Bounded-retry dead letter queue
//!
//! Failed units of work are recorded as [`DeadLetter`]s and retried by a
//! [`RetryWorker`] on a fixed cadence. Each entry is retried until it either
//! succeeds (`resolved`) or runs out of attempts (`dead`).

mod backoff;
mod entry;
mod store;
mod worker;

pub use backoff::{Backoff, ExponentialBackoff, FixedBackoff};
pub use entry::{DeadLetter, DeadLetterStatus};
pub use store::{DeadLetterError, DeadLetterStore, FileDeadLetterStore, MemoryDeadLetterStore};
pub use worker::{
    PermanentFailure, RetryError, RetryHandler, RetryWorker, RetryWorkerBuilder, TickOutcome, TickReport,
    WorkerConfig, WorkerState,
};
