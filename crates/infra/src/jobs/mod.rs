//! Provisioning job queue.
//!
//! ## Design
//!
//! - Jobs are durable ledger rows; the ledger's atomic claim guarantees one
//!   worker per job
//! - Failed attempts go back to `pending` with exponential backoff
//! - Exhausted jobs fail their install so nothing is left silently stuck
//! - The reaper recovers claims abandoned by crashed workers
//!
//! ## Components
//!
//! - `JobQueue`: enqueue, claim-and-execute, reap
//! - `JobHandler`: the step executor plugged into the queue
//! - `Worker` / `Reaper`: tokio tasks driven through a `WorkerHandle`

pub mod queue;
pub mod reaper;
pub mod types;
pub mod worker;

pub use queue::{JobHandler, JobQueue};
pub use reaper::Reaper;
pub use types::{JobOutcome, JobQueueConfig, ReapReport, RetryPolicy};
pub use worker::{Worker, WorkerConfig, WorkerHandle, WorkerStats};
