//! batchd scheduler
//!
//! The scheduling engine of a batch workload manager: it tracks nodes,
//! jobs and reservations, polls a resource manager for the truth, and
//! each iteration decides which idle jobs start now, which get a future
//! reservation, and which lower-priority jobs can backfill the gaps.
//!
//! ## Modules
//!
//! - `model`: nodes, jobs, partitions and credentials
//! - `policy`: eligibility, limits and priority
//! - `alloc`: feasibility, task distribution and allocation commit
//! - `rsv`: reservations, standing reservations and backfill windows
//! - `rm`: resource manager seam and the in-memory implementation
//! - `checkpoint`: durable scheduler-owned state
//! - `cycle`: the per-iteration orchestrator
//! - `worker`: the periodic driver

pub mod alloc;
pub mod checkpoint;
pub mod config;
pub mod cycle;
pub mod model;
pub mod policy;
pub mod rm;
pub mod rsv;
pub mod sink;
pub mod state;
pub mod worker;

use thiserror::Error;

pub use cycle::{CycleStats, QueueEntry, QueueWatch, SchedulingCycle};
pub use state::SchedState;
pub use worker::SchedulerWorker;

/// Errors surfaced while assembling the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Rm(#[from] rm::RmError),

    #[error(transparent)]
    Checkpoint(#[from] checkpoint::CheckpointError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
