//! # batchd-events
//!
//! Event records emitted by the batchd scheduling core.
//!
//! ## Design Principles
//!
//! - Events are immutable records of scheduler decisions and observed
//!   state changes
//! - Every event belongs to exactly one object (job, node, reservation or
//!   the scheduler itself)
//! - Recording an event never blocks or fails a scheduling cycle
//!
//! ## Event Types
//!
//! - Job events (`job.*`): start, backfill start, reject, requeue, hold,
//!   cancel, complete, preempt
//! - Reservation events (`rsv.*`): create, destroy, extend
//! - Node events (`node.*`): state change, purge
//! - Scheduler events (`sched.*`): cycle completion, RM degradation

mod envelope;
mod error;
mod sink;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use sink::*;
pub use types::*;
