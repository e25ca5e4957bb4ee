//! Event kinds and payload definitions.
//!
//! Each kind maps to a dotted event type string; payload structs carry the
//! kind-specific detail.

use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Job
    pub const JOB_STARTED: &str = "job.started";
    pub const JOB_BACKFILLED: &str = "job.backfilled";
    pub const JOB_REJECTED: &str = "job.rejected";
    pub const JOB_REQUEUED: &str = "job.requeued";
    pub const JOB_HELD: &str = "job.held";
    pub const JOB_RELEASED: &str = "job.released";
    pub const JOB_CANCELLED: &str = "job.cancelled";
    pub const JOB_COMPLETED: &str = "job.completed";
    pub const JOB_PREEMPTED: &str = "job.preempted";
    pub const JOB_RESUMED: &str = "job.resumed";

    // Reservation
    pub const RSV_CREATED: &str = "rsv.created";
    pub const RSV_DESTROYED: &str = "rsv.destroyed";
    pub const RSV_EXTENDED: &str = "rsv.extended";

    // Node
    pub const NODE_STATE_CHANGED: &str = "node.state_changed";
    pub const NODE_PURGED: &str = "node.purged";

    // Scheduler
    pub const SCHED_CYCLE_COMPLETED: &str = "sched.cycle_completed";
    pub const SCHED_RM_DEGRADED: &str = "sched.rm_degraded";
}

// =============================================================================
// Object and Kind Enums
// =============================================================================

/// Type of object an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Job,
    Node,
    Reservation,
    #[default]
    Scheduler,
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ObjectType::Job => "job",
            ObjectType::Node => "node",
            ObjectType::Reservation => "rsv",
            ObjectType::Scheduler => "sched",
        };
        write!(f, "{}", s)
    }
}

/// Event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobStarted,
    JobBackfilled,
    JobRejected,
    JobRequeued,
    JobHeld,
    JobReleased,
    JobCancelled,
    JobCompleted,
    JobPreempted,
    JobResumed,
    RsvCreated,
    RsvDestroyed,
    RsvExtended,
    NodeStateChanged,
    NodePurged,
    CycleCompleted,
    RmDegraded,
}

impl EventKind {
    /// The dotted event type string.
    pub fn as_str(&self) -> &'static str {
        use event_types::*;
        match self {
            EventKind::JobStarted => JOB_STARTED,
            EventKind::JobBackfilled => JOB_BACKFILLED,
            EventKind::JobRejected => JOB_REJECTED,
            EventKind::JobRequeued => JOB_REQUEUED,
            EventKind::JobHeld => JOB_HELD,
            EventKind::JobReleased => JOB_RELEASED,
            EventKind::JobCancelled => JOB_CANCELLED,
            EventKind::JobCompleted => JOB_COMPLETED,
            EventKind::JobPreempted => JOB_PREEMPTED,
            EventKind::JobResumed => JOB_RESUMED,
            EventKind::RsvCreated => RSV_CREATED,
            EventKind::RsvDestroyed => RSV_DESTROYED,
            EventKind::RsvExtended => RSV_EXTENDED,
            EventKind::NodeStateChanged => NODE_STATE_CHANGED,
            EventKind::NodePurged => NODE_PURGED,
            EventKind::CycleCompleted => SCHED_CYCLE_COMPLETED,
            EventKind::RmDegraded => SCHED_RM_DEGRADED,
        }
    }

    /// The object type this kind of event is recorded against.
    pub fn object_type(&self) -> ObjectType {
        match self {
            EventKind::JobStarted
            | EventKind::JobBackfilled
            | EventKind::JobRejected
            | EventKind::JobRequeued
            | EventKind::JobHeld
            | EventKind::JobReleased
            | EventKind::JobCancelled
            | EventKind::JobCompleted
            | EventKind::JobPreempted
            | EventKind::JobResumed => ObjectType::Job,
            EventKind::RsvCreated | EventKind::RsvDestroyed | EventKind::RsvExtended => {
                ObjectType::Reservation
            }
            EventKind::NodeStateChanged | EventKind::NodePurged => ObjectType::Node,
            EventKind::CycleCompleted | EventKind::RmDegraded => ObjectType::Scheduler,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use event_types::*;
        let kind = match s {
            JOB_STARTED => EventKind::JobStarted,
            JOB_BACKFILLED => EventKind::JobBackfilled,
            JOB_REJECTED => EventKind::JobRejected,
            JOB_REQUEUED => EventKind::JobRequeued,
            JOB_HELD => EventKind::JobHeld,
            JOB_RELEASED => EventKind::JobReleased,
            JOB_CANCELLED => EventKind::JobCancelled,
            JOB_COMPLETED => EventKind::JobCompleted,
            JOB_PREEMPTED => EventKind::JobPreempted,
            JOB_RESUMED => EventKind::JobResumed,
            RSV_CREATED => EventKind::RsvCreated,
            RSV_DESTROYED => EventKind::RsvDestroyed,
            RSV_EXTENDED => EventKind::RsvExtended,
            NODE_STATE_CHANGED => EventKind::NodeStateChanged,
            NODE_PURGED => EventKind::NodePurged,
            SCHED_CYCLE_COMPLETED => EventKind::CycleCompleted,
            SCHED_RM_DEGRADED => EventKind::RmDegraded,
            other => return Err(EventError::UnknownEventType(other.to_string())),
        };
        Ok(kind)
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Payload for `job.started` and `job.backfilled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStartedPayload {
    pub partition: String,
    pub nodes: Vec<String>,
    pub task_count: u32,
    pub walltime_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation: Option<String>,
}

/// Payload for `job.rejected` and `job.requeued`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRejectedPayload {
    pub hostlist: Vec<String>,
    pub start_time: i64,
    pub start_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defer_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluded_node: Option<String>,
}

/// Payload for `job.held`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHeldPayload {
    pub hold: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_at: Option<i64>,
}

/// Payload for `rsv.created`, `rsv.destroyed` and `rsv.extended`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsvPayload {
    pub rsv_type: String,
    pub start: i64,
    pub end: i64,
    pub task_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
}

/// Payload for `node.state_changed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatePayload {
    pub old_state: String,
    pub new_state: String,
}

/// Payload for `sched.cycle_completed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleCompletedPayload {
    pub jobs_started: u32,
    pub jobs_backfilled: u32,
    pub reservations_created: u32,
    pub jobs_rejected: u32,
    pub rm_degraded: bool,
}
