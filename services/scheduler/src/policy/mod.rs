//! Job selection, limit policy and priority.

pub mod eligibility;
pub mod engine;
pub mod priority;

pub use eligibility::{
    record_blocks, release_expired_holds, select_jobs, AvailabilitySnapshot, BlockReason,
    BlockRecord, SelectLimits, SelectRequest, Selection,
};
pub use engine::{
    PolicyContext, PolicyEngine, PolicyLevel, PolicyVerdict, UsageSnapshot, WeightedPolicyEngine,
};
pub use priority::{
    accrue_queue_time, compare_start_priority, refresh_priorities, sort_queue, strverscmp,
};
