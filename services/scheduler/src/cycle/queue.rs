//! Prioritized idle queue published to reporting consumers.

use batchd_id::JobHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::model::JobState;
use crate::state::SchedState;

/// One row of the published queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job: String,
    pub priority: i64,
    /// Partition the job was last evaluated in.
    pub partition: Option<String>,
    /// Blocking reason code, absent when the job is eligible.
    pub block_code: Option<String>,
    pub block_message: Option<String>,
}

/// Receiving end of the per-cycle queue snapshot.
pub type QueueWatch = watch::Receiver<Vec<QueueEntry>>;

/// Queue rows for the idle and held jobs in `order`, keeping its order.
pub fn queue_snapshot(state: &SchedState, order: &[JobHandle]) -> Vec<QueueEntry> {
    order
        .iter()
        .filter_map(|h| state.jobs.get(*h))
        .filter(|j| !j.estate.is_active() && !j.state.is_active() && !j.state.is_terminal())
        .map(|j| QueueEntry {
            job: j.name.clone(),
            priority: j.start_priority,
            partition: j
                .block
                .as_ref()
                .map(|b| b.partition.clone())
                .or_else(|| j.partition.clone()),
            block_code: j.block.as_ref().map(|b| b.reason.code().to_string()),
            block_message: match (&j.block, j.state) {
                (Some(b), _) => Some(b.message.clone()),
                (None, JobState::Hold) => Some("job hold active".to_string()),
                (None, _) => None,
            },
        })
        .collect()
}
