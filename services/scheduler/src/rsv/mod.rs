//! Reservations: time-bounded claims on node resources.
//!
//! The [`RsvTable`] owns every reservation and is the only writer of the
//! job <-> reservation binding and of node reservation references.

pub mod access;
pub mod backfill;
pub mod engine;
pub mod standing;
pub mod table;

use std::collections::BTreeMap;

use batchd_id::{JobHandle, NodeHandle};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Acl, Resources};

pub use access::{check_job_access, check_rsv_access, AccessContext, Affinity, RsvAccess};
pub use backfill::{backfill_windows, order_backfill_candidates, BackfillWindow};
pub use engine::{
    create_active_job_reservation, create_deadline_reservation, create_priority_reservation,
    expire_reservations, extend_active_reservations, purge_transient, RsvSlots,
};
pub use standing::materialize_standing;
pub use table::RsvTable;

/// Reservation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RsvError {
    #[error("reservation not found: {0}")]
    NotFound(String),

    #[error("reservation already exists: {0}")]
    Duplicate(String),

    #[error("reservation {name} ends ({end}) before it starts ({start})")]
    InvalidWindow { name: String, start: i64, end: i64 },

    #[error("job {job} is already bound to reservation {rsv}")]
    JobAlreadyBound { job: String, rsv: String },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("reservation {name} may not share nodes with {other}")]
    Conflict { name: String, other: String },

    #[error("no feasible window for job {job}: {reason}")]
    NoFeasibleWindow { job: String, reason: String },

    #[error("reservation slots exhausted for bucket {bucket} in partition {partition}")]
    SlotsExhausted { bucket: String, partition: String },
}

pub type RsvResult<T> = Result<T, RsvError>;

/// Reservation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RsvKind {
    /// Protects the allocation of a running job.
    ActiveJob,
    /// Future window held for a blocked high-priority job.
    PriorityJob,
    /// Window guaranteeing a deadline job's start-by time.
    DeadlineJob,
    User,
    Standing,
    Meta,
}

impl RsvKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActiveJob => "active_job",
            Self::PriorityJob => "priority_job",
            Self::DeadlineJob => "deadline_job",
            Self::User => "user",
            Self::Standing => "standing",
            Self::Meta => "meta",
        }
    }

    /// Backed by exactly one job.
    pub fn is_job(&self) -> bool {
        matches!(self, Self::ActiveJob | Self::PriorityJob | Self::DeadlineJob)
    }

    /// Recomputed from scratch every iteration.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PriorityJob | Self::DeadlineJob)
    }
}

impl std::fmt::Display for RsvKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exclusivity and access bits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RsvFlags {
    pub exclude_all: bool,
    pub exclude_jobs: bool,
    pub allow_grid: bool,
    pub allow_sandbox_only: bool,
    pub allow_all: bool,
    pub allow_all_non_job: bool,
    pub by_name_only: bool,
    pub allow_job_overlap: bool,
    pub exclude_my_group: bool,
    pub non_preemptible: bool,
    /// The owning job is preempting other work.
    pub preempting: bool,
}

/// Recurrence of a standing reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StandingPeriod {
    #[default]
    Daily,
    Weekly,
}

impl StandingPeriod {
    pub fn seconds(&self) -> i64 {
        match self {
            Self::Daily => 86_400,
            Self::Weekly => 7 * 86_400,
        }
    }
}

/// Resources a reservation claims on one node.
#[derive(Debug, Clone, PartialEq)]
pub struct RsvNodeClaim {
    pub node: NodeHandle,
    pub task_count: u32,
    pub res: Resources,
}

/// A time-bounded claim on a set of nodes.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub name: String,
    pub group: Option<String>,
    pub kind: RsvKind,
    pub start: i64,
    pub end: i64,
    /// Hard expiry independent of `end`.
    pub expire: Option<i64>,
    pub acl: Acl,
    pub flags: RsvFlags,
    pub nodes: Vec<RsvNodeClaim>,
    /// Owning job; written only by [`RsvTable`].
    pub(crate) job: Option<JobHandle>,
    pub job_name: Option<String>,
    pub partition: Option<String>,
    /// Priority reservation slot bucket.
    pub bucket: Option<String>,
    pub max_jobs: Option<u32>,
    pub created_at: i64,
}

impl Reservation {
    pub fn new(name: impl Into<String>, kind: RsvKind, start: i64, end: i64) -> Self {
        Self {
            name: name.into(),
            group: None,
            kind,
            start,
            end,
            expire: None,
            acl: Acl::default(),
            flags: RsvFlags::default(),
            nodes: Vec::new(),
            job: None,
            job_name: None,
            partition: None,
            bucket: None,
            max_jobs: None,
            created_at: 0,
        }
    }

    /// Binds the reservation to `job` on creation.
    pub fn for_job(mut self, job: JobHandle, job_name: impl Into<String>) -> Self {
        self.job = Some(job);
        self.job_name = Some(job_name.into());
        self
    }

    pub fn with_claims(mut self, claims: Vec<RsvNodeClaim>) -> Self {
        self.nodes = claims;
        self
    }

    pub fn job(&self) -> Option<JobHandle> {
        self.job
    }

    /// Start time reached.
    pub fn is_mature(&self, now: i64) -> bool {
        self.start <= now
    }

    /// Overlaps `[start, end)`.
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start < end && self.end > start
    }

    pub fn claim_on(&self, node: NodeHandle) -> Option<&RsvNodeClaim> {
        self.nodes.iter().find(|c| c.node == node)
    }

    pub fn task_count(&self) -> u32 {
        self.nodes.iter().map(|c| c.task_count).sum()
    }

    /// Node claims merged by node, for reporting.
    pub fn claims_by_node(&self) -> BTreeMap<NodeHandle, u32> {
        let mut out = BTreeMap::new();
        for c in &self.nodes {
            *out.entry(c.node).or_insert(0) += c.task_count;
        }
        out
    }
}
