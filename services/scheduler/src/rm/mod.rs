//! Resource manager collaborator.
//!
//! The scheduler never talks to compute nodes directly. It polls a
//! [`ResourceManager`] for ground truth once per iteration and issues
//! fire-and-confirm requests (start, cancel, suspend, resume, requeue,
//! modify) whose outcome is only observed on the next poll.

pub mod mock;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{DistributionPolicy, JobFlags, JobState, MalleableShape, NodeState, Resources};

pub use mock::{MockResourceManager, RmAction};

/// Resource manager errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RmError {
    #[error("resource manager unavailable: {0}")]
    Unavailable(String),

    #[error("resource manager query timed out after {0:?}")]
    Timeout(Duration),

    #[error("job not found in resource manager: {0}")]
    JobNotFound(String),

    #[error("resource manager refused to {action} job {job}: {reason}")]
    Refused {
        action: &'static str,
        job: String,
        reason: String,
    },

    #[error("invalid workload file {path}: {reason}")]
    Workload { path: PathBuf, reason: String },
}

pub type RmResult<T> = Result<T, RmError>;

// =============================================================================
// Snapshots
// =============================================================================

/// One homogeneous request of a submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReqSpec {
    pub tasks: u32,
    /// Per-task resources; `-1` asks for the whole node's amount.
    pub per_task: Resources,
    pub node_count: u32,
    pub tasks_per_node: u32,
    pub features: Vec<String>,
    /// Alternative malleable shapes, smallest first.
    pub shapes: Vec<MalleableShape>,
}

impl Default for ReqSpec {
    fn default() -> Self {
        Self {
            tasks: 1,
            per_task: Resources::new(1, 0),
            node_count: 0,
            tasks_per_node: 0,
            features: Vec::new(),
            shapes: Vec::new(),
        }
    }
}

/// Submission attributes of a job as the resource manager knows it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSpec {
    pub name: String,
    pub user: String,
    pub group: Option<String>,
    pub account: Option<String>,
    pub qos: Option<String>,
    pub class: Option<String>,
    /// Partitions the job may use; empty means all.
    pub partitions: Vec<String>,
    pub reqs: Vec<ReqSpec>,
    pub walltime: i64,
    pub priority: i64,
    pub submit_time: i64,
    pub deadline: Option<i64>,
    pub geometry: Option<String>,
    pub distribution: Option<DistributionPolicy>,
    pub flags: JobFlags,
    pub sync_with: Vec<String>,
    pub exclude_hosts: Vec<String>,
}

impl JobSpec {
    /// Single-request job of `tasks` tasks with `procs` processors each.
    pub fn new(name: impl Into<String>, user: impl Into<String>, tasks: u32, procs: i64) -> Self {
        Self {
            name: name.into(),
            user: user.into(),
            reqs: vec![ReqSpec {
                tasks,
                per_task: Resources::new(procs, 0),
                ..ReqSpec::default()
            }],
            walltime: 3600,
            ..Self::default()
        }
    }

    pub fn with_walltime(mut self, secs: i64) -> Self {
        self.walltime = secs;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Observed state of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub spec: JobSpec,
    pub state: JobState,
    pub start_time: Option<i64>,
    pub completion_time: Option<i64>,
    /// Nodes and task counts the job runs on.
    pub nodes: Vec<(String, u32)>,
    pub prolog_pending: bool,
    /// Requeued by the resource manager itself, not a rejection.
    pub internally_requeued: bool,
    pub checkpoint_start_time: Option<i64>,
}

impl JobSnapshot {
    pub fn idle(spec: JobSpec) -> Self {
        Self {
            spec,
            state: JobState::Idle,
            start_time: None,
            completion_time: None,
            nodes: Vec::new(),
            prolog_pending: false,
            internally_requeued: false,
            checkpoint_start_time: None,
        }
    }
}

/// Observed state of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSnapshot {
    pub name: String,
    pub partition: String,
    pub configured: Resources,
    pub state: NodeState,
    pub load: f64,
    pub features: Vec<String>,
    pub is_vm: bool,
}

impl Default for NodeSnapshot {
    fn default() -> Self {
        Self {
            name: String::new(),
            partition: "batch".to_string(),
            configured: Resources::default(),
            state: NodeState::Idle,
            load: 0.0,
            features: Vec::new(),
            is_vm: false,
        }
    }
}

impl NodeSnapshot {
    pub fn new(name: impl Into<String>, partition: impl Into<String>, configured: Resources) -> Self {
        Self {
            name: name.into(),
            partition: partition.into(),
            configured,
            ..Self::default()
        }
    }
}

/// Everything one poll returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadSnapshot {
    pub nodes: Vec<NodeSnapshot>,
    pub jobs: Vec<JobSnapshot>,
}

/// A start request: the job and the tasks placed on each node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub job: String,
    pub partition: String,
    pub nodes: Vec<(String, u32)>,
    pub start_time: i64,
    pub walltime: i64,
}

// =============================================================================
// Collaborator trait
// =============================================================================

/// Resource manager interface.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    fn name(&self) -> &str;

    /// Current jobs and nodes as of `now`. Adapters backed by a live
    /// resource manager may ignore `now`.
    async fn query_workload(&self, now: i64) -> RmResult<WorkloadSnapshot>;

    async fn start_job(&self, request: &StartRequest) -> RmResult<()>;

    async fn cancel_job(&self, job: &str, message: &str) -> RmResult<()>;

    async fn suspend_job(&self, job: &str) -> RmResult<()>;

    async fn resume_job(&self, job: &str) -> RmResult<()>;

    async fn requeue_job(&self, job: &str) -> RmResult<()>;

    async fn modify_job(&self, job: &str, attr: &str, value: &str) -> RmResult<()>;
}
