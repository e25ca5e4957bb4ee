//! In-memory resource manager.
//!
//! Used by tests and by the daemon when no live resource manager is
//! configured. Requests are applied immediately and recorded as
//! [`RmAction`]s. With [`MockResourceManager::simulated`], running jobs
//! complete once their walltime has elapsed.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    JobSnapshot, JobSpec, NodeSnapshot, ResourceManager, RmError, RmResult, StartRequest,
    WorkloadSnapshot,
};
use crate::model::JobState;

/// A request the mock received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RmAction {
    Start { job: String, nodes: Vec<(String, u32)> },
    Cancel { job: String, message: String },
    Suspend { job: String },
    Resume { job: String },
    Requeue { job: String },
    Modify { job: String, attr: String, value: String },
}

#[derive(Debug, Default)]
struct MockState {
    workload: WorkloadSnapshot,
    actions: Vec<RmAction>,
}

impl MockState {
    fn job_mut(&mut self, name: &str) -> RmResult<&mut JobSnapshot> {
        self.workload
            .jobs
            .iter_mut()
            .find(|j| j.spec.name == name)
            .ok_or_else(|| RmError::JobNotFound(name.to_string()))
    }
}

/// Mock resource manager for testing and development.
#[derive(Debug, Default)]
pub struct MockResourceManager {
    state: Mutex<MockState>,
    /// Queries fail while set.
    unavailable: AtomicBool,
    /// Start requests are refused.
    fail_starts: bool,
    /// Running jobs complete when their walltime elapses.
    simulate: bool,
}

impl MockResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock whose queries and starts always fail.
    pub fn failing() -> Self {
        Self {
            unavailable: AtomicBool::new(true),
            fail_starts: true,
            ..Self::default()
        }
    }

    pub fn from_workload(workload: WorkloadSnapshot) -> Self {
        Self {
            state: Mutex::new(MockState {
                workload,
                actions: Vec::new(),
            }),
            ..Self::default()
        }
    }

    /// Loads a TOML workload description (`[[nodes]]` and `[[jobs]]`).
    pub fn from_workload_file(path: &Path) -> RmResult<Self> {
        let workload_err = |reason: String| RmError::Workload {
            path: path.to_path_buf(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| workload_err(e.to_string()))?;
        let workload: WorkloadSnapshot =
            toml::from_str(&raw).map_err(|e| workload_err(e.to_string()))?;
        info!(
            path = %path.display(),
            nodes = workload.nodes.len(),
            jobs = workload.jobs.len(),
            "workload loaded"
        );
        Ok(Self::from_workload(workload))
    }

    pub fn simulated(mut self) -> Self {
        self.simulate = true;
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn add_node(&self, node: NodeSnapshot) {
        let mut state = self.state.lock().await;
        state.workload.nodes.retain(|n| n.name != node.name);
        state.workload.nodes.push(node);
    }

    pub async fn remove_node(&self, name: &str) {
        self.state.lock().await.workload.nodes.retain(|n| n.name != name);
    }

    pub async fn submit(&self, spec: JobSpec) {
        let mut state = self.state.lock().await;
        state.workload.jobs.retain(|j| j.spec.name != spec.name);
        state.workload.jobs.push(JobSnapshot::idle(spec));
    }

    /// Marks a job finished.
    pub async fn complete_job(&self, name: &str, at: i64) -> RmResult<()> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(name)?;
        job.state = JobState::Completed;
        job.completion_time = Some(at);
        Ok(())
    }

    /// Overrides the reported state of a job (a lagging or lying RM).
    pub async fn set_job_state(&self, name: &str, job_state: JobState) -> RmResult<()> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(name)?;
        job.state = job_state;
        if job_state == JobState::Idle {
            job.nodes.clear();
        }
        Ok(())
    }

    pub async fn job(&self, name: &str) -> Option<JobSnapshot> {
        let state = self.state.lock().await;
        state.workload.jobs.iter().find(|j| j.spec.name == name).cloned()
    }

    pub async fn actions(&self) -> Vec<RmAction> {
        self.state.lock().await.actions.clone()
    }
}

#[async_trait]
impl ResourceManager for MockResourceManager {
    fn name(&self) -> &str {
        "mock"
    }

    async fn query_workload(&self, now: i64) -> RmResult<WorkloadSnapshot> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RmError::Unavailable("mock configured to fail".into()));
        }
        let mut state = self.state.lock().await;
        if self.simulate {
            for job in &mut state.workload.jobs {
                let done = job.state == JobState::Running
                    && job.start_time.is_some_and(|s| s + job.spec.walltime <= now);
                if done {
                    job.state = JobState::Completed;
                    job.completion_time = Some(now);
                    debug!(job = %job.spec.name, "[MOCK] job completed");
                }
            }
        }
        Ok(state.workload.clone())
    }

    async fn start_job(&self, request: &StartRequest) -> RmResult<()> {
        let refused = |reason: &str| RmError::Refused {
            action: "start",
            job: request.job.clone(),
            reason: reason.to_string(),
        };
        if self.fail_starts {
            return Err(refused("mock configured to fail"));
        }
        let mut state = self.state.lock().await;
        let job = state.job_mut(&request.job)?;
        if job.state != JobState::Idle {
            return Err(refused(&format!("job is {}", job.state)));
        }
        job.state = JobState::Running;
        job.start_time = Some(request.start_time);
        job.nodes = request.nodes.clone();
        job.internally_requeued = false;
        job.spec.walltime = request.walltime;
        state.actions.push(RmAction::Start {
            job: request.job.clone(),
            nodes: request.nodes.clone(),
        });
        info!(job = %request.job, nodes = request.nodes.len(), "[MOCK] job started");
        Ok(())
    }

    async fn cancel_job(&self, job: &str, message: &str) -> RmResult<()> {
        let mut state = self.state.lock().await;
        let snap = state.job_mut(job)?;
        snap.state = JobState::Removed;
        snap.nodes.clear();
        state.actions.push(RmAction::Cancel {
            job: job.to_string(),
            message: message.to_string(),
        });
        info!(job = %job, message = %message, "[MOCK] job cancelled");
        Ok(())
    }

    async fn suspend_job(&self, job: &str) -> RmResult<()> {
        let mut state = self.state.lock().await;
        let snap = state.job_mut(job)?;
        if snap.state != JobState::Running {
            return Err(RmError::Refused {
                action: "suspend",
                job: job.to_string(),
                reason: format!("job is {}", snap.state),
            });
        }
        snap.state = JobState::Suspended;
        state.actions.push(RmAction::Suspend { job: job.to_string() });
        Ok(())
    }

    async fn resume_job(&self, job: &str) -> RmResult<()> {
        let mut state = self.state.lock().await;
        let snap = state.job_mut(job)?;
        if snap.state != JobState::Suspended {
            return Err(RmError::Refused {
                action: "resume",
                job: job.to_string(),
                reason: format!("job is {}", snap.state),
            });
        }
        snap.state = JobState::Running;
        state.actions.push(RmAction::Resume { job: job.to_string() });
        Ok(())
    }

    async fn requeue_job(&self, job: &str) -> RmResult<()> {
        let mut state = self.state.lock().await;
        let snap = state.job_mut(job)?;
        snap.state = JobState::Idle;
        snap.start_time = None;
        snap.nodes.clear();
        snap.internally_requeued = true;
        state.actions.push(RmAction::Requeue { job: job.to_string() });
        Ok(())
    }

    async fn modify_job(&self, job: &str, attr: &str, value: &str) -> RmResult<()> {
        let mut state = self.state.lock().await;
        let snap = state.job_mut(job)?;
        if attr == "walltime" {
            if let Ok(secs) = value.parse() {
                snap.spec.walltime = secs;
            }
        }
        state.actions.push(RmAction::Modify {
            job: job.to_string(),
            attr: attr.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }
}
