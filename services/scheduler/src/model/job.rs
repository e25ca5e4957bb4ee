//! Jobs, requests and the job tables.
//!
//! A job owns its requests, message buffer and task map. Credentials are
//! shared `Arc` references. The reservation binding (`rsv`) is written only
//! by the reservation table so that job and reservation stay paired.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use batchd_id::{Arena, JobHandle, NodeHandle, RsvHandle};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::cred::JobCredentials;
use super::node::Node;
use super::partition::PartitionMask;
use super::resources::Resources;
use crate::policy::BlockRecord;

/// Messages kept per job.
pub const MAX_JOB_MESSAGES: usize = 16;

/// Task map growth when no explicit increment is requested.
pub const DEFAULT_TASKMAP_INCREMENT: usize = 16;

/// Job model errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Growing the task map would exceed the system-wide task limit.
    #[error("task map overflow for job {job}: {requested} slots exceeds max {max}")]
    TaskMapOverflow {
        job: String,
        requested: usize,
        max: usize,
    },

    /// Task list does not fit the task map.
    #[error("task map too small for job {job}: {tasks} tasks, {capacity} slots")]
    TaskMapTooSmall {
        job: String,
        tasks: usize,
        capacity: usize,
    },

    /// Requested task total disagrees with the per-req counts.
    #[error("request count mismatch for job {job}: expected {expected}, reqs sum to {actual}")]
    RequestCountMismatch {
        job: String,
        expected: u32,
        actual: u32,
    },

    #[error("job already exists: {0}")]
    Duplicate(String),

    #[error("job not found: {0}")]
    NotFound(String),
}

pub type JobResult<T> = Result<T, JobError>;

// =============================================================================
// States
// =============================================================================

/// Job state, both observed (`state`) and expected (`estate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Idle,
    Starting,
    Running,
    Suspended,
    Hold,
    Completed,
    Removed,
    Vacated,
    Deferred,
    Blocked,
    NotQueued,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Hold => "hold",
            Self::Completed => "completed",
            Self::Removed => "removed",
            Self::Vacated => "vacated",
            Self::Deferred => "deferred",
            Self::Blocked => "blocked",
            Self::NotQueued => "notqueued",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "suspended" => Some(Self::Suspended),
            "hold" => Some(Self::Hold),
            "completed" => Some(Self::Completed),
            "removed" => Some(Self::Removed),
            "vacated" => Some(Self::Vacated),
            "deferred" => Some(Self::Deferred),
            "blocked" => Some(Self::Blocked),
            "notqueued" => Some(Self::NotQueued),
            _ => None,
        }
    }

    /// Holds (or is acquiring) resources.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Suspended)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Removed | Self::Vacated)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hold kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldKind {
    User,
    System,
    Batch,
    Defer,
}

impl std::fmt::Display for HoldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::System => "system",
            Self::Batch => "batch",
            Self::Defer => "defer",
        };
        f.write_str(s)
    }
}

/// Why a hold was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    RmReject,
    PolicyViolation,
    Deadline,
    Admin,
    StartFailure,
}

impl HoldReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RmReject => "rm_reject",
            Self::PolicyViolation => "policy_violation",
            Self::Deadline => "deadline",
            Self::Admin => "admin",
            Self::StartFailure => "start_failure",
        }
    }
}

/// Hold flags of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Holds {
    pub user: bool,
    pub system: bool,
    pub batch: bool,
    /// Defer hold release time.
    pub defer_until: Option<i64>,
    pub reason: Option<HoldReason>,
}

impl Holds {
    /// First active hold at `now`, most severe first.
    pub fn active(&self, now: i64) -> Option<HoldKind> {
        if self.system {
            Some(HoldKind::System)
        } else if self.batch {
            Some(HoldKind::Batch)
        } else if self.user {
            Some(HoldKind::User)
        } else if self.defer_until.is_some_and(|t| t > now) {
            Some(HoldKind::Defer)
        } else {
            None
        }
    }

    pub fn set(&mut self, kind: HoldKind, reason: HoldReason, until: Option<i64>) {
        match kind {
            HoldKind::User => self.user = true,
            HoldKind::System => self.system = true,
            HoldKind::Batch => self.batch = true,
            HoldKind::Defer => self.defer_until = until,
        }
        self.reason = Some(reason);
    }

    pub fn release(&mut self, kind: HoldKind) {
        match kind {
            HoldKind::User => self.user = false,
            HoldKind::System => self.system = false,
            HoldKind::Batch => self.batch = false,
            HoldKind::Defer => self.defer_until = None,
        }
        if self.active(i64::MIN).is_none() {
            self.reason = None;
        }
    }

    /// Clears a defer hold whose release time has passed.
    pub fn release_expired_defer(&mut self, now: i64) -> bool {
        match self.defer_until {
            Some(t) if t <= now => {
                self.release(HoldKind::Defer);
                true
            }
            _ => false,
        }
    }
}

// =============================================================================
// Message buffer
// =============================================================================

/// One job message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub time: i64,
    pub text: String,
    pub count: u32,
}

/// Bounded, deduplicated message list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBuffer {
    entries: VecDeque<JobMessage>,
}

impl MessageBuffer {
    /// Appends a message; a repeated text refreshes the existing entry.
    pub fn push(&mut self, time: i64, text: impl Into<String>) {
        let text = text.into();
        if let Some(existing) = self.entries.iter_mut().find(|m| m.text == text) {
            existing.time = time;
            existing.count += 1;
            return;
        }
        if self.entries.len() >= MAX_JOB_MESSAGES {
            self.entries.pop_front();
        }
        self.entries.push_back(JobMessage {
            time,
            text,
            count: 1,
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobMessage> {
        self.entries.iter()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|m| m.text.contains(needle))
    }

    pub fn last(&self) -> Option<&JobMessage> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Requests and task map
// =============================================================================

/// Task distribution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistributionPolicy {
    #[default]
    RoundRobin,
    Pack,
    Disperse,
}

/// Alternative shape of a malleable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalleableShape {
    pub task_count: u32,
    pub node_count: u32,
    pub walltime: i64,
}

/// Tasks placed on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeAlloc {
    pub node: NodeHandle,
    pub task_count: u32,
}

/// A homogeneous resource request within a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Req {
    pub index: u32,
    pub task_count: u32,
    /// Zero means unconstrained.
    pub node_count: u32,
    /// Zero means unconstrained.
    pub tasks_per_node: u32,
    /// Per-task dedicated resources.
    pub dres: Resources,
    pub features: BTreeSet<String>,
    pub arch: Option<String>,
    pub os: Option<String>,
    pub node_list: Vec<NodeAlloc>,
    /// Malleable alternatives, smallest first.
    pub shapes: Vec<MalleableShape>,
    /// Member job a combined request came from.
    pub origin: Option<String>,
}

impl Req {
    pub fn new(task_count: u32, dres: Resources) -> Self {
        Self {
            index: 0,
            task_count,
            node_count: 0,
            tasks_per_node: 0,
            dres,
            features: BTreeSet::new(),
            arch: None,
            os: None,
            node_list: Vec::new(),
            shapes: Vec::new(),
            origin: None,
        }
    }

    pub fn with_node_count(mut self, node_count: u32) -> Self {
        self.node_count = node_count;
        self
    }

    pub fn allocated_tasks(&self) -> u32 {
        self.node_list.iter().map(|a| a.task_count).sum()
    }

    /// Resources `tasks` of this request consume on `node`.
    pub fn consumption(&self, node: &Node, tasks: u32) -> Resources {
        let mut out = Resources::default();
        out.add_times(&self.dres.resolve_whole(&node.cres), tasks);
        out
    }

    /// True when node constraints (features, arch, os) are satisfied.
    pub fn node_matches(&self, node: &Node) -> bool {
        self.features.iter().all(|f| node.has_feature(f))
            && self.arch.as_ref().is_none_or(|a| node.arch.as_ref() == Some(a))
            && self.os.as_ref().is_none_or(|o| node.os.as_ref() == Some(o))
    }
}

/// Task index -> node map, terminated by an empty slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskMap {
    slots: Vec<Option<NodeHandle>>,
}

impl TaskMap {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Assigned tasks, up to the terminator.
    pub fn tasks(&self) -> Vec<NodeHandle> {
        self.slots.iter().map_while(|s| *s).collect()
    }

    /// Writes `tasks` and terminates the list. Needs one spare slot.
    pub fn assign(&mut self, job: &str, tasks: &[NodeHandle]) -> JobResult<()> {
        if tasks.len() >= self.slots.len() {
            return Err(JobError::TaskMapTooSmall {
                job: job.to_string(),
                tasks: tasks.len(),
                capacity: self.slots.len(),
            });
        }
        for (slot, node) in self.slots.iter_mut().zip(tasks) {
            *slot = Some(*node);
        }
        for slot in self.slots.iter_mut().skip(tasks.len()) {
            *slot = None;
        }
        Ok(())
    }

    /// Empties the map without shrinking it.
    pub fn terminate(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    /// Size after growing by `extra` (default increment when `extra <= 0`).
    pub fn grown_size(&self, extra: i64) -> usize {
        let inc = if extra <= 0 {
            DEFAULT_TASKMAP_INCREMENT
        } else {
            extra as usize
        };
        self.slots.len() + inc
    }

    /// Grows the map, keeping existing slots. Fails without change when the
    /// new size exceeds `max`.
    pub fn grow(&mut self, job: &str, extra: i64, max: usize) -> JobResult<usize> {
        let new_size = self.grown_size(extra);
        if new_size > max {
            return Err(JobError::TaskMapOverflow {
                job: job.to_string(),
                requested: new_size,
                max,
            });
        }
        self.slots.resize(new_size, None);
        Ok(new_size)
    }
}

// =============================================================================
// Job
// =============================================================================

/// Job behavior flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobFlags {
    /// Scheduled by another authority; never backfilled here.
    pub cluster_locked: bool,
    pub ignore_rsv: bool,
    pub ignore_job_rsv: bool,
    pub ignore_idle_job_rsv: bool,
    pub best_effort: bool,
    pub preemptor: bool,
    pub preemptible: bool,
}

/// Membership of an array job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayMembership {
    pub group: String,
    pub index: u32,
}

/// A trigger attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTrigger {
    pub name: String,
    /// The job may not start until this trigger completes.
    pub blocks_start: bool,
    pub completed: bool,
}

/// A unit of schedulable work.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub alt_name: Option<String>,

    pub state: JobState,
    pub estate: JobState,
    /// When `estate` last changed.
    pub estate_at: i64,

    pub reqs: Vec<Req>,
    pub alloc_tc: u32,
    pub alloc_nc: u32,
    pub node_list: Vec<NodeAlloc>,
    pub task_map: TaskMap,

    pub submit_time: i64,
    pub system_queue_time: Option<i64>,
    pub start_time: i64,
    pub completion_time: Option<i64>,
    pub spec_walltime: i64,
    pub walltime: i64,
    pub deadline: Option<i64>,

    pub start_priority: i64,
    /// User-requested priority bias fed to the priority formula.
    pub user_priority: i64,
    pub partition_priority: BTreeMap<String, i64>,
    pub run_priority: i64,
    pub eff_queue_duration: i64,

    pub rsv: Option<RsvHandle>,
    pub creds: JobCredentials,
    pub messages: MessageBuffer,
    pub holds: Holds,
    pub start_count: u32,
    pub pal: PartitionMask,
    pub flags: JobFlags,
    pub distribution: Option<DistributionPolicy>,
    pub geometry: Option<String>,
    pub array: Option<ArrayMembership>,
    pub sync_with: Vec<String>,
    pub sync_master: Option<String>,
    pub exclude_hosts: BTreeSet<String>,
    /// Reservation names/groups the job may use (`ALL`, `[ALLJOB]` allowed).
    pub rsv_access: Vec<String>,
    /// Reservation names the job must avoid.
    pub rsv_exclude: Vec<String>,
    pub required_rsv: Option<String>,
    pub triggers: Vec<JobTrigger>,

    pub prolog_pending: bool,
    pub internally_requeued: bool,
    pub checkpoint_start_time: Option<i64>,
    pub pending_data_stage: bool,
    pub cancel_requested: Option<String>,
    pub suspended_by_scheduler: bool,
    pub partition: Option<String>,

    pub block: Option<BlockRecord>,
    /// Last time queue duration was accrued.
    pub accrued_at: Option<i64>,
}

impl Job {
    pub fn new(name: impl Into<String>, creds: JobCredentials) -> Self {
        Self {
            name: name.into(),
            alt_name: None,
            state: JobState::Idle,
            estate: JobState::Idle,
            estate_at: 0,
            reqs: Vec::new(),
            alloc_tc: 0,
            alloc_nc: 0,
            node_list: Vec::new(),
            task_map: TaskMap::default(),
            submit_time: 0,
            system_queue_time: None,
            start_time: 0,
            completion_time: None,
            spec_walltime: 0,
            walltime: 0,
            deadline: None,
            start_priority: 0,
            user_priority: 0,
            partition_priority: BTreeMap::new(),
            run_priority: 0,
            eff_queue_duration: 0,
            rsv: None,
            creds,
            messages: MessageBuffer::default(),
            holds: Holds::default(),
            start_count: 0,
            pal: PartitionMask::all(),
            flags: JobFlags::default(),
            distribution: None,
            geometry: None,
            array: None,
            sync_with: Vec::new(),
            sync_master: None,
            exclude_hosts: BTreeSet::new(),
            rsv_access: Vec::new(),
            rsv_exclude: Vec::new(),
            required_rsv: None,
            triggers: Vec::new(),
            prolog_pending: false,
            internally_requeued: false,
            checkpoint_start_time: None,
            pending_data_stage: false,
            cancel_requested: None,
            suspended_by_scheduler: false,
            partition: None,
            block: None,
            accrued_at: None,
        }
    }

    pub fn with_req(mut self, req: Req) -> Self {
        self.create_request(Some(&req));
        self
    }

    pub fn with_walltime(mut self, secs: i64) -> Self {
        self.spec_walltime = secs;
        self.walltime = secs;
        self
    }

    /// Sets the user priority bias and seeds the start priority with it.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.user_priority = priority;
        self.start_priority = priority;
        self
    }

    /// Appends a request copied from `template` (or empty) and returns its index.
    pub fn create_request(&mut self, template: Option<&Req>) -> usize {
        let index = self.reqs.len();
        let mut req = template
            .cloned()
            .unwrap_or_else(|| Req::new(0, Resources::default()));
        req.index = index as u32;
        req.node_list.clear();
        self.reqs.push(req);
        index
    }

    /// Total requested tasks.
    pub fn request_tc(&self) -> u32 {
        self.reqs.iter().map(|r| r.task_count).sum()
    }

    /// Processors requested across all reqs.
    pub fn requested_procs(&self) -> i64 {
        self.reqs
            .iter()
            .map(|r| r.dres.procs.max(1) * i64::from(r.task_count))
            .sum()
    }

    /// Checks `expected` against the per-req task counts.
    pub fn verify_request_tc(&self, expected: u32) -> JobResult<()> {
        let actual = self.request_tc();
        if actual == expected {
            Ok(())
        } else {
            Err(JobError::RequestCountMismatch {
                job: self.name.clone(),
                expected,
                actual,
            })
        }
    }

    /// Whether the job currently holds resources.
    pub fn has_live_allocation(&self) -> bool {
        self.alloc_tc > 0
    }

    /// Nodes in the merged allocation.
    pub fn allocated_nodes(&self) -> Vec<NodeHandle> {
        self.node_list.iter().map(|a| a.node).collect()
    }

    /// Priority inside `partition`, falling back to the global value.
    pub fn priority_in(&self, partition: &str) -> i64 {
        self.partition_priority
            .get(partition)
            .copied()
            .unwrap_or(self.start_priority)
    }

    /// Remaining walltime at `now` for an active job.
    pub fn remaining(&self, now: i64) -> i64 {
        (self.start_time + self.walltime - now).max(0)
    }

    /// Drops all allocation bookkeeping: counts, node lists, task map.
    pub fn clear_allocation(&mut self) {
        self.alloc_tc = 0;
        self.alloc_nc = 0;
        self.node_list.clear();
        for req in &mut self.reqs {
            req.node_list.clear();
        }
        self.task_map.terminate();
    }

    /// Sets expected state, stamping the transition time.
    pub fn expect(&mut self, state: JobState, now: i64) {
        if self.estate != state {
            self.estate = state;
            self.estate_at = now;
        }
    }

    /// Triggers the job must wait for are still outstanding.
    pub fn waiting_on_triggers(&self) -> bool {
        self.triggers.iter().any(|t| t.blocks_start && !t.completed)
    }

    /// Applies a hold and records the message.
    pub fn hold(&mut self, kind: HoldKind, reason: HoldReason, until: Option<i64>, now: i64, msg: &str) {
        self.holds.set(kind, reason, until);
        if kind != HoldKind::Defer {
            self.state = JobState::Hold;
        }
        self.messages.push(now, msg);
    }

    /// Copy of this job for what-if evaluation.
    ///
    /// Owned data (requests, messages, task map) is deep-copied; credentials
    /// stay shared. The copy is never bound to a reservation and carries no
    /// allocation. Triggers are copied only when asked.
    pub fn duplicate(&self, copy_triggers: bool) -> Job {
        let mut dup = self.clone();
        dup.rsv = None;
        dup.clear_allocation();
        dup.block = None;
        if !copy_triggers {
            dup.triggers.clear();
        }
        dup
    }
}

// =============================================================================
// Job table
// =============================================================================

/// A finished job kept for reporting.
#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub job: Job,
    pub completed_at: i64,
}

/// Active and completed jobs.
#[derive(Debug)]
pub struct JobTable {
    jobs: Arena<JobHandle, Job>,
    by_name: HashMap<String, JobHandle>,
    completed: VecDeque<CompletedJob>,
    completed_capacity: usize,
    max_task_count: usize,
    first_overflow: Option<String>,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new(1024, 4096)
    }
}

impl JobTable {
    pub fn new(completed_capacity: usize, max_task_count: usize) -> Self {
        Self {
            jobs: Arena::new(),
            by_name: HashMap::new(),
            completed: VecDeque::new(),
            completed_capacity,
            max_task_count,
            first_overflow: None,
        }
    }

    pub fn insert(&mut self, job: Job) -> JobResult<JobHandle> {
        if self.by_name.contains_key(&job.name) {
            return Err(JobError::Duplicate(job.name));
        }
        let name = job.name.clone();
        let handle = self.jobs.insert(job);
        self.by_name.insert(name, handle);
        Ok(handle)
    }

    pub fn find(&self, name: &str) -> Option<JobHandle> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, handle: JobHandle) -> Option<&Job> {
        self.jobs.get(handle)
    }

    pub fn get_mut(&mut self, handle: JobHandle) -> Option<&mut Job> {
        self.jobs.get_mut(handle)
    }

    pub fn by_name(&self, name: &str) -> Option<&Job> {
        self.find(name).and_then(|h| self.jobs.get(h))
    }

    /// Live jobs in slot order; tombstoned slots are skipped.
    pub fn iter(&self) -> impl Iterator<Item = (JobHandle, &Job)> {
        self.jobs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (JobHandle, &mut Job)> {
        self.jobs.iter_mut()
    }

    pub fn handles(&self) -> Vec<JobHandle> {
        self.jobs.handles()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Freed slots awaiting reuse.
    pub fn tombstones(&self) -> usize {
        self.jobs.tombstones()
    }

    /// Frees a job that never ran (pseudo or template jobs).
    pub fn remove(&mut self, handle: JobHandle) -> Option<Job> {
        let job = self.jobs.remove(handle)?;
        self.by_name.remove(&job.name);
        Some(job)
    }

    /// Moves a job into the bounded completed table.
    pub fn complete(&mut self, handle: JobHandle, now: i64) -> Option<&CompletedJob> {
        let mut job = self.remove(handle)?;
        job.completion_time.get_or_insert(now);
        if self.completed.len() >= self.completed_capacity {
            self.completed.pop_front();
        }
        self.completed.push_back(CompletedJob {
            job,
            completed_at: now,
        });
        self.completed.back()
    }

    pub fn find_completed(&self, name: &str) -> Option<&CompletedJob> {
        self.completed.iter().rev().find(|c| c.job.name == name)
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Drops completed jobs older than `retention`. Returns how many went.
    pub fn purge_completed(&mut self, now: i64, retention: i64) -> usize {
        let before = self.completed.len();
        self.completed.retain(|c| c.completed_at + retention > now);
        before - self.completed.len()
    }

    /// Grows a job's task map, recording the first job to overflow.
    pub fn grow_task_map(&mut self, handle: JobHandle, extra: i64) -> JobResult<usize> {
        let max = self.max_task_count;
        let job = self
            .jobs
            .get_mut(handle)
            .ok_or_else(|| JobError::NotFound(handle.to_string()))?;
        let name = job.name.clone();
        match job.task_map.grow(&name, extra, max) {
            Ok(size) => Ok(size),
            Err(e) => {
                if self.first_overflow.is_none() {
                    warn!(job = %name, max, "task map overflow");
                    self.first_overflow = Some(name);
                }
                Err(e)
            }
        }
    }

    pub fn max_task_count(&self) -> usize {
        self.max_task_count
    }

    /// Name of the first job whose task map could not grow.
    pub fn first_task_map_overflow(&self) -> Option<&str> {
        self.first_overflow.as_deref()
    }
}
