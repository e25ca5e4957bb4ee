//! Resource matching and allocation.
//!
//! Planning ([`plan_allocation`], [`earliest_start`]) is a pure read of
//! [`SchedState`]; [`allocate_nodes`] commits a plan atomically and
//! [`release_allocation`] reverses it. A multi-request job either gets
//! every request placed or nothing changes.

pub mod commit;
pub mod distribute;
pub mod feasible;
pub mod geometry;

use std::collections::{BTreeSet, HashMap};

use batchd_id::{JobHandle, NodeHandle};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::model::{Job, JobError, NodeAlloc, RejectReason, Req, Resources};
use crate::rsv::RsvNodeClaim;
use crate::state::SchedState;

pub use commit::{
    adopt_allocation, allocate_nodes, check_allocation, park_allocation, reclaim_allocation,
    release_allocation,
};
pub use distribute::{
    select_strategy, ArbitraryGeometry, Disperse, Distribution, Pack, RoundRobin, SharedMemory,
    TaskDistributionStrategy,
};
pub use feasible::{
    availability_ranges, event_times, AvailabilityRange, Candidate, Feasibility,
    PreemptionCredit, Window,
};
pub use geometry::{parse_geometry, GeometryError, GeometryLimits, TaskGeometry};

/// Allocation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {0} has no resource requests")]
    EmptyRequest(String),

    #[error("no feasible nodes for job {job} req {req}: {reason}")]
    NoFeasibleNodes {
        job: String,
        req: usize,
        reason: RejectReason,
    },

    #[error("{strategy} distribution cannot place {requested} tasks on {available} slots")]
    Unplaceable {
        strategy: &'static str,
        requested: u32,
        available: u32,
    },

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    TaskMap(#[from] JobError),

    #[error("node {0} is no longer in the table")]
    StaleNode(String),

    #[error("node {node} cannot take job {job}: {reason}")]
    Oversubscribed {
        job: String,
        node: String,
        reason: RejectReason,
    },

    #[error("job {0} already holds an allocation")]
    AlreadyAllocated(String),
}

impl AllocError {
    /// Node-level reason for diagnostics.
    pub fn reason(&self) -> RejectReason {
        match self {
            Self::NoFeasibleNodes { reason, .. } | Self::Oversubscribed { reason, .. } => *reason,
            Self::Unplaceable { .. } => RejectReason::Cpu,
            Self::Geometry(_) | Self::TaskMap(_) => RejectReason::Policy,
            Self::StaleNode(_) => RejectReason::State,
            Self::JobNotFound(_) | Self::EmptyRequest(_) | Self::AlreadyAllocated(_) => {
                RejectReason::None
            }
        }
    }

    /// The job itself is malformed; retrying will not help.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::Geometry(_) | Self::TaskMap(_))
    }
}

pub type AllocResult<T> = Result<T, AllocError>;

/// Planning knobs.
#[derive(Debug, Clone, Default)]
pub struct AllocOptions {
    /// Count lower-priority preemptible jobs' resources as free.
    pub allow_preemption: bool,
    /// Only these nodes may be used (starting onto reserved nodes).
    pub restrict_to: Option<BTreeSet<NodeHandle>>,
}

/// Task and node counts one request is placed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqShape {
    pub task_count: u32,
    pub node_count: u32,
    pub tasks_per_node: u32,
    pub mem_per_task: i64,
}

impl ReqShape {
    pub fn of(req: &Req) -> Self {
        Self {
            task_count: req.task_count,
            node_count: req.node_count,
            tasks_per_node: req.tasks_per_node,
            mem_per_task: req.dres.mem,
        }
    }
}

/// Placement of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqPlan {
    pub req_index: usize,
    pub task_count: u32,
    pub allocs: Vec<NodeAlloc>,
    pub task_order: Vec<NodeHandle>,
}

/// A complete, uncommitted allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocPlan {
    pub job: JobHandle,
    pub partition: String,
    pub start: i64,
    pub walltime: i64,
    /// Malleable shape used, `None` for the primary request.
    pub shape: Option<usize>,
    pub reqs: Vec<ReqPlan>,
    /// Jobs that must be preempted before this plan can start.
    pub preempt: Vec<JobHandle>,
}

impl AllocPlan {
    pub fn task_count(&self) -> u32 {
        self.reqs.iter().map(|r| r.task_count).sum()
    }

    /// Distinct nodes in first-use order.
    pub fn nodes(&self) -> Vec<NodeHandle> {
        let mut seen = BTreeSet::new();
        self.reqs
            .iter()
            .flat_map(|r| r.allocs.iter().map(|a| a.node))
            .filter(|n| seen.insert(*n))
            .collect()
    }

    /// Per-node claims for a reservation covering this plan.
    pub fn claims(&self, state: &SchedState) -> Vec<RsvNodeClaim> {
        let Some(job) = state.jobs.get(self.job) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for rp in &self.reqs {
            let Some(req) = job.reqs.get(rp.req_index) else {
                continue;
            };
            for alloc in &rp.allocs {
                if let Some(node) = state.nodes.get(alloc.node) {
                    out.push(RsvNodeClaim {
                        node: alloc.node,
                        task_count: alloc.task_count,
                        res: req.consumption(node, alloc.task_count),
                    });
                }
            }
        }
        out
    }
}

/// One shape to try: the primary request or a malleable alternative.
#[derive(Debug, Clone, Copy)]
struct Attempt {
    index: Option<usize>,
    first: ReqShape,
    walltime: i64,
}

fn attempts(job: &Job) -> Vec<Attempt> {
    let Some(first) = job.reqs.first() else {
        return Vec::new();
    };
    let primary = ReqShape::of(first);
    let mut out = vec![Attempt {
        index: None,
        first: primary,
        walltime: job.walltime,
    }];
    // Shapes are stored smallest first; the largest that fits wins.
    for (i, s) in first.shapes.iter().enumerate().rev() {
        out.push(Attempt {
            index: Some(i),
            first: ReqShape {
                task_count: s.task_count,
                node_count: s.node_count,
                ..primary
            },
            walltime: s.walltime,
        });
    }
    out
}

fn is_preemptor(job: &Job) -> bool {
    job.flags.preemptor || job.creds.qos.as_ref().is_some_and(|q| q.flags.preemptor)
}

fn plan_attempt(
    window: &Window<'_>,
    attempt: &Attempt,
    geometry: Option<&TaskGeometry>,
) -> AllocResult<Vec<ReqPlan>> {
    let state = window.state;
    let job = window.job;
    let policy = job
        .distribution
        .or(window.partition.distribution)
        .unwrap_or(state.policy.default_distribution);

    let mut scratch: HashMap<NodeHandle, Resources> = HashMap::new();
    let mut plans = Vec::with_capacity(job.reqs.len());

    for (i, req) in job.reqs.iter().enumerate() {
        let shape = if i == 0 { attempt.first } else { ReqShape::of(req) };
        let feas = window.feasible_nodes(req, &scratch);
        if feas.total_tasks() < shape.task_count {
            return Err(AllocError::NoFeasibleNodes {
                job: job.name.clone(),
                req: i,
                reason: feas.reason,
            });
        }

        let strategy = select_strategy(
            policy,
            window.partition.shared_mem,
            geometry.filter(|_| i == 0),
        );
        let dist = strategy.distribute(&feas.candidates, &shape)?;

        for alloc in &dist.allocs {
            let node = state
                .nodes
                .get(alloc.node)
                .ok_or_else(|| AllocError::StaleNode(alloc.node.to_string()))?;
            scratch
                .entry(alloc.node)
                .or_default()
                .add(&req.consumption(node, alloc.task_count));
        }
        plans.push(ReqPlan {
            req_index: i,
            task_count: dist.task_count(),
            allocs: dist.allocs,
            task_order: dist.task_order,
        });
    }
    Ok(plans)
}

/// Plans `job` in `partition` for a window opening at `start`.
///
/// Tries the primary request, then malleable shapes, then (when allowed)
/// the same with lower-priority preemptible work counted as free.
#[instrument(skip(state, opts), fields(job = %handle))]
pub fn plan_allocation(
    state: &SchedState,
    handle: JobHandle,
    partition: &str,
    start: i64,
    now: i64,
    opts: &AllocOptions,
) -> AllocResult<AllocPlan> {
    let job = state
        .jobs
        .get(handle)
        .ok_or_else(|| AllocError::JobNotFound(handle.to_string()))?;
    let no_partition = || AllocError::NoFeasibleNodes {
        job: job.name.clone(),
        req: 0,
        reason: RejectReason::Partition,
    };
    let part = state.partition(partition).ok_or_else(no_partition)?;
    if !job.pal.contains(part.index) {
        return Err(no_partition());
    }
    if job.reqs.is_empty() {
        return Err(AllocError::EmptyRequest(job.name.clone()));
    }

    let geometry = match &job.geometry {
        Some(g) => Some(parse_geometry(
            g,
            GeometryLimits {
                task_count: job.reqs[0].task_count,
                max_task_count: state.jobs.max_task_count(),
                taskmap_size: job.task_map.capacity().max(job.request_tc() as usize + 1),
            },
        )?),
        None => None,
    };

    let creds = state.cred_list(job, part);
    let attempts = attempts(job);
    let credit = (opts.allow_preemption && is_preemptor(job))
        .then(|| PreemptionCredit::collect(state, handle, partition))
        .filter(|c| !c.jobs.is_empty());

    let mut last_err = None;
    for credit in std::iter::once(None).chain(credit.as_ref().map(Some)) {
        for attempt in &attempts {
            let end = if job.flags.best_effort {
                start + 1
            } else {
                start + attempt.walltime.max(1)
            };
            let window = Window::new(state, handle, job, part, &creds, opts)
                .span(start, end, now)
                .with_credit(credit);
            match plan_attempt(&window, attempt, geometry.as_ref()) {
                Ok(reqs) => {
                    let mut plan = AllocPlan {
                        job: handle,
                        partition: part.name.clone(),
                        start,
                        walltime: attempt.walltime,
                        shape: attempt.index,
                        reqs,
                        preempt: Vec::new(),
                    };
                    if let Some(c) = credit {
                        let used: BTreeSet<_> = plan.nodes().into_iter().collect();
                        plan.preempt = c.jobs_on(state, &used);
                    }
                    debug!(
                        job = %job.name,
                        start,
                        tasks = plan.task_count(),
                        preempt = plan.preempt.len(),
                        "allocation planned"
                    );
                    return Ok(plan);
                }
                Err(e) => last_err = Some(e),
            }
        }
    }
    Err(last_err.unwrap_or_else(|| AllocError::EmptyRequest(job.name.clone())))
}

/// Earliest window at or after `now` in which the whole job fits.
///
/// Candidate starts are the boundaries of the availability range map;
/// only ranges where every request fits are planned in full.
pub fn earliest_start(
    state: &SchedState,
    handle: JobHandle,
    partition: &str,
    now: i64,
    opts: &AllocOptions,
) -> AllocResult<AllocPlan> {
    let job = state
        .jobs
        .get(handle)
        .ok_or_else(|| AllocError::JobNotFound(handle.to_string()))?;
    let part = state.partition(partition).ok_or_else(|| AllocError::NoFeasibleNodes {
        job: job.name.clone(),
        req: 0,
        reason: RejectReason::Partition,
    })?;

    let mut last_err = AllocError::NoFeasibleNodes {
        job: job.name.clone(),
        req: 0,
        reason: RejectReason::Cpu,
    };
    for range in availability_ranges(state, handle, part, now, opts) {
        if !range.satisfies {
            continue;
        }
        match plan_allocation(state, handle, partition, range.start, now, opts) {
            Ok(plan) => return Ok(plan),
            Err(e) if e.is_invariant_violation() => return Err(e),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}
