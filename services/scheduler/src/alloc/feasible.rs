//! Node feasibility for one request over a time window.
//!
//! A window `[start, end)` starting at or before `now` sees the node's
//! current dedicated and utilized amounts; later windows see configured
//! capacity. Reservations overlapping the window subtract their claims
//! unless the job may use them.

use std::collections::{BTreeSet, HashMap};

use batchd_id::{JobHandle, NodeHandle};

use super::{AllocOptions, ReqShape};
use crate::model::{
    task_count_within, CredKind, Job, Node, NodeAllocPolicy, Partition, RejectReason, Req,
    Resources,
};
use crate::rsv::{check_job_access, AccessContext, Reservation, RsvKind};
use crate::state::SchedState;

/// A node able to host at least one task of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub node: NodeHandle,
    pub tasks: u32,
    /// Configured memory, used by shared-memory placement.
    pub mem: i64,
}

/// Feasible nodes for one request, in allocation order.
#[derive(Debug, Clone, Default)]
pub struct Feasibility {
    pub candidates: Vec<Candidate>,
    /// Most common reason among rejected nodes.
    pub reason: RejectReason,
}

impl Feasibility {
    pub fn total_tasks(&self) -> u32 {
        self.candidates.iter().map(|c| c.tasks).sum()
    }
}

/// Resources that preempting lower-priority jobs would free.
#[derive(Debug, Clone, Default)]
pub struct PreemptionCredit {
    pub jobs: Vec<JobHandle>,
    pub freed: HashMap<NodeHandle, Resources>,
}

impl PreemptionCredit {
    /// Active, preemptible jobs in `partition` ranked below `preemptor`.
    pub fn collect(state: &SchedState, preemptor: JobHandle, partition: &str) -> Self {
        let mut credit = Self::default();
        let Some(owner) = state.jobs.get(preemptor) else {
            return credit;
        };
        let floor = owner.priority_in(partition);

        for (h, job) in state.jobs.iter() {
            let protected = job
                .creds
                .qos
                .as_ref()
                .is_some_and(|q| q.flags.no_preemptible);
            if h == preemptor
                || !job.flags.preemptible
                || protected
                || !job.estate.is_active()
                || !job.has_live_allocation()
                || job.priority_in(partition) >= floor
            {
                continue;
            }
            let mut touched = false;
            for req in &job.reqs {
                for alloc in &req.node_list {
                    let Some(node) = state.nodes.get(alloc.node) else {
                        continue;
                    };
                    if node.partition != partition {
                        continue;
                    }
                    credit
                        .freed
                        .entry(alloc.node)
                        .or_default()
                        .add(&req.consumption(node, alloc.task_count));
                    touched = true;
                }
            }
            if touched {
                credit.jobs.push(h);
            }
        }
        credit
    }

    /// Credited jobs holding any of `nodes`.
    pub fn jobs_on(&self, state: &SchedState, nodes: &BTreeSet<NodeHandle>) -> Vec<JobHandle> {
        self.jobs
            .iter()
            .copied()
            .filter(|h| {
                state
                    .jobs
                    .get(*h)
                    .is_some_and(|j| j.node_list.iter().any(|a| nodes.contains(&a.node)))
            })
            .collect()
    }
}

/// Interval during which the job's requests could be co-allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityRange {
    pub start: i64,
    pub end: i64,
    /// Tasks available, capped per request at what it asks for.
    pub task_count: u32,
    pub node_count: u32,
    /// Every request fits inside this interval.
    pub satisfies: bool,
}

/// One evaluation window for one job.
pub struct Window<'a> {
    pub state: &'a SchedState,
    pub handle: JobHandle,
    pub job: &'a Job,
    pub partition: &'a Partition,
    pub creds: &'a [(CredKind, String)],
    pub start: i64,
    pub end: i64,
    pub now: i64,
    pub restrict_to: Option<&'a BTreeSet<NodeHandle>>,
    pub credit: Option<&'a PreemptionCredit>,
}

impl<'a> Window<'a> {
    /// Window at `now` of zero length; set the span with [`Window::span`].
    pub fn new(
        state: &'a SchedState,
        handle: JobHandle,
        job: &'a Job,
        partition: &'a Partition,
        creds: &'a [(CredKind, String)],
        opts: &'a AllocOptions,
    ) -> Self {
        Self {
            state,
            handle,
            job,
            partition,
            creds,
            start: 0,
            end: 0,
            now: 0,
            restrict_to: opts.restrict_to.as_ref(),
            credit: None,
        }
    }

    pub fn span(mut self, start: i64, end: i64, now: i64) -> Self {
        self.start = start;
        self.end = end;
        self.now = now;
        self
    }

    pub fn with_credit(mut self, credit: Option<&'a PreemptionCredit>) -> Self {
        self.credit = credit;
        self
    }

    fn is_current(&self) -> bool {
        self.start <= self.now
    }

    fn access_context(&self, rsv: &Reservation) -> AccessContext<'a> {
        let owner_active = rsv
            .job()
            .and_then(|h| self.state.jobs.get(h))
            .is_some_and(|j| j.estate.is_active() || j.state.is_active());
        let jobs_in_rsv = if rsv.max_jobs.is_some() {
            jobs_inside(self.state, rsv, self.now)
        } else {
            0
        };
        AccessContext {
            job: self.job,
            handle: Some(self.handle),
            creds: self.creds,
            jobs_in_rsv,
            owner_active,
            now: self.now,
        }
    }

    /// Claims on `node` from reservations this job may not use.
    fn blocking_claims(&self, nh: NodeHandle, node: &Node) -> Option<Resources> {
        let mut total: Option<Resources> = None;
        for rh in &node.rsv_refs {
            let Some(rsv) = self.state.rsvs.get(*rh) else {
                continue;
            };
            if !rsv.overlaps(self.start, self.end) || rsv.job() == Some(self.handle) {
                continue;
            }
            if rsv.kind == RsvKind::ActiveJob {
                // Current windows already see the running job in dres.
                if self.is_current() {
                    continue;
                }
                let preempted = rsv
                    .job()
                    .is_some_and(|h| self.credit.is_some_and(|c| c.jobs.contains(&h)));
                if preempted {
                    continue;
                }
            }
            if check_job_access(rsv, &self.access_context(rsv)).granted {
                continue;
            }
            for claim in rsv.nodes.iter().filter(|c| c.node == nh) {
                total.get_or_insert_with(Resources::default).add(&claim.res);
            }
        }
        total
    }

    /// Tasks of `req` that `node` can host in this window.
    ///
    /// `scratch` holds what earlier requests of the same job already took
    /// from the node.
    pub fn node_task_count(
        &self,
        nh: NodeHandle,
        node: &Node,
        req: &Req,
        scratch: Option<&Resources>,
    ) -> (u32, RejectReason) {
        if node.partition != self.partition.name {
            return (0, RejectReason::Partition);
        }
        if node.state.is_out_of_service() {
            return (0, RejectReason::State);
        }
        if self.job.exclude_hosts.contains(&node.name) {
            return (0, RejectReason::Excluded);
        }
        if !req.node_matches(node) {
            return (0, RejectReason::Features);
        }
        if self.restrict_to.is_some_and(|set| !set.contains(&nh)) {
            return (0, RejectReason::Reservation);
        }

        let freed = self
            .credit
            .filter(|_| self.is_current())
            .and_then(|c| c.freed.get(&nh));
        let credited;
        let view = match freed {
            Some(res) => {
                let mut n = node.clone();
                n.release(res);
                credited = n;
                &credited
            }
            None => node,
        };

        let policy = &self.state.policy.node_availability_policy;
        let (base_tc, reason) =
            view.available_task_count(&req.dres, self.start, self.now, 1, policy);
        if base_tc == 0 {
            return (0, reason);
        }

        let claims = self.blocking_claims(nh, view);
        let scratch = scratch.filter(|s| !s.is_empty());
        if claims.is_none() && scratch.is_none() {
            return (base_tc, RejectReason::None);
        }

        let mut avail = if self.is_current() {
            view.cres.minus(&view.dres)
        } else {
            view.cres.clone()
        };
        if let Some(c) = &claims {
            avail = avail.minus(c);
        }
        if let Some(s) = scratch {
            avail = avail.minus(s);
        }
        let (tc, reason) = task_count_within(&avail, &view.cres, &req.dres, 1);
        if tc == 0 {
            let reason = if claims.is_some() {
                RejectReason::Reservation
            } else {
                reason
            };
            return (0, reason);
        }
        (base_tc.min(tc), RejectReason::None)
    }

    /// Feasible partition nodes for `req`, ordered by the partition's
    /// node allocation policy.
    pub fn feasible_nodes(
        &self,
        req: &Req,
        scratch: &HashMap<NodeHandle, Resources>,
    ) -> Feasibility {
        let mut out = Feasibility::default();
        let mut tally: Vec<(RejectReason, u32)> = Vec::new();

        for nh in self.state.nodes.in_partition(&self.partition.name) {
            let Some(node) = self.state.nodes.get(nh) else {
                continue;
            };
            let (tasks, reason) = self.node_task_count(nh, node, req, scratch.get(&nh));
            if tasks > 0 {
                out.candidates.push(Candidate {
                    node: nh,
                    tasks,
                    mem: node.cres.mem,
                });
            } else {
                match tally.iter_mut().find(|(r, _)| *r == reason) {
                    Some((_, n)) => *n += 1,
                    None => tally.push((reason, 1)),
                }
            }
        }

        let mut dominant: Option<(RejectReason, u32)> = None;
        for (reason, n) in tally {
            if dominant.is_none_or(|(_, best)| n > best) {
                dominant = Some((reason, n));
            }
        }
        out.reason = dominant.map(|(r, _)| r).unwrap_or(RejectReason::Cpu);
        order_candidates(&mut out.candidates, self.partition.node_alloc_policy, self.state);
        out
    }
}

/// Orders candidates per the partition's node allocation policy.
pub fn order_candidates(candidates: &mut [Candidate], policy: NodeAllocPolicy, state: &SchedState) {
    match policy {
        NodeAllocPolicy::FirstAvailable => {}
        NodeAllocPolicy::MinResource => candidates.sort_by_key(|c| {
            state
                .nodes
                .get(c.node)
                .map(|n| n.cres.procs)
                .unwrap_or(i64::MAX)
        }),
        NodeAllocPolicy::MaxAvailable => candidates.sort_by(|a, b| b.tasks.cmp(&a.tasks)),
    }
}

/// Active jobs running on nodes of a started reservation.
fn jobs_inside(state: &SchedState, rsv: &Reservation, now: i64) -> u32 {
    if rsv.start > now {
        return 0;
    }
    let nodes: BTreeSet<NodeHandle> = rsv.nodes.iter().map(|c| c.node).collect();
    state
        .jobs
        .iter()
        .filter(|(h, j)| {
            Some(*h) != rsv.job()
                && j.estate.is_active()
                && j.start_time >= rsv.start
                && j.node_list.iter().any(|a| nodes.contains(&a.node))
        })
        .count() as u32
}

/// Times at which availability may change: `now` and every reservation
/// boundary after it.
pub fn event_times(state: &SchedState, now: i64) -> Vec<i64> {
    let mut times: Vec<i64> = std::iter::once(now)
        .chain(
            state
                .rsvs
                .iter()
                .flat_map(|(_, r)| [r.start, r.end])
                .filter(|t| *t > now),
        )
        .chain(
            state
                .jobs
                .iter()
                .filter(|(_, j)| j.estate.is_active() && j.rsv.is_none())
                .map(|(_, j)| j.start_time + j.walltime)
                .filter(|t| *t > now),
        )
        .collect();
    times.sort_unstable();
    times.dedup();
    times
}

/// Range map of the job's co-allocation capacity from `now` on.
///
/// Adjacent intervals with identical capacity are merged.
pub fn availability_ranges(
    state: &SchedState,
    handle: JobHandle,
    partition: &Partition,
    now: i64,
    opts: &AllocOptions,
) -> Vec<AvailabilityRange> {
    let Some(job) = state.jobs.get(handle) else {
        return Vec::new();
    };
    let creds = state.cred_list(job, partition);
    let times = event_times(state, now);
    let tail = job.walltime.max(1);
    let empty = HashMap::new();
    let mut ranges: Vec<AvailabilityRange> = Vec::new();

    for (i, start) in times.iter().copied().enumerate() {
        let end = times.get(i + 1).copied().unwrap_or(start + tail);
        let window = Window::new(state, handle, job, partition, &creds, opts).span(start, end, now);
        let mut task_count = 0;
        let mut nodes = BTreeSet::new();
        let mut satisfies = true;
        for req in &job.reqs {
            let feas = window.feasible_nodes(req, &empty);
            let tasks = feas.total_tasks();
            satisfies &= tasks >= ReqShape::of(req).task_count;
            task_count += tasks.min(req.task_count);
            nodes.extend(feas.candidates.iter().map(|c| c.node));
        }
        let range = AvailabilityRange {
            start,
            end,
            task_count,
            node_count: nodes.len() as u32,
            satisfies,
        };
        match ranges.last_mut() {
            Some(last)
                if last.end == range.start
                    && last.task_count == range.task_count
                    && last.node_count == range.node_count
                    && last.satisfies == range.satisfies =>
            {
                last.end = range.end;
            }
            _ => ranges.push(range),
        }
    }
    ranges
}
