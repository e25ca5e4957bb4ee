//! Job-backed reservation lifecycle.
//!
//! Active-job reservations protect running allocations and only ever grow.
//! Priority and deadline reservations are transient: future ones are
//! purged at the start of every iteration and rebuilt in priority order.

use std::collections::HashMap;

use batchd_id::{JobHandle, RsvHandle};
use tracing::{debug, info, instrument, warn};

use super::{Reservation, RsvError, RsvKind, RsvNodeClaim, RsvResult};
use crate::alloc::{earliest_start, plan_allocation, AllocOptions, AllocPlan};
use crate::config::{SchedPolicy, DEFAULT_RSV_BUCKET};
use crate::model::Job;
use crate::state::SchedState;

/// Evenly spaced start times tried for a deadline reservation.
const DEADLINE_START_CANDIDATES: i64 = 4;

/// Priority reservation slot accounting for one iteration.
///
/// Each QOS bucket gets `reservation_depth[bucket]` slots per partition and
/// each partition is additionally capped by `max_priority_rsv_per_partition`.
#[derive(Debug, Clone, Default)]
pub struct RsvSlots {
    by_bucket: HashMap<(String, String), u32>,
    by_partition: HashMap<String, u32>,
}

impl RsvSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slots already held by surviving priority reservations.
    pub fn from_table(state: &SchedState) -> Self {
        let mut slots = Self::new();
        for (_, rsv) in state.rsvs.iter() {
            if rsv.kind != RsvKind::PriorityJob {
                continue;
            }
            let bucket = rsv.bucket.clone().unwrap_or_else(|| DEFAULT_RSV_BUCKET.to_string());
            let partition = rsv.partition.clone().unwrap_or_default();
            slots.take(&bucket, &partition);
        }
        slots
    }

    /// Reservation bucket of `job`.
    pub fn bucket_of(job: &Job) -> String {
        job.creds
            .qos
            .as_ref()
            .and_then(|q| q.rsv_bucket.clone())
            .unwrap_or_else(|| DEFAULT_RSV_BUCKET.to_string())
    }

    pub fn used(&self, bucket: &str, partition: &str) -> u32 {
        self.by_bucket
            .get(&(bucket.to_string(), partition.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn available(&self, policy: &SchedPolicy, bucket: &str, partition: &str) -> bool {
        let in_partition = self.by_partition.get(partition).copied().unwrap_or(0);
        self.used(bucket, partition) < policy.bucket_depth(bucket)
            && policy
                .max_priority_rsv_per_partition
                .is_none_or(|max| in_partition < max)
    }

    fn take(&mut self, bucket: &str, partition: &str) {
        *self
            .by_bucket
            .entry((bucket.to_string(), partition.to_string()))
            .or_insert(0) += 1;
        *self.by_partition.entry(partition.to_string()).or_insert(0) += 1;
    }
}

fn job_claims(state: &SchedState, job: &Job) -> Vec<RsvNodeClaim> {
    let mut out = Vec::new();
    for req in &job.reqs {
        for alloc in &req.node_list {
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

fn job_rsv(
    state: &SchedState,
    handle: JobHandle,
    kind: RsvKind,
    plan: &AllocPlan,
    now: i64,
) -> RsvResult<Reservation> {
    let job = state
        .jobs
        .get(handle)
        .ok_or_else(|| RsvError::JobNotFound(handle.to_string()))?;
    let mut rsv = Reservation::new(job.name.clone(), kind, plan.start, plan.start + plan.walltime.max(1))
        .for_job(handle, job.name.clone())
        .with_claims(plan.claims(state));
    rsv.partition = Some(plan.partition.clone());
    rsv.created_at = now;
    Ok(rsv)
}

/// Protects a just-started job's allocation.
///
/// Any reservation the job held before (its priority reservation) is
/// released first. The window is `[start_time, start_time + walltime)`.
#[instrument(skip(state), fields(job = %handle))]
pub fn create_active_job_reservation(
    state: &mut SchedState,
    handle: JobHandle,
    now: i64,
) -> RsvResult<RsvHandle> {
    state
        .rsvs
        .release_job(handle, &mut state.jobs, &mut state.nodes);

    let job = state
        .jobs
        .get(handle)
        .ok_or_else(|| RsvError::JobNotFound(handle.to_string()))?;
    let start = job.start_time;
    let mut rsv = Reservation::new(
        job.name.clone(),
        RsvKind::ActiveJob,
        start,
        start + job.walltime.max(1),
    )
    .for_job(handle, job.name.clone())
    .with_claims(job_claims(state, job));
    rsv.flags.non_preemptible = true;
    rsv.partition = job.partition.clone();
    rsv.created_at = now;

    state.rsvs.create(rsv, &mut state.jobs, &mut state.nodes)
}

/// Keeps active-job reservations at or past `start_time + walltime`.
///
/// An overrunning job pushes its end out by at least one poll interval.
/// Ends never move backwards. Returns how many reservations moved.
pub fn extend_active_reservations(state: &mut SchedState, now: i64) -> usize {
    let step = state.policy.rsv_extension_min.max(state.policy.poll_interval).max(1);
    let mut moves = Vec::new();
    for (rh, rsv) in state.rsvs.iter() {
        if rsv.kind != RsvKind::ActiveJob {
            continue;
        }
        let Some(job) = rsv.job().and_then(|h| state.jobs.get(h)) else {
            continue;
        };
        let target = job.start_time + job.walltime;
        let mut end = rsv.end.max(target);
        if end <= now {
            end = now + step;
        }
        if end > rsv.end {
            moves.push((rh, rsv.name.clone(), end));
        }
    }

    for (rh, name, end) in &moves {
        match state.rsvs.set_end(*rh, *end) {
            Ok(()) => debug!(rsv = %name, end, "active reservation extended"),
            Err(e) => warn!(rsv = %name, error = %e, "failed to extend reservation"),
        }
    }
    moves.len()
}

/// Reserves the earliest feasible future window for a blocked job.
#[instrument(skip(state, slots), fields(job = %handle))]
pub fn create_priority_reservation(
    state: &mut SchedState,
    handle: JobHandle,
    partition: &str,
    now: i64,
    slots: &mut RsvSlots,
) -> RsvResult<RsvHandle> {
    let job = state
        .jobs
        .get(handle)
        .ok_or_else(|| RsvError::JobNotFound(handle.to_string()))?;
    if let Some(existing) = job.rsv {
        return Err(RsvError::JobAlreadyBound {
            job: job.name.clone(),
            rsv: state.rsvs.name_of(existing),
        });
    }
    let bucket = RsvSlots::bucket_of(job);
    if !slots.available(&state.policy, &bucket, partition) {
        return Err(RsvError::SlotsExhausted {
            bucket,
            partition: partition.to_string(),
        });
    }

    let plan = earliest_start(state, handle, partition, now, &AllocOptions::default()).map_err(
        |e| RsvError::NoFeasibleWindow {
            job: job.name.clone(),
            reason: e.to_string(),
        },
    )?;
    let mut rsv = job_rsv(state, handle, RsvKind::PriorityJob, &plan, now)?;
    rsv.bucket = Some(bucket.clone());

    let rh = state.rsvs.create(rsv, &mut state.jobs, &mut state.nodes)?;
    slots.take(&bucket, partition);
    info!(job = %state.rsvs.name_of(rh), start = plan.start, "priority reservation created");
    Ok(rh)
}

/// Reserves the latest window that still meets a job's deadline.
///
/// Up to four start times from `deadline - walltime` back to `now` are
/// tried, evenly spaced, latest first; the first that fits wins.
#[instrument(skip(state), fields(job = %handle))]
pub fn create_deadline_reservation(
    state: &mut SchedState,
    handle: JobHandle,
    partition: &str,
    now: i64,
) -> RsvResult<RsvHandle> {
    let job = state
        .jobs
        .get(handle)
        .ok_or_else(|| RsvError::JobNotFound(handle.to_string()))?;
    let name = job.name.clone();
    if let Some(existing) = job.rsv {
        return Err(RsvError::JobAlreadyBound {
            job: name,
            rsv: state.rsvs.name_of(existing),
        });
    }
    let Some(deadline) = job.deadline else {
        return Err(RsvError::NoFeasibleWindow {
            job: name,
            reason: "job has no deadline".into(),
        });
    };
    let latest = deadline - job.spec_walltime.max(job.walltime);
    if latest < now {
        return Err(RsvError::NoFeasibleWindow {
            job: name,
            reason: "deadline cannot be satisfied".into(),
        });
    }

    let span = latest - now;
    let tries = if span == 0 { 1 } else { DEADLINE_START_CANDIDATES };
    let mut last_reason = String::from("no resources before deadline");
    for i in 0..tries {
        let start = latest - i * span / (DEADLINE_START_CANDIDATES - 1);
        match plan_allocation(state, handle, partition, start, now, &AllocOptions::default()) {
            Ok(plan) => {
                let rsv = job_rsv(state, handle, RsvKind::DeadlineJob, &plan, now)?;
                let rh = state.rsvs.create(rsv, &mut state.jobs, &mut state.nodes)?;
                info!(job = %name, start, deadline, "deadline reservation created");
                return Ok(rh);
            }
            Err(e) => last_reason = e.to_string(),
        }
    }
    Err(RsvError::NoFeasibleWindow {
        job: name,
        reason: last_reason,
    })
}

/// Destroys future transient reservations so they can be rebuilt.
///
/// Mature ones survive until their job starts; non-preemptible ones are
/// kept. Returns the names destroyed.
pub fn purge_transient(state: &mut SchedState, now: i64) -> Vec<String> {
    let doomed = state
        .rsvs
        .select(|r| r.kind.is_transient() && !r.flags.non_preemptible && r.start > now);
    let mut names = Vec::with_capacity(doomed.len());
    for rh in doomed {
        if let Some(rsv) = state.rsvs.destroy(rh, &mut state.jobs, &mut state.nodes) {
            names.push(rsv.name);
        }
    }
    if !names.is_empty() {
        debug!(count = names.len(), "transient reservations purged");
    }
    names
}

/// Destroys reservations whose end or hard expiry has passed, unless an
/// active job is still bound. Returns the destroyed reservations.
pub fn expire_reservations(state: &mut SchedState, now: i64) -> Vec<Reservation> {
    let jobs = &state.jobs;
    let doomed = state.rsvs.select(|r| {
        let lapsed = r.end <= now || r.expire.is_some_and(|e| e <= now);
        let active = r
            .job()
            .and_then(|h| jobs.get(h))
            .is_some_and(|j| j.estate.is_active() || j.state.is_active());
        lapsed && !active
    });
    doomed
        .into_iter()
        .filter_map(|rh| state.rsvs.destroy(rh, &mut state.jobs, &mut state.nodes))
        .inspect(|r| debug!(rsv = %r.name, kind = %r.kind, "reservation expired"))
        .collect()
}
