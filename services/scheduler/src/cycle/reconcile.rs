//! Resource manager reconciliation.
//!
//! Folds one workload snapshot into the scheduler state: node capacity and
//! load, job arrivals and departures, and disagreements between the state
//! the scheduler expects a job to be in and the state the resource manager
//! reports.

use std::collections::{HashMap, HashSet};

use batchd_events::{
    EventKind, EventSink, JobRejectedPayload, NodeStatePayload, SchedEvent,
};
use batchd_id::{JobHandle, NodeHandle};
use batchd_reconcile::{classify, Agreement, DeferBackoff, RetryTracker};
use tracing::{debug, info, instrument, warn};

use crate::alloc::{adopt_allocation, release_allocation};
use crate::checkpoint::JobCheckpoint;
use crate::model::{HoldKind, HoldReason, Job, JobCredentials, JobState, Node, NodeState, Req};
use crate::rm::{JobSnapshot, JobSpec, NodeSnapshot, WorkloadSnapshot};
use crate::rsv::create_active_job_reservation;
use crate::sink::emit;
use crate::state::SchedState;

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub nodes_added: u32,
    pub nodes_purged: Vec<String>,
    pub jobs_added: u32,
    pub jobs_rejected: u32,
    pub jobs_requeued: u32,
    pub jobs_completed: Vec<String>,
}

/// Collaborators a reconciliation pass reports to.
pub struct ReconcileCtx<'a> {
    pub sink: &'a dyn EventSink,
    /// Checkpointed attributes waiting for their job to reappear.
    pub restored: &'a mut HashMap<String, JobCheckpoint>,
    pub retry: &'a mut RetryTracker,
}

/// Applies `snapshot` to `state`.
#[instrument(skip_all, fields(iteration = %state.iteration))]
pub fn apply_workload(
    state: &mut SchedState,
    snapshot: &WorkloadSnapshot,
    now: i64,
    ctx: &mut ReconcileCtx<'_>,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    let iteration = state.iteration;

    let before: HashMap<NodeHandle, NodeState> =
        state.nodes.iter().map(|(h, n)| (h, n.state)).collect();
    for snap in &snapshot.nodes {
        if sync_node(state, snap, now) {
            report.nodes_added += 1;
        }
    }

    let reported: HashSet<&str> = snapshot.jobs.iter().map(|j| j.spec.name.as_str()).collect();
    for snap in &snapshot.jobs {
        sync_job(state, snap, now, ctx, &mut report);
    }
    let vanished: Vec<JobHandle> = state
        .jobs
        .iter()
        .filter(|(_, j)| !reported.contains(j.name.as_str()))
        .map(|(h, _)| h)
        .collect();
    for h in vanished {
        let observed = match state.jobs.get(h) {
            Some(j) if j.cancel_requested.is_some() => JobState::Removed,
            Some(_) => JobState::Completed,
            None => continue,
        };
        finish_job(state, h, observed, None, now, ctx, &mut report);
    }
    link_sync_members(state);

    let policy = state.policy.node_availability_policy.clone();
    let max_load = state.policy.max_load;
    let mut changes = Vec::new();
    for (h, node) in state.nodes.iter_mut() {
        node.adjust_available_resources(&policy, max_load);
        let old = before.get(&h).copied().unwrap_or(NodeState::None);
        if old != node.state {
            changes.push((node.name.clone(), old, node.state));
        }
    }
    for (name, old, new) in changes {
        debug!(node = %name, old = %old.as_str(), new = %new.as_str(), "node state changed");
        emit(
            ctx.sink,
            EventKind::NodeStateChanged,
            &name,
            format!("{} -> {}", old.as_str(), new.as_str()),
            NodeStatePayload {
                old_state: old.as_str().to_string(),
                new_state: new.as_str().to_string(),
            },
            now,
            iteration,
        );
    }

    report.nodes_purged = state.nodes.purge_stale(now, state.policy.node_purge_time);
    for name in &report.nodes_purged {
        info!(node = %name, "stale node purged");
        ctx.sink.record(SchedEvent::simple(EventKind::NodePurged, name, "not reported", now, iteration));
    }
    state.partitions.refresh_capacity(&state.nodes);

    debug!(
        nodes = snapshot.nodes.len(),
        jobs = snapshot.jobs.len(),
        added = report.jobs_added,
        rejected = report.jobs_rejected,
        completed = report.jobs_completed.len(),
        "workload reconciled"
    );
    report
}

// =============================================================================
// Nodes
// =============================================================================

/// Returns true when the node is new.
fn sync_node(state: &mut SchedState, snap: &NodeSnapshot, now: i64) -> bool {
    let factors = state.policy.node_overcommit_factor.clone();
    if let Some(node) = state.nodes.find(&snap.name).and_then(|h| state.nodes.get_mut(h)) {
        if node.base != snap.configured || node.is_vm != snap.is_vm {
            node.base = snap.configured.clone();
            node.is_vm = snap.is_vm;
            node.apply_overcommit(&factors);
        }
        node.state = snap.state;
        node.load = snap.load;
        node.features = snap.features.iter().cloned().collect();
        node.last_update = now;
        return false;
    }

    let mut node = Node::new(snap.name.clone(), snap.partition.clone(), snap.configured.clone())
        .with_features(snap.features.iter().cloned());
    node.state = snap.state;
    node.load = snap.load;
    node.is_vm = snap.is_vm;
    node.last_update = now;
    state.add_node(node);
    info!(node = %snap.name, partition = %snap.partition, "node discovered");
    true
}

// =============================================================================
// Jobs
// =============================================================================

/// Builds a queued job from its submission attributes.
pub fn build_job(state: &mut SchedState, spec: &JobSpec) -> Job {
    let mut creds = JobCredentials::for_user(&mut state.creds, &spec.user);
    if let Some(g) = &spec.group {
        creds.group = state.creds.group(g);
    }
    if let Some(a) = &spec.account {
        creds.account = Some(state.creds.account(a));
    }
    if let Some(q) = &spec.qos {
        creds.qos = Some(state.creds.qos(q));
    }
    if let Some(c) = &spec.class {
        creds.class = Some(state.creds.class(c));
    }

    let mut job = Job::new(spec.name.clone(), creds)
        .with_walltime(spec.walltime)
        .with_priority(spec.priority);
    for rs in &spec.reqs {
        let mut req = Req::new(rs.tasks, rs.per_task.clone()).with_node_count(rs.node_count);
        req.tasks_per_node = rs.tasks_per_node;
        req.features = rs.features.iter().cloned().collect();
        req.shapes = rs.shapes.clone();
        job.create_request(Some(&req));
    }
    job.submit_time = spec.submit_time;
    job.deadline = spec.deadline;
    job.geometry = spec.geometry.clone();
    job.distribution = spec.distribution;
    job.flags = spec.flags.clone();
    job.sync_with = spec.sync_with.clone();
    job.exclude_hosts.extend(spec.exclude_hosts.iter().cloned());
    job.pal = state.partitions.mask_for(&spec.partitions);
    job
}

fn sync_job(
    state: &mut SchedState,
    snap: &JobSnapshot,
    now: i64,
    ctx: &mut ReconcileCtx<'_>,
    report: &mut ReconcileReport,
) {
    let name = snap.spec.name.as_str();
    let Some(h) = state.jobs.find(name) else {
        if !snap.state.is_terminal() && state.jobs.find_completed(name).is_none() {
            admit_job(state, snap, now, ctx, report);
        }
        return;
    };

    let Some(job) = state.jobs.get_mut(h) else {
        return;
    };
    job.prolog_pending = snap.prolog_pending;
    job.internally_requeued = snap.internally_requeued;
    job.checkpoint_start_time = snap.checkpoint_start_time;
    job.user_priority = snap.spec.priority;

    let observed = snap.state;
    let expected = job.estate;
    if observed.is_terminal() {
        finish_job(state, h, observed, snap.completion_time, now, ctx, report);
        return;
    }

    let was_started = matches!(expected, JobState::Running | JobState::Starting);
    if was_started && matches!(observed, JobState::Idle | JobState::Hold) {
        let delay = state.policy.max_job_start_delay;
        match classify(&expected, &observed, job.start_time, delay, now) {
            Agreement::Converged => {}
            Agreement::Converging => {
                debug!(job = %name, expected = %expected, observed = %observed, "waiting for job start");
                job.state = JobState::Starting;
            }
            Agreement::Diverged if job.prolog_pending => {
                debug!(job = %name, "prolog pending, start not yet rejected");
            }
            Agreement::Diverged => {
                let requeued = job.internally_requeued
                    || job.checkpoint_start_time.is_some_and(|c| c >= job.start_time);
                if requeued {
                    requeue_job(state, h, observed, now, ctx, report);
                } else {
                    reject_started_job(state, h, observed, now, ctx, report);
                }
            }
        }
        return;
    }

    if observed.is_active() {
        let needs_adoption = !job.has_live_allocation() && !job.suspended_by_scheduler;
        job.state = observed;
        job.expect(observed, now);
        if let Some(start) = snap.start_time {
            if job.start_time == 0 {
                job.start_time = start;
            }
        }
        if needs_adoption {
            adopt_running(state, h, snap, now);
        }
        return;
    }

    job.state = match (observed, job.holds.active(now)) {
        (JobState::Hold, _) => JobState::Hold,
        (_, Some(kind)) if kind != HoldKind::Defer => JobState::Hold,
        _ => JobState::Idle,
    };
    if !job.estate.is_active() {
        job.expect(JobState::Idle, now);
    }
}

fn admit_job(
    state: &mut SchedState,
    snap: &JobSnapshot,
    now: i64,
    ctx: &mut ReconcileCtx<'_>,
    report: &mut ReconcileReport,
) {
    let mut job = build_job(state, &snap.spec);
    if let Some(cp) = ctx.restored.remove(&job.name) {
        cp.apply(&mut job);
        debug!(job = %job.name, "checkpointed attributes restored");
    }
    job.prolog_pending = snap.prolog_pending;
    job.internally_requeued = snap.internally_requeued;
    job.checkpoint_start_time = snap.checkpoint_start_time;
    if snap.state == JobState::Hold || job.holds.active(now).is_some_and(|k| k != HoldKind::Defer) {
        job.state = JobState::Hold;
    }

    let name = job.name.clone();
    let h = match state.submit(job) {
        Ok(h) => h,
        Err(e) => {
            warn!(job = %name, error = %e, "cannot queue reported job");
            return;
        }
    };
    report.jobs_added += 1;
    if snap.state.is_active() {
        if let Some(job) = state.jobs.get_mut(h) {
            job.state = snap.state;
            job.expect(snap.state, now);
            job.start_time = snap.start_time.unwrap_or(now);
        }
        adopt_running(state, h, snap, now);
    }
}

/// Records the allocation of a job the resource manager says is running.
fn adopt_running(state: &mut SchedState, h: JobHandle, snap: &JobSnapshot, now: i64) {
    let nodes: Vec<(NodeHandle, u32)> = snap
        .nodes
        .iter()
        .filter_map(|(name, tc)| state.nodes.find(name).map(|nh| (nh, *tc)))
        .collect();
    let Some(partition) = nodes
        .first()
        .and_then(|(nh, _)| state.nodes.get(*nh))
        .map(|n| n.partition.clone())
    else {
        debug!(job = %snap.spec.name, "running job reports no known nodes");
        return;
    };
    match adopt_allocation(state, h, &partition, &nodes, now) {
        Ok(()) => {
            if let Err(e) = create_active_job_reservation(state, h, now) {
                warn!(job = %snap.spec.name, error = %e, "cannot protect adopted allocation");
            }
        }
        Err(e) => warn!(job = %snap.spec.name, error = %e, "cannot adopt reported allocation"),
    }
}

/// Drops a job's allocation and reservation and returns it to the queue.
fn unwind_start(state: &mut SchedState, h: JobHandle, observed: JobState, now: i64) {
    release_allocation(state, h);
    state.rsvs.release_job(h, &mut state.jobs, &mut state.nodes);
    if let Some(job) = state.jobs.get_mut(h) {
        job.state = observed;
        job.expect(JobState::Idle, now);
        job.start_time = 0;
    }
}

fn requeue_job(
    state: &mut SchedState,
    h: JobHandle,
    observed: JobState,
    now: i64,
    ctx: &mut ReconcileCtx<'_>,
    report: &mut ReconcileReport,
) {
    let iteration = state.iteration;
    unwind_start(state, h, observed, now);
    let Some(job) = state.jobs.get_mut(h) else {
        return;
    };
    job.internally_requeued = false;
    job.messages.push(now, "job requeued by resource manager");
    info!(job = %job.name, "job requeued");
    ctx.sink.record(SchedEvent::simple(
        EventKind::JobRequeued,
        &job.name,
        "requeued by resource manager",
        now,
        iteration,
    ));
    report.jobs_requeued += 1;
}

/// The resource manager dropped a job the scheduler started.
///
/// Single-node jobs exclude the failing node unless their class cancels on
/// failure. Repeated rejections defer with growing backoff; once the start
/// failure budget is spent the job is held.
fn reject_started_job(
    state: &mut SchedState,
    h: JobHandle,
    observed: JobState,
    now: i64,
    ctx: &mut ReconcileCtx<'_>,
    report: &mut ReconcileReport,
) {
    let iteration = state.iteration;
    let backoff = DeferBackoff {
        defer_time: state.policy.defer_time,
        defer_start_count: state.policy.defer_start_count,
    };
    let Some(job) = state.jobs.get(h) else {
        return;
    };
    let name = job.name.clone();
    let hostlist = state.node_names(&job.allocated_nodes());
    let single_node = hostlist.len() == 1;
    let cancel_on_fail = job.creds.class.as_ref().is_some_and(|c| c.cancel_on_fail);
    let start_time = job.start_time;

    unwind_start(state, h, observed, now);
    let exhausted = ctx.retry.record_failure(&name, now);

    let Some(job) = state.jobs.get_mut(h) else {
        return;
    };
    let mut excluded_node = None;
    if cancel_on_fail {
        job.cancel_requested = Some("job rejected by resource manager".to_string());
    } else if single_node {
        if let Some(node) = hostlist.first() {
            job.exclude_hosts.insert(node.clone());
            excluded_node = Some(node.clone());
        }
    }

    let mut defer_secs = None;
    if exhausted {
        job.hold(
            HoldKind::Batch,
            HoldReason::StartFailure,
            None,
            now,
            "job rejected by resource manager too many times",
        );
    } else if backoff.should_hold(job.start_count) {
        let secs = backoff.duration(job.start_count);
        job.hold(
            HoldKind::Defer,
            HoldReason::RmReject,
            Some(now + secs),
            now,
            &format!("job rejected by resource manager - deferred for {secs} seconds"),
        );
        defer_secs = Some(secs);
    } else {
        job.messages.push(now, "job rejected by resource manager");
    }

    warn!(
        job = %name,
        start_count = job.start_count,
        excluded = ?excluded_node,
        defer_secs = ?defer_secs,
        "job rejected by resource manager"
    );
    emit(
        ctx.sink,
        EventKind::JobRejected,
        &name,
        "job rejected by resource manager",
        JobRejectedPayload {
            hostlist,
            start_time,
            start_count: job.start_count,
            defer_secs,
            excluded_node,
        },
        now,
        iteration,
    );
    report.jobs_rejected += 1;
}

/// Moves a job that finished (or vanished) to the completed table.
fn finish_job(
    state: &mut SchedState,
    h: JobHandle,
    observed: JobState,
    completion_time: Option<i64>,
    now: i64,
    ctx: &mut ReconcileCtx<'_>,
    report: &mut ReconcileReport,
) {
    let iteration = state.iteration;
    release_allocation(state, h);
    state.rsvs.release_job(h, &mut state.jobs, &mut state.nodes);
    let Some(job) = state.jobs.get_mut(h) else {
        return;
    };
    job.state = observed;
    job.expect(observed, now);
    job.completion_time = completion_time.or(Some(now));
    let name = job.name.clone();
    let kind = if observed == JobState::Removed {
        EventKind::JobCancelled
    } else {
        EventKind::JobCompleted
    };

    state.jobs.complete(h, now);
    ctx.retry.clear(&name);
    info!(job = %name, state = %observed, "job finished");
    ctx.sink.record(SchedEvent::simple(kind, &name, observed.as_str(), now, iteration));
    report.jobs_completed.push(name);
}

/// Points every synchronized member job at its master.
fn link_sync_members(state: &mut SchedState) {
    let links: Vec<(String, String)> = state
        .jobs
        .iter()
        .flat_map(|(_, j)| j.sync_with.iter().map(|s| (s.clone(), j.name.clone())))
        .collect();
    for (member, master) in links {
        if let Some(job) = state.jobs.find(&member).and_then(|h| state.jobs.get_mut(h)) {
            job.sync_master = Some(master);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedPolicy;
    use crate::model::Resources;
    use batchd_events::MemoryEventSink;

    struct Harness {
        state: SchedState,
        sink: MemoryEventSink,
        restored: HashMap<String, JobCheckpoint>,
        retry: RetryTracker,
    }

    impl Harness {
        fn new(policy: SchedPolicy) -> Self {
            let retry = RetryTracker::new(policy.max_start_failures, policy.start_failure_window);
            Self {
                state: SchedState::new(policy),
                sink: MemoryEventSink::new(),
                restored: HashMap::new(),
                retry,
            }
        }

        fn apply(&mut self, snapshot: &WorkloadSnapshot, now: i64) -> ReconcileReport {
            let mut ctx = ReconcileCtx {
                sink: &self.sink,
                restored: &mut self.restored,
                retry: &mut self.retry,
            };
            apply_workload(&mut self.state, snapshot, now, &mut ctx)
        }
    }

    fn workload(jobs: Vec<JobSnapshot>) -> WorkloadSnapshot {
        WorkloadSnapshot {
            nodes: vec![
                NodeSnapshot::new("n1", "batch", Resources::new(4, 8192)),
                NodeSnapshot::new("n2", "batch", Resources::new(4, 8192)),
            ],
            jobs,
        }
    }

    fn running(spec: JobSpec, node: &str, tasks: u32, start: i64) -> JobSnapshot {
        let mut snap = JobSnapshot::idle(spec);
        snap.state = JobState::Running;
        snap.start_time = Some(start);
        snap.nodes = vec![(node.to_string(), tasks)];
        snap
    }

    #[test]
    fn test_new_nodes_and_jobs_are_admitted() {
        let mut h = Harness::new(SchedPolicy::default());
        let report = h.apply(&workload(vec![JobSnapshot::idle(JobSpec::new("j1", "alice", 2, 1))]), 0);
        assert_eq!(report.nodes_added, 2);
        assert_eq!(report.jobs_added, 1);
        let job = h.state.jobs.by_name("j1").unwrap();
        assert_eq!(job.state, JobState::Idle);
        assert_eq!(job.request_tc(), 2);
        assert_eq!(h.state.partition("batch").unwrap().config_procs, 8);
    }

    #[test]
    fn test_running_job_is_adopted() {
        let mut h = Harness::new(SchedPolicy::default());
        let spec = JobSpec::new("j1", "alice", 4, 1);
        h.apply(&workload(vec![running(spec, "n1", 4, 0)]), 10);

        let node = h.state.nodes.by_name("n1").unwrap();
        assert_eq!(node.dres.procs, 4);
        assert_eq!(node.ares.procs, 0);
        assert_eq!(node.state, NodeState::Busy);
        let job = h.state.jobs.by_name("j1").unwrap();
        assert_eq!(job.estate, JobState::Running);
        assert!(job.rsv.is_some());
    }

    #[test]
    fn test_vanished_job_is_completed_and_released() {
        let mut h = Harness::new(SchedPolicy::default());
        let spec = JobSpec::new("j1", "alice", 4, 1);
        h.apply(&workload(vec![running(spec, "n1", 4, 0)]), 10);
        let report = h.apply(&workload(vec![]), 20);

        assert_eq!(report.jobs_completed, vec!["j1".to_string()]);
        assert!(h.state.jobs.find("j1").is_none());
        assert!(h.state.jobs.find_completed("j1").is_some());
        assert!(h.state.nodes.by_name("n1").unwrap().dres.is_empty());
        assert!(h.state.rsvs.is_empty());
        assert_eq!(h.sink.of_kind(EventKind::JobCompleted).len(), 1);
    }

    #[test]
    fn test_rejected_start_defers_and_excludes_node() {
        let mut h = Harness::new(SchedPolicy::default());
        let spec = JobSpec::new("j5", "alice", 2, 1);
        h.apply(&workload(vec![running(spec.clone(), "n2", 2, 100)]), 100);
        let jh = h.state.jobs.find("j5").unwrap();
        h.state.jobs.get_mut(jh).unwrap().start_count = 1;

        // Still inside the start grace period.
        h.apply(&workload(vec![JobSnapshot::idle(spec.clone())]), 300);
        assert_eq!(h.state.jobs.by_name("j5").unwrap().estate, JobState::Running);

        let report = h.apply(&workload(vec![JobSnapshot::idle(spec)]), 500);
        assert_eq!(report.jobs_rejected, 1);
        let job = h.state.jobs.by_name("j5").unwrap();
        assert!(job.exclude_hosts.contains("n2"));
        assert_eq!(job.holds.defer_until, Some(500 + 3600 * 2));
        assert_eq!(job.alloc_tc, 0);
        assert_eq!(job.estate, JobState::Idle);
        assert!(h.state.nodes.by_name("n2").unwrap().dres.is_empty());

        let events = h.sink.of_kind(EventKind::JobRejected);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["excluded_node"], "n2");
        assert_eq!(events[0].payload["defer_secs"], 7200);
    }

    #[test]
    fn test_checkpoint_start_means_requeue() {
        let mut h = Harness::new(SchedPolicy::default());
        let spec = JobSpec::new("j1", "alice", 1, 1);
        h.apply(&workload(vec![running(spec.clone(), "n1", 1, 100)]), 100);
        let mut snap = JobSnapshot::idle(spec);
        snap.checkpoint_start_time = Some(150);
        let report = h.apply(&workload(vec![snap]), 1_000);

        assert_eq!(report.jobs_requeued, 1);
        assert_eq!(report.jobs_rejected, 0);
        assert!(h.state.jobs.by_name("j1").unwrap().exclude_hosts.is_empty());
    }

    #[test]
    fn test_node_state_changes_are_recorded() {
        let mut h = Harness::new(SchedPolicy::default());
        h.apply(&workload(vec![]), 0);
        let mut down = workload(vec![]);
        down.nodes[1].state = NodeState::Down;
        h.apply(&down, 10);

        let events = h.sink.of_kind(EventKind::NodeStateChanged);
        let last = events.last().unwrap();
        assert_eq!(last.object_id, "n2");
        assert_eq!(last.payload["new_state"], "down");
    }

    #[test]
    fn test_sync_members_are_linked() {
        let mut h = Harness::new(SchedPolicy::default());
        let mut master = JobSpec::new("m", "alice", 1, 1);
        master.sync_with = vec!["s".into()];
        h.apply(
            &workload(vec![
                JobSnapshot::idle(master),
                JobSnapshot::idle(JobSpec::new("s", "alice", 1, 1)),
            ]),
            0,
        );
        assert_eq!(h.state.jobs.by_name("s").unwrap().sync_master.as_deref(), Some("m"));
    }
}
