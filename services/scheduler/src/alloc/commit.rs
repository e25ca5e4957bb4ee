//! Allocation commit and release.
//!
//! # Invariants
//!
//! - After a commit, `dres <= cres` holds on every node of the plan
//! - All checks run before the first write, so a failed commit leaves
//!   jobs and nodes untouched
//! - Release subtracts exactly what commit added

use std::collections::HashMap;

use batchd_id::{JobHandle, NodeHandle};
use tracing::{debug, instrument};

use super::{AllocError, AllocPlan, AllocResult};
use crate::model::{JobError, NodeAlloc, RejectReason, ResourceDim, Resources};
use crate::state::SchedState;

/// First dimension in which `after` exceeds `cap`.
fn overflow(after: &Resources, cap: &Resources) -> Option<RejectReason> {
    ResourceDim::ALL
        .iter()
        .find(|d| after.get(**d) > cap.get(**d))
        .map(|d| d.reject_reason())
        .or_else(|| {
            after
                .gres
                .iter()
                .any(|(name, v)| *v > cap.gres(name))
                .then_some(RejectReason::GenericResource)
        })
}

/// Resources `plan` takes on each node, checked against the job's state.
fn demand(state: &SchedState, plan: &AllocPlan) -> AllocResult<(String, Vec<(NodeHandle, Resources)>)> {
    let job = state
        .jobs
        .get(plan.job)
        .ok_or_else(|| AllocError::JobNotFound(plan.job.to_string()))?;
    if job.has_live_allocation() {
        return Err(AllocError::AlreadyAllocated(job.name.clone()));
    }
    let name = job.name.clone();

    let mut per_node: Vec<(NodeHandle, Resources)> = Vec::new();
    for rp in &plan.reqs {
        let req = job
            .reqs
            .get(rp.req_index)
            .ok_or_else(|| AllocError::EmptyRequest(name.clone()))?;
        for alloc in &rp.allocs {
            let node = state
                .nodes
                .get(alloc.node)
                .ok_or_else(|| AllocError::StaleNode(alloc.node.to_string()))?;
            let res = req.consumption(node, alloc.task_count);
            match per_node.iter_mut().find(|(n, _)| *n == alloc.node) {
                Some((_, total)) => total.add(&res),
                None => per_node.push((alloc.node, res)),
            }
        }
    }
    Ok((name, per_node))
}

/// Fails when adding `per_node` would push a node past its configured
/// resources. `credit` is subtracted from the node's dedicated total first.
fn check_capacity(
    state: &SchedState,
    job: &str,
    per_node: &[(NodeHandle, Resources)],
    credit: &HashMap<NodeHandle, Resources>,
) -> AllocResult<()> {
    for (nh, res) in per_node {
        let Some(node) = state.nodes.get(*nh) else {
            return Err(AllocError::StaleNode(nh.to_string()));
        };
        let mut after = node.dres.clone();
        if let Some(freed) = credit.get(nh) {
            after.saturating_sub(freed);
        }
        after.add(res);
        if let Some(reason) = overflow(&after, &node.cres) {
            return Err(AllocError::Oversubscribed {
                job: job.to_string(),
                node: node.name.clone(),
                reason,
            });
        }
    }
    Ok(())
}

fn task_order(plan: &AllocPlan) -> Vec<NodeHandle> {
    plan.reqs
        .iter()
        .flat_map(|rp| rp.task_order.iter().copied())
        .collect()
}

/// Runs the checks of [`allocate_nodes`] without writing anything. The
/// allocations of the `freed` jobs count as already returned to their
/// nodes, so a plan that preempts them can be validated up front.
pub fn check_allocation(state: &SchedState, plan: &AllocPlan, freed: &[JobHandle]) -> AllocResult<()> {
    let (name, per_node) = demand(state, plan)?;
    let mut credit: HashMap<NodeHandle, Resources> = HashMap::new();
    for h in freed {
        if state.jobs.get(*h).is_some_and(|j| !j.suspended_by_scheduler) {
            for (nh, res) in held(state, *h) {
                credit.entry(nh).or_default().add(&res);
            }
        }
    }
    check_capacity(state, &name, &per_node, &credit)?;

    let tasks = task_order(plan).len();
    let job = state
        .jobs
        .get(plan.job)
        .ok_or_else(|| AllocError::JobNotFound(name.clone()))?;
    let capacity = job.task_map.capacity();
    if tasks >= capacity {
        let requested = job.task_map.grown_size((tasks + 1 - capacity) as i64);
        let max = state.jobs.max_task_count();
        if requested > max {
            return Err(JobError::TaskMapOverflow {
                job: name,
                requested,
                max,
            }
            .into());
        }
    }
    Ok(())
}

/// Writes `plan` into the job and dedicates its resources on the nodes.
#[instrument(skip(state, plan), fields(job = %plan.job))]
pub fn allocate_nodes(state: &mut SchedState, plan: &AllocPlan, now: i64) -> AllocResult<()> {
    let (name, per_node) = demand(state, plan)?;
    check_capacity(state, &name, &per_node, &HashMap::new())?;

    let order = task_order(plan);
    let capacity = state
        .jobs
        .get(plan.job)
        .map(|j| j.task_map.capacity())
        .ok_or_else(|| AllocError::JobNotFound(name.clone()))?;
    if order.len() >= capacity {
        state
            .jobs
            .grow_task_map(plan.job, (order.len() + 1 - capacity) as i64)?;
    }

    let job = state
        .jobs
        .get_mut(plan.job)
        .ok_or_else(|| AllocError::JobNotFound(name.clone()))?;
    job.task_map.assign(&name, &order)?;

    if let Some(shape) = plan.shape.and_then(|i| job.reqs.first().and_then(|r| r.shapes.get(i)).copied()) {
        if let Some(first) = job.reqs.first_mut() {
            first.task_count = shape.task_count;
            first.node_count = shape.node_count;
        }
    }

    let mut merged: Vec<NodeAlloc> = Vec::new();
    for rp in &plan.reqs {
        if let Some(req) = job.reqs.get_mut(rp.req_index) {
            req.node_list = rp.allocs.clone();
        }
        for alloc in &rp.allocs {
            match merged.iter_mut().find(|m| m.node == alloc.node) {
                Some(m) => m.task_count += alloc.task_count,
                None => merged.push(*alloc),
            }
        }
    }
    job.alloc_tc = merged.iter().map(|a| a.task_count).sum();
    job.alloc_nc = merged.len() as u32;
    job.node_list = merged;
    job.walltime = plan.walltime;
    job.partition = Some(plan.partition.clone());

    for (nh, res) in &per_node {
        if let Some(node) = state.nodes.get_mut(*nh) {
            node.dedicate(res);
            node.last_update = node.last_update.max(now);
        }
    }

    debug!(job = %name, nodes = per_node.len(), tasks = order.len(), "allocation committed");
    Ok(())
}

/// Resources a job's recorded allocation holds on each node.
fn held(state: &SchedState, handle: JobHandle) -> HashMap<NodeHandle, Resources> {
    let mut held: HashMap<NodeHandle, Resources> = HashMap::new();
    let Some(job) = state.jobs.get(handle) else {
        return held;
    };
    for req in &job.reqs {
        for alloc in &req.node_list {
            if let Some(node) = state.nodes.get(alloc.node) {
                held.entry(alloc.node)
                    .or_default()
                    .add(&req.consumption(node, alloc.task_count));
            }
        }
    }
    held
}

/// Returns a job's dedicated resources to its nodes and clears its
/// allocation. Returns the nodes released.
pub fn release_allocation(state: &mut SchedState, handle: JobHandle) -> Vec<NodeHandle> {
    let Some(job) = state.jobs.get(handle) else {
        return Vec::new();
    };
    let nodes = job.allocated_nodes();
    let name = job.name.clone();
    let parked = job.suspended_by_scheduler;

    if !parked {
        for (nh, res) in &held(state, handle) {
            if let Some(node) = state.nodes.get_mut(*nh) {
                node.release(res);
            }
        }
    }
    if let Some(job) = state.jobs.get_mut(handle) {
        job.clear_allocation();
        job.suspended_by_scheduler = false;
    }
    debug!(job = %name, nodes = nodes.len(), "allocation released");
    nodes
}

/// Frees a suspended job's dedicated resources while keeping its node
/// lists so it can later resume in place.
pub fn park_allocation(state: &mut SchedState, handle: JobHandle) {
    let Some(job) = state.jobs.get(handle) else {
        return;
    };
    if job.suspended_by_scheduler || !job.has_live_allocation() {
        return;
    }
    for (nh, res) in &held(state, handle) {
        if let Some(node) = state.nodes.get_mut(*nh) {
            node.release(res);
        }
    }
    if let Some(job) = state.jobs.get_mut(handle) {
        job.suspended_by_scheduler = true;
        debug!(job = %job.name, "allocation parked");
    }
}

/// Re-dedicates a parked allocation on the same nodes. Fails without
/// mutation when any node can no longer take it.
pub fn reclaim_allocation(state: &mut SchedState, handle: JobHandle, now: i64) -> AllocResult<()> {
    let job = state
        .jobs
        .get(handle)
        .ok_or_else(|| AllocError::JobNotFound(handle.to_string()))?;
    let name = job.name.clone();
    if !job.suspended_by_scheduler {
        return Ok(());
    }
    let held = held(state, handle);
    for (nh, res) in &held {
        let node = state
            .nodes
            .get(*nh)
            .ok_or_else(|| AllocError::StaleNode(nh.to_string()))?;
        let mut after = node.dres.clone();
        after.add(res);
        if let Some(reason) = overflow(&after, &node.cres) {
            return Err(AllocError::Oversubscribed {
                job: name,
                node: node.name.clone(),
                reason,
            });
        }
    }
    for (nh, res) in &held {
        if let Some(node) = state.nodes.get_mut(*nh) {
            node.dedicate(res);
            node.last_update = node.last_update.max(now);
        }
    }
    if let Some(job) = state.jobs.get_mut(handle) {
        job.suspended_by_scheduler = false;
    }
    debug!(job = %name, "allocation reclaimed");
    Ok(())
}

/// Records an allocation the resource manager reports for a job the
/// scheduler did not place itself. All tasks land on the first request.
pub fn adopt_allocation(
    state: &mut SchedState,
    handle: JobHandle,
    partition: &str,
    nodes: &[(NodeHandle, u32)],
    now: i64,
) -> AllocResult<()> {
    let job = state
        .jobs
        .get(handle)
        .ok_or_else(|| AllocError::JobNotFound(handle.to_string()))?;
    if job.reqs.is_empty() {
        return Err(AllocError::EmptyRequest(job.name.clone()));
    }
    let allocs: Vec<NodeAlloc> = nodes
        .iter()
        .map(|(node, task_count)| NodeAlloc {
            node: *node,
            task_count: *task_count,
        })
        .collect();
    let task_order = allocs
        .iter()
        .flat_map(|a| std::iter::repeat_n(a.node, a.task_count as usize))
        .collect();
    let plan = AllocPlan {
        job: handle,
        partition: partition.to_string(),
        start: job.start_time,
        walltime: job.walltime,
        shape: None,
        reqs: vec![super::ReqPlan {
            req_index: 0,
            task_count: allocs.iter().map(|a| a.task_count).sum(),
            allocs,
            task_order,
        }],
        preempt: Vec::new(),
    };
    allocate_nodes(state, &plan, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{plan_allocation, AllocOptions};
    use crate::config::SchedPolicy;
    use crate::model::{Job, JobCredentials, Node, Req};

    fn cluster(nodes: &[(&str, i64)]) -> SchedState {
        let mut state = SchedState::new(SchedPolicy::default());
        for (name, procs) in nodes {
            state.add_node(Node::new(*name, "batch", Resources::new(*procs, 8192)));
        }
        state
    }

    fn submit(state: &mut SchedState, name: &str, tasks: u32, procs: i64) -> JobHandle {
        let creds = JobCredentials::for_user(&mut state.creds, "alice");
        state
            .submit(
                Job::new(name, creds)
                    .with_req(Req::new(tasks, Resources::new(procs, 0)))
                    .with_walltime(60),
            )
            .unwrap()
    }

    #[test]
    fn test_commit_dedicates_and_release_reverses() {
        let mut state = cluster(&[("n1", 4)]);
        let n1 = state.nodes.find("n1").unwrap();
        let h = submit(&mut state, "j1", 4, 1);
        let plan = plan_allocation(&state, h, "batch", 0, 0, &AllocOptions::default()).unwrap();
        allocate_nodes(&mut state, &plan, 0).unwrap();

        let node = state.nodes.get(n1).unwrap();
        assert_eq!(node.dres.procs, 4);
        assert_eq!(node.ares.procs, 0);
        let job = state.jobs.get(h).unwrap();
        assert_eq!((job.alloc_tc, job.alloc_nc), (4, 1));
        assert_eq!(job.task_map.tasks(), vec![n1; 4]);
        assert_eq!(job.partition.as_deref(), Some("batch"));

        assert_eq!(release_allocation(&mut state, h), vec![n1]);
        let node = state.nodes.get(n1).unwrap();
        assert!(node.dres.is_empty());
        assert_eq!(node.ares.procs, 4);
        let job = state.jobs.get(h).unwrap();
        assert_eq!(job.alloc_tc, 0);
        assert!(job.task_map.tasks().is_empty());
    }

    #[test]
    fn test_check_counts_freed_jobs_as_released() {
        let mut state = cluster(&[("n1", 4)]);
        let victim = submit(&mut state, "victim", 4, 1);
        let plan = plan_allocation(&state, victim, "batch", 0, 0, &AllocOptions::default()).unwrap();
        allocate_nodes(&mut state, &plan, 0).unwrap();

        let h = submit(&mut state, "j1", 4, 1);
        let mut plan = plan.clone();
        plan.job = h;
        assert!(matches!(
            check_allocation(&state, &plan, &[]),
            Err(AllocError::Oversubscribed { .. })
        ));
        assert!(check_allocation(&state, &plan, &[victim]).is_ok());
        // Nothing was written.
        assert!(!state.jobs.get(h).unwrap().has_live_allocation());
        assert!(state.jobs.get(victim).unwrap().has_live_allocation());
    }

    #[test]
    fn test_failed_commit_changes_nothing() {
        let mut state = cluster(&[("n1", 4)]);
        let n1 = state.nodes.find("n1").unwrap();
        let h = submit(&mut state, "j1", 4, 1);
        let plan = plan_allocation(&state, h, "batch", 0, 0, &AllocOptions::default()).unwrap();

        state.nodes.get_mut(n1).unwrap().dedicate(&Resources::new(1, 0));
        let err = allocate_nodes(&mut state, &plan, 0).unwrap_err();
        assert!(matches!(err, AllocError::Oversubscribed { reason: RejectReason::Cpu, .. }));
        assert_eq!(state.nodes.get(n1).unwrap().dres.procs, 1);
        let job = state.jobs.get(h).unwrap();
        assert!(job.node_list.is_empty());
        assert!(job.reqs[0].node_list.is_empty());
    }

    #[test]
    fn test_task_map_overflow_is_rejected_before_commit() {
        let mut state = SchedState::new(SchedPolicy {
            job_max_task_count: 3,
            ..SchedPolicy::default()
        });
        state.add_node(Node::new("n1", "batch", Resources::new(8, 0)));
        let n1 = state.nodes.find("n1").unwrap();
        let h = submit(&mut state, "wide", 4, 1);
        let plan = plan_allocation(&state, h, "batch", 0, 0, &AllocOptions::default()).unwrap();
        let err = allocate_nodes(&mut state, &plan, 0).unwrap_err();
        assert!(matches!(err, AllocError::TaskMap(_)));
        assert!(state.nodes.get(n1).unwrap().dres.is_empty());
        assert_eq!(state.jobs.first_task_map_overflow(), Some("wide"));
    }

    #[test]
    fn test_second_commit_is_refused() {
        let mut state = cluster(&[("n1", 8)]);
        let h = submit(&mut state, "j1", 2, 1);
        let plan = plan_allocation(&state, h, "batch", 0, 0, &AllocOptions::default()).unwrap();
        allocate_nodes(&mut state, &plan, 0).unwrap();
        assert_eq!(
            allocate_nodes(&mut state, &plan, 0).unwrap_err(),
            AllocError::AlreadyAllocated("j1".into())
        );
    }

    #[test]
    fn test_park_and_reclaim() {
        let mut state = cluster(&[("n1", 4)]);
        let n1 = state.nodes.find("n1").unwrap();
        let h = submit(&mut state, "j1", 4, 1);
        let plan = plan_allocation(&state, h, "batch", 0, 0, &AllocOptions::default()).unwrap();
        allocate_nodes(&mut state, &plan, 0).unwrap();

        park_allocation(&mut state, h);
        assert!(state.nodes.get(n1).unwrap().dres.is_empty());
        assert_eq!(state.jobs.get(h).unwrap().alloc_tc, 4);

        state.nodes.get_mut(n1).unwrap().dedicate(&Resources::new(1, 0));
        assert!(reclaim_allocation(&mut state, h, 5).is_err());
        assert!(state.jobs.get(h).unwrap().suspended_by_scheduler);

        state.nodes.get_mut(n1).unwrap().release(&Resources::new(1, 0));
        reclaim_allocation(&mut state, h, 5).unwrap();
        assert_eq!(state.nodes.get(n1).unwrap().dres.procs, 4);

        release_allocation(&mut state, h);
        assert!(state.nodes.get(n1).unwrap().dres.is_empty());
    }

    #[test]
    fn test_release_of_parked_job_frees_nothing_twice() {
        let mut state = cluster(&[("n1", 4)]);
        let n1 = state.nodes.find("n1").unwrap();
        let h = submit(&mut state, "j1", 2, 1);
        let plan = plan_allocation(&state, h, "batch", 0, 0, &AllocOptions::default()).unwrap();
        allocate_nodes(&mut state, &plan, 0).unwrap();
        state.nodes.get_mut(n1).unwrap().dedicate(&Resources::new(2, 0));

        park_allocation(&mut state, h);
        release_allocation(&mut state, h);
        assert_eq!(state.nodes.get(n1).unwrap().dres.procs, 2);
    }

    #[test]
    fn test_adopt_reported_allocation() {
        let mut state = cluster(&[("n1", 4), ("n2", 4)]);
        let n1 = state.nodes.find("n1").unwrap();
        let n2 = state.nodes.find("n2").unwrap();
        let h = submit(&mut state, "j1", 6, 1);
        adopt_allocation(&mut state, h, "batch", &[(n1, 4), (n2, 2)], 0).unwrap();
        assert_eq!(state.nodes.get(n2).unwrap().dres.procs, 2);
        let job = state.jobs.get(h).unwrap();
        assert_eq!((job.alloc_tc, job.alloc_nc), (6, 2));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn dedicated_never_exceeds_configured(
                nodes in prop::collection::vec(1i64..9, 1..5),
                jobs in prop::collection::vec((1u32..7, 1i64..4), 1..10),
            ) {
                let mut state = SchedState::new(SchedPolicy::default());
                for (i, procs) in nodes.iter().enumerate() {
                    state.add_node(Node::new(format!("n{i}"), "batch", Resources::new(*procs, 8192)));
                }
                let mut started = Vec::new();
                for (i, (tasks, procs)) in jobs.iter().enumerate() {
                    let h = submit(&mut state, &format!("j{i}"), *tasks, *procs);
                    if let Ok(plan) = plan_allocation(&state, h, "batch", 0, 0, &AllocOptions::default()) {
                        if allocate_nodes(&mut state, &plan, 0).is_ok() {
                            started.push(h);
                        }
                    }
                    for (_, node) in state.nodes.iter() {
                        prop_assert!(node.dres.fits_within(&node.cres));
                    }
                }
                for h in started {
                    release_allocation(&mut state, h);
                }
                for (_, node) in state.nodes.iter() {
                    prop_assert!(node.dres.is_empty());
                }
            }
        }
    }
}
