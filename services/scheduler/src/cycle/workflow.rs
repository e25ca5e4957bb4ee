//! Co-scheduling of synchronized workflow jobs.
//!
//! A master job lists the jobs it must start with in `sync_with`. The
//! members are planned together as one pseudo job whose requests are the
//! master's followed by each member's, tagged with their origin. A plan
//! for the pseudo job is split back into one plan per member.

use batchd_id::JobHandle;
use thiserror::Error;
use tracing::debug;

use crate::alloc::{plan_allocation, AllocError, AllocOptions, AllocPlan, ReqPlan};
use crate::model::{JobError, JobState, TaskMap};
use crate::state::SchedState;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("sync member {member} of {master} is not queued")]
    MemberMissing { master: String, member: String },

    #[error("sync member {member} of {master} is not idle")]
    MemberNotIdle { master: String, member: String },

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Job(#[from] JobError),
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// One member's share of a combined plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberPlan {
    pub job: JobHandle,
    pub plan: AllocPlan,
}

/// Plans `master` and all its sync members to start together at `now`.
///
/// The master's plan comes first and carries any preemptees.
pub fn plan_combined(
    state: &mut SchedState,
    master: JobHandle,
    partition: &str,
    now: i64,
    opts: &AllocOptions,
) -> WorkflowResult<Vec<MemberPlan>> {
    let lead = state
        .jobs
        .get(master)
        .ok_or_else(|| AllocError::JobNotFound(master.to_string()))?;
    let master_name = lead.name.clone();

    // (handle, name, first pseudo req index, req count)
    let mut members = vec![(master, master_name.clone(), 0usize, lead.reqs.len())];
    let mut pseudo = lead.duplicate(false);
    pseudo.name = format!("{master_name}.sync");
    pseudo.sync_with.clear();
    for req in &mut pseudo.reqs {
        req.origin = Some(master_name.clone());
    }

    for member in &lead.sync_with {
        let missing = || WorkflowError::MemberMissing {
            master: master_name.clone(),
            member: member.clone(),
        };
        let mh = state.jobs.find(member).ok_or_else(missing)?;
        let job = state.jobs.get(mh).ok_or_else(missing)?;
        if job.state != JobState::Idle || job.estate.is_active() || job.has_live_allocation() {
            return Err(WorkflowError::MemberNotIdle {
                master: master_name.clone(),
                member: member.clone(),
            });
        }
        members.push((mh, job.name.clone(), pseudo.reqs.len(), job.reqs.len()));
        pseudo.walltime = pseudo.walltime.max(job.walltime);
        pseudo.spec_walltime = pseudo.spec_walltime.max(job.spec_walltime);
        pseudo.exclude_hosts.extend(job.exclude_hosts.iter().cloned());
        for req in &job.reqs {
            let mut tagged = req.clone();
            tagged.origin = Some(job.name.clone());
            pseudo.create_request(Some(&tagged));
        }
    }

    let needed = pseudo.request_tc() as usize + 1;
    if needed <= state.jobs.max_task_count() {
        pseudo.task_map = TaskMap::with_capacity(needed);
    }
    let ph = state.jobs.insert(pseudo)?;
    let planned = plan_allocation(state, ph, partition, now, now, opts);
    state.jobs.remove(ph);
    let combined = planned?;

    let mut out = Vec::with_capacity(members.len());
    for (i, (handle, name, offset, count)) in members.into_iter().enumerate() {
        let reqs: Vec<ReqPlan> = combined
            .reqs
            .iter()
            .filter(|rp| rp.req_index >= offset && rp.req_index < offset + count)
            .map(|rp| ReqPlan {
                req_index: rp.req_index - offset,
                ..rp.clone()
            })
            .collect();
        let walltime = state.jobs.get(handle).map_or(combined.walltime, |j| j.walltime);
        let lead = i == 0;
        out.push(MemberPlan {
            job: handle,
            plan: AllocPlan {
                job: handle,
                partition: combined.partition.clone(),
                start: combined.start,
                walltime: if lead && combined.shape.is_some() {
                    combined.walltime
                } else {
                    walltime
                },
                shape: if lead { combined.shape } else { None },
                reqs,
                preempt: if lead { combined.preempt.clone() } else { Vec::new() },
            },
        });
        debug!(master = %master_name, member = %name, "sync member planned");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedPolicy;
    use crate::model::{Job, JobCredentials, Node, Req, Resources};

    fn cluster() -> SchedState {
        let mut state = SchedState::new(SchedPolicy::default());
        state.add_node(Node::new("n1", "batch", Resources::new(4, 0)));
        state.add_node(Node::new("n2", "batch", Resources::new(4, 0)));
        state
    }

    fn submit(state: &mut SchedState, name: &str, tasks: u32, sync_with: &[&str]) -> JobHandle {
        let mut job = Job::new(name, JobCredentials::for_user(&mut state.creds, "alice"))
            .with_req(Req::new(tasks, Resources::new(1, 0)))
            .with_walltime(100);
        job.sync_with = sync_with.iter().map(|s| s.to_string()).collect();
        state.submit(job).unwrap()
    }

    #[test]
    fn test_combined_plan_is_split_per_member() {
        let mut state = cluster();
        let m = submit(&mut state, "m", 4, &["s"]);
        let s = submit(&mut state, "s", 3, &[]);

        let plans = plan_combined(&mut state, m, "batch", 0, &AllocOptions::default()).unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].job, m);
        assert_eq!(plans[0].plan.task_count(), 4);
        assert_eq!(plans[1].job, s);
        assert_eq!(plans[1].plan.task_count(), 3);
        assert!(plans[1].plan.reqs.iter().all(|r| r.req_index == 0));
        // The pseudo job is gone.
        assert!(state.jobs.find("m.sync").is_none());
        assert_eq!(state.jobs.len(), 2);
    }

    #[test]
    fn test_combined_plan_needs_room_for_everyone() {
        let mut state = cluster();
        let m = submit(&mut state, "m", 6, &["s"]);
        submit(&mut state, "s", 3, &[]);

        let err = plan_combined(&mut state, m, "batch", 0, &AllocOptions::default()).unwrap_err();
        assert!(matches!(err, WorkflowError::Alloc(_)));
        assert!(state.jobs.find("m.sync").is_none());
    }

    #[test]
    fn test_busy_member_blocks_combination() {
        let mut state = cluster();
        let m = submit(&mut state, "m", 1, &["s", "gone"]);
        let s = submit(&mut state, "s", 1, &[]);
        state.jobs.get_mut(s).unwrap().state = JobState::Running;

        let err = plan_combined(&mut state, m, "batch", 0, &AllocOptions::default()).unwrap_err();
        assert!(matches!(err, WorkflowError::MemberNotIdle { .. }));
    }
}
