//! Job starts and the actions around them.

use std::collections::BTreeSet;

use batchd_events::{EventKind, JobHeldPayload, JobStartedPayload, SchedEvent};
use batchd_id::{JobHandle, NodeHandle};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::workflow::{plan_combined, MemberPlan, WorkflowError};
use super::SchedulingCycle;
use crate::alloc::{
    allocate_nodes, check_allocation, park_allocation, plan_allocation, reclaim_allocation,
    release_allocation, AllocError, AllocOptions,
};
use crate::config::{DeadlinePolicy, JobRejectPolicy, PreemptPolicy};
use crate::model::{evaluate_for_partition, HoldKind, HoldReason, JobState, Partition};
use crate::policy::{PolicyContext, PolicyLevel, UsageSnapshot};
use crate::rm::{RmError, StartRequest};
use crate::rsv::{create_active_job_reservation, RsvError};
use crate::sink::emit;

/// Why a planned start did not happen.
#[derive(Debug, Error)]
pub(super) enum LaunchError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Rm(#[from] RmError),
}

impl SchedulingCycle {
    /// Plans and starts `h` now in `part`. Returns true when the resource
    /// manager accepted the start.
    ///
    /// Backfill starts never preempt.
    pub(super) async fn try_start(
        &mut self,
        h: JobHandle,
        part: &Partition,
        now: i64,
        backfill: bool,
    ) -> bool {
        let opts = AllocOptions {
            allow_preemption: !backfill && self.state.policy.allow_preemption,
            restrict_to: None,
        };
        let sync_master = self
            .state
            .jobs
            .get(h)
            .is_some_and(|j| !j.sync_with.is_empty());
        let planned = if sync_master {
            plan_combined(&mut self.state, h, &part.name, now, &opts)
        } else {
            plan_allocation(&self.state, h, &part.name, now, now, &opts)
                .map(|plan| vec![MemberPlan { job: h, plan }])
                .map_err(WorkflowError::from)
        };

        let plans = match planned {
            Ok(plans) => plans,
            Err(WorkflowError::Alloc(e)) if e.is_invariant_violation() => {
                self.reject_job(h, &e.to_string(), now);
                return false;
            }
            Err(e) => {
                debug!(job = %h, partition = %part.name, error = %e, "job cannot start now");
                return false;
            }
        };
        if !self.start_budget_allows(plans.len()) {
            debug!(
                job = %h,
                members = plans.len(),
                starts = self.starts,
                "sync group exceeds the remaining start budget"
            );
            return false;
        }
        match self.launch(plans, backfill, now).await {
            Ok(()) => true,
            Err(e) => {
                debug!(job = %h, error = %e, "job start abandoned");
                false
            }
        }
    }

    /// Starts `h` on its matured reservation, falling back to any nodes
    /// of the partition when the reserved ones no longer fit.
    #[instrument(skip(self, nodes))]
    pub(super) async fn start_reserved(
        &mut self,
        h: JobHandle,
        partition: &str,
        nodes: BTreeSet<NodeHandle>,
        rsv_start: i64,
        now: i64,
    ) {
        let Some(part) = self.state.partition(partition).cloned() else {
            return;
        };
        if !part.rm_enabled {
            self.reserved_start_failed(h, "partition resource manager is disabled", now);
            return;
        }
        let Some(job) = self.state.jobs.get(h) else {
            return;
        };
        let walltime = job.walltime;

        let usage = UsageSnapshot::build(&self.state.jobs);
        let view = evaluate_for_partition(&job.creds, &part, &self.state.creds);
        let verdict = self.engine.limit_violation(
            &PolicyContext {
                job,
                view: &view,
                partition: &part,
                usage: &usage,
                now,
            },
            PolicyLevel::Soft,
        );
        if verdict.violated {
            let until = now + self.state.policy.defer_time;
            if let Some(job) = self.state.jobs.get_mut(h) {
                job.hold(
                    HoldKind::Defer,
                    HoldReason::PolicyViolation,
                    Some(until),
                    now,
                    "reserved job violates active policy",
                );
                info!(job = %job.name, reason = ?verdict.reason, until, "reserved job deferred");
            }
            return;
        }

        // Late starts lose the delay from their walltime.
        let delay = now - rsv_start;
        if delay > 0 && delay < self.state.policy.poll_interval && delay < walltime {
            if let Some(job) = self.state.jobs.get_mut(h) {
                job.walltime = walltime - delay;
            }
        }

        let sync_master = self
            .state
            .jobs
            .get(h)
            .is_some_and(|j| !j.sync_with.is_empty());
        let planned = if sync_master {
            plan_combined(&mut self.state, h, partition, now, &AllocOptions::default())
        } else {
            let restricted = AllocOptions {
                allow_preemption: false,
                restrict_to: Some(nodes),
            };
            plan_allocation(&self.state, h, partition, now, now, &restricted)
                .or_else(|_| plan_allocation(&self.state, h, partition, now, now, &AllocOptions::default()))
                .map(|plan| vec![MemberPlan { job: h, plan }])
                .map_err(WorkflowError::from)
        };
        let result = match planned {
            Ok(plans) if !self.start_budget_allows(plans.len()) => {
                debug!(job = %h, members = plans.len(), "reserved sync group waits for start budget");
                self.restore_walltime(h, walltime);
                return;
            }
            Ok(plans) => self.launch(plans, false, now).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            self.restore_walltime(h, walltime);
            self.reserved_start_failed(h, &e.to_string(), now);
        }
    }

    fn restore_walltime(&mut self, h: JobHandle, walltime: i64) {
        if let Some(job) = self.state.jobs.get_mut(h) {
            if !job.has_live_allocation() {
                job.walltime = walltime;
            }
        }
    }

    fn reserved_start_failed(&mut self, h: JobHandle, reason: &str, now: i64) {
        let Some(job) = self.state.jobs.get_mut(h) else {
            return;
        };
        job.messages
            .push(now, format!("cannot start job on reserved resources - {reason}"));
        warn!(job = %job.name, reason, "reserved start failed");
        self.state
            .rsvs
            .release_job(h, &mut self.state.jobs, &mut self.state.nodes);
    }

    /// Commits and submits every member plan. Victims of the lead plan are
    /// preempted first. A failed commit rolls back the members committed
    /// before it.
    pub(super) async fn launch(
        &mut self,
        plans: Vec<MemberPlan>,
        backfill: bool,
        now: i64,
    ) -> Result<(), LaunchError> {
        let Some(lead) = plans.first() else {
            return Ok(());
        };
        let lead_job = lead.job;
        // Nothing is preempted for a start that could not be committed.
        for member in &plans {
            if let Err(e) = check_allocation(&self.state, &member.plan, &lead.plan.preempt) {
                if e.is_invariant_violation() {
                    self.reject_job(member.job, &e.to_string(), now);
                }
                return Err(e.into());
            }
        }
        for victim in lead.plan.preempt.clone() {
            self.preempt(victim, lead_job, now).await;
        }

        let mut committed = Vec::with_capacity(plans.len());
        for member in &plans {
            if let Err(e) = allocate_nodes(&mut self.state, &member.plan, now) {
                for h in committed {
                    release_allocation(&mut self.state, h);
                }
                if e.is_invariant_violation() {
                    self.reject_job(member.job, &e.to_string(), now);
                }
                return Err(e.into());
            }
            committed.push(member.job);
        }

        let mut first_error = None;
        for member in &plans {
            let Some(request) = self.start_request(member.job, &member.plan.partition, now) else {
                continue;
            };
            match self.rm.start_job(&request).await {
                Ok(()) => self.mark_started(member.job, backfill, now),
                Err(e) => {
                    self.start_failed(member.job, &e, now);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => {
                if plans.len() > 1 {
                    warn!(job = %lead_job, error = %e, "sync group only partially started");
                }
                Err(e.into())
            }
        }
    }

    fn start_request(&self, h: JobHandle, partition: &str, now: i64) -> Option<StartRequest> {
        let job = self.state.jobs.get(h)?;
        let nodes = job
            .node_list
            .iter()
            .filter_map(|a| self.state.nodes.get(a.node).map(|n| (n.name.clone(), a.task_count)))
            .collect();
        Some(StartRequest {
            job: job.name.clone(),
            partition: partition.to_string(),
            nodes,
            start_time: now,
            walltime: job.walltime,
        })
    }

    fn mark_started(&mut self, h: JobHandle, backfill: bool, now: i64) {
        let iteration = self.state.iteration;
        let prior_rsv = self
            .state
            .jobs
            .get(h)
            .and_then(|j| j.rsv)
            .map(|rh| self.state.rsvs.name_of(rh));
        let Some(job) = self.state.jobs.get_mut(h) else {
            return;
        };
        job.start_time = now;
        job.state = JobState::Starting;
        job.expect(JobState::Running, now);
        job.start_count += 1;
        job.block = None;
        let name = job.name.clone();
        self.retry.clear(&name);

        if let Err(e) = create_active_job_reservation(&mut self.state, h, now) {
            warn!(job = %name, error = %e, "cannot protect started job");
        }

        let Some(job) = self.state.jobs.get(h) else {
            return;
        };
        let payload = JobStartedPayload {
            partition: job.partition.clone().unwrap_or_default(),
            nodes: self.state.node_names(&job.allocated_nodes()),
            task_count: job.alloc_tc,
            walltime_secs: job.walltime,
            reservation: prior_rsv,
        };
        let (kind, detail) = if backfill {
            self.stats.jobs_backfilled += 1;
            (EventKind::JobBackfilled, "job backfilled")
        } else {
            self.stats.jobs_started += 1;
            (EventKind::JobStarted, "job started")
        };
        info!(
            job = %name,
            partition = %payload.partition,
            nodes = ?payload.nodes,
            tasks = payload.task_count,
            backfill,
            "{detail}"
        );
        emit(self.sink.as_ref(), kind, &name, detail, payload, now, iteration);
        self.starts += 1;
    }

    fn start_failed(&mut self, h: JobHandle, err: &RmError, now: i64) {
        let iteration = self.state.iteration;
        release_allocation(&mut self.state, h);
        self.stats.start_failures += 1;
        let Some(job) = self.state.jobs.get_mut(h) else {
            return;
        };
        let name = job.name.clone();
        job.messages.push(now, format!("cannot start job - {err}"));
        warn!(job = %name, error = %err, "job start failed");

        if !self.retry.record_failure(&name, now) {
            return;
        }
        job.hold(
            HoldKind::Batch,
            HoldReason::StartFailure,
            None,
            now,
            "job failed to start too many times",
        );
        emit(
            self.sink.as_ref(),
            EventKind::JobHeld,
            &name,
            "start failures exhausted",
            JobHeldPayload {
                hold: HoldKind::Batch.to_string(),
                reason: HoldReason::StartFailure.as_str().to_string(),
                release_at: None,
            },
            now,
            iteration,
        );
    }

    /// Resumes a job the scheduler suspended. Leaves it parked when its
    /// nodes cannot take it back yet.
    pub(super) async fn resume(&mut self, h: JobHandle, now: i64) {
        if let Err(e) = reclaim_allocation(&mut self.state, h, now) {
            debug!(job = %h, error = %e, "suspended job cannot resume yet");
            return;
        }
        let Some(name) = self.state.jobs.get(h).map(|j| j.name.clone()) else {
            return;
        };
        if let Err(e) = self.rm.resume_job(&name).await {
            warn!(job = %name, error = %e, "resume failed");
            park_allocation(&mut self.state, h);
            return;
        }
        if let Some(job) = self.state.jobs.get_mut(h) {
            job.state = JobState::Running;
            job.expect(JobState::Running, now);
        }
        if let Err(e) = create_active_job_reservation(&mut self.state, h, now) {
            warn!(job = %name, error = %e, "cannot protect resumed job");
        }
        info!(job = %name, "job resumed");
        self.sink.record(SchedEvent::simple(
            EventKind::JobResumed,
            &name,
            "job resumed",
            now,
            self.state.iteration,
        ));
        self.stats.jobs_resumed += 1;
        self.starts += 1;
    }

    /// Makes room for `by` by requeueing or suspending `victim`.
    async fn preempt(&mut self, victim: JobHandle, by: JobHandle, now: i64) {
        let policy = self.state.policy.preempt_policy;
        let Some(name) = self.state.jobs.get(victim).map(|j| j.name.clone()) else {
            return;
        };
        let by_name = self
            .state
            .jobs
            .get(by)
            .map(|j| j.name.clone())
            .unwrap_or_default();

        let requested = match policy {
            PreemptPolicy::Requeue => self.rm.requeue_job(&name).await,
            PreemptPolicy::Suspend => self.rm.suspend_job(&name).await,
        };
        if let Err(e) = requested {
            warn!(job = %name, preemptor = %by_name, error = %e, "preemption refused");
            return;
        }

        self.state
            .rsvs
            .release_job(victim, &mut self.state.jobs, &mut self.state.nodes);
        match policy {
            PreemptPolicy::Requeue => {
                release_allocation(&mut self.state, victim);
                if let Some(job) = self.state.jobs.get_mut(victim) {
                    job.state = JobState::Idle;
                    job.expect(JobState::Idle, now);
                    job.start_time = 0;
                }
            }
            PreemptPolicy::Suspend => {
                park_allocation(&mut self.state, victim);
                if let Some(job) = self.state.jobs.get_mut(victim) {
                    job.state = JobState::Suspended;
                    job.expect(JobState::Suspended, now);
                }
            }
        }
        if let Some(job) = self.state.jobs.get_mut(victim) {
            job.messages.push(now, format!("job preempted by {by_name}"));
        }

        info!(job = %name, preemptor = %by_name, policy = ?policy, "job preempted");
        self.sink.record(SchedEvent::simple(
            EventKind::JobPreempted,
            &name,
            format!("preempted by {by_name}"),
            now,
            self.state.iteration,
        ));
        self.stats.jobs_preempted += 1;
    }

    /// Applies the configured reject actions to a job that can never start
    /// as submitted.
    pub(super) fn reject_job(&mut self, h: JobHandle, reason: &str, now: i64) {
        let iteration = self.state.iteration;
        let actions = self.state.policy.job_reject_policy.clone();
        let Some(job) = self.state.jobs.get_mut(h) else {
            return;
        };
        if job.state.is_active() || job.estate.is_active() {
            return;
        }
        let name = job.name.clone();
        let message = format!("job was rejected - {reason}");
        warn!(job = %name, reason, actions = ?actions, "job rejected");
        self.stats.jobs_rejected += 1;

        let mut held = false;
        for action in &actions {
            match action {
                JobRejectPolicy::Hold => {
                    job.hold(HoldKind::Batch, HoldReason::PolicyViolation, None, now, &message);
                    held = true;
                }
                JobRejectPolicy::Cancel => job.cancel_requested = Some(message.clone()),
                JobRejectPolicy::Retry => job.messages.push(now, format!("{message}, will retry")),
                JobRejectPolicy::Notify => self.sink.record(SchedEvent::simple(
                    EventKind::JobRejected,
                    &name,
                    message.clone(),
                    now,
                    iteration,
                )),
                JobRejectPolicy::Ignore => {}
            }
        }

        if actions.contains(&JobRejectPolicy::Retry) {
            self.state
                .rsvs
                .release_job(h, &mut self.state.jobs, &mut self.state.nodes);
        }
        if held {
            emit(
                self.sink.as_ref(),
                EventKind::JobHeld,
                &name,
                message,
                JobHeldPayload {
                    hold: HoldKind::Batch.to_string(),
                    reason: HoldReason::PolicyViolation.as_str().to_string(),
                    release_at: None,
                },
                now,
                iteration,
            );
        }
    }

    /// Applies the deadline policy to a job whose deadline cannot be
    /// reserved.
    pub(super) fn deadline_failed(&mut self, h: JobHandle, err: &RsvError, now: i64) {
        let iteration = self.state.iteration;
        let policy = self.state.policy.deadline_policy;
        let Some(job) = self.state.jobs.get_mut(h) else {
            return;
        };
        let name = job.name.clone();
        match policy {
            DeadlinePolicy::Escalate => {
                warn!(job = %name, error = %err, "deadline cannot be satisfied");
            }
            DeadlinePolicy::Retry => {
                debug!(job = %name, error = %err, "deadline reservation retried next iteration");
            }
            DeadlinePolicy::Ignore => {
                info!(job = %name, "deadline dropped");
                job.deadline = None;
                job.messages.push(now, "deadline cannot be satisfied - ignored");
            }
            DeadlinePolicy::Cancel => {
                info!(job = %name, "cancelling job with unreachable deadline");
                job.cancel_requested = Some("deadline cannot be satisfied".to_string());
            }
            DeadlinePolicy::Hold => {
                let message = format!("cannot enable deadline - {err}");
                job.hold(HoldKind::Batch, HoldReason::Deadline, None, now, &message);
                info!(job = %name, "job held for unreachable deadline");
                emit(
                    self.sink.as_ref(),
                    EventKind::JobHeld,
                    &name,
                    message,
                    JobHeldPayload {
                        hold: HoldKind::Batch.to_string(),
                        reason: HoldReason::Deadline.as_str().to_string(),
                        release_at: None,
                    },
                    now,
                    iteration,
                );
            }
        }
    }
}
