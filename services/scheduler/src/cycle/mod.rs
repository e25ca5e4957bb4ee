//! Scheduling cycle orchestrator.
//!
//! One call to [`SchedulingCycle::run_iteration`] runs a full,
//! non-interleaved pass:
//!
//! 1. Reconcile against the resource manager
//! 2. Refresh reservations (expire, extend, purge transient, standing)
//! 3. Select and prioritize
//! 4. Resume suspended jobs
//! 5. Start jobs on mature reservations
//! 6. Priority starts and reservations, per partition
//! 7. Backfill per partition, hard then soft
//! 8. Finalize (cancels, checkpoint, queue snapshot, events)
//!
//! Later phases see earlier phases' commitments because every phase
//! writes the same [`SchedState`] in sequence. When the resource manager
//! cannot be queried the cycle still refreshes priorities and publishes
//! the queue, but starts nothing.

mod queue;
mod reconcile;
mod start;
mod workflow;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use batchd_events::{
    CycleCompletedPayload, EventKind, EventSink, RsvPayload, SchedEvent,
};
use batchd_id::{CycleId, JobHandle, NodeHandle, RsvHandle};
use batchd_reconcile::RetryTracker;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::checkpoint::{self, CheckpointStore, ObjectType, Restored, SqliteCheckpointStore};
use crate::config::{BackfillPolicy, Config, ReservationPolicy};
use crate::model::JobState;
use crate::policy::{
    accrue_queue_time, record_blocks, refresh_priorities, release_expired_holds, select_jobs,
    sort_queue, AvailabilitySnapshot, PolicyEngine, PolicyLevel, SelectLimits, SelectRequest,
    UsageSnapshot, WeightedPolicyEngine,
};
use crate::rm::{ResourceManager, RmError};
use crate::rsv::{
    backfill_windows, create_deadline_reservation, create_priority_reservation,
    expire_reservations, extend_active_reservations, materialize_standing,
    order_backfill_candidates, purge_transient, Reservation, RsvError, RsvKind, RsvSlots,
};
use crate::sink::emit;
use crate::state::SchedState;
use crate::SchedulerResult;

pub use queue::{queue_snapshot, QueueEntry, QueueWatch};
pub use reconcile::{apply_workload, build_job, ReconcileCtx, ReconcileReport};
pub use workflow::{plan_combined, MemberPlan, WorkflowError, WorkflowResult};

/// What one iteration did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub iteration: u64,
    pub rm_degraded: bool,
    pub jobs_started: u32,
    pub jobs_backfilled: u32,
    pub jobs_resumed: u32,
    pub jobs_preempted: u32,
    pub jobs_rejected: u32,
    pub jobs_completed: u32,
    pub start_failures: u32,
    pub rsvs_created: u32,
    pub rsvs_destroyed: u32,
    pub start_limit_hit: bool,
    /// Idle jobs left in the published queue.
    pub idle_jobs: u32,
}

/// The scheduling engine and its collaborators.
pub struct SchedulingCycle {
    state: SchedState,
    rm: Arc<dyn ResourceManager>,
    sink: Arc<dyn EventSink>,
    engine: Box<dyn PolicyEngine>,
    checkpoint: Option<Box<dyn CheckpointStore>>,
    retry: RetryTracker,
    queue_tx: watch::Sender<Vec<QueueEntry>>,
    rm_timeout: Duration,
    /// Checkpointed state not yet matched to live objects.
    restored: Restored,
    /// Jobs whose cancel request already went out.
    cancels_sent: HashSet<String>,
    /// Checkpoint records to drop at the end of the iteration.
    forgotten: Vec<(ObjectType, String)>,
    starts: u32,
    stats: CycleStats,
}

impl SchedulingCycle {
    pub fn new(
        state: SchedState,
        rm: Arc<dyn ResourceManager>,
        sink: Arc<dyn EventSink>,
        engine: Box<dyn PolicyEngine>,
    ) -> Self {
        let retry = RetryTracker::new(
            state.policy.max_start_failures,
            state.policy.start_failure_window,
        );
        let rm_timeout = Duration::from_secs(state.policy.poll_interval.max(1) as u64);
        let (queue_tx, _) = watch::channel(Vec::new());
        Self {
            state,
            rm,
            sink,
            engine,
            checkpoint: None,
            retry,
            queue_tx,
            rm_timeout,
            restored: Restored::default(),
            cancels_sent: HashSet::new(),
            forgotten: Vec::new(),
            starts: 0,
            stats: CycleStats::default(),
        }
    }

    /// Builds the engine the daemon runs: default policy engine, SQLite
    /// checkpoint when a path is configured.
    pub fn from_config(
        config: &Config,
        rm: Arc<dyn ResourceManager>,
        sink: Arc<dyn EventSink>,
    ) -> SchedulerResult<Self> {
        let policy = config.policy.clone();
        let engine = WeightedPolicyEngine::new(policy.weights.clone(), policy.user_limits.clone());
        let mut cycle = Self::new(SchedState::new(policy), rm, sink, Box::new(engine))
            .with_rm_timeout(config.rm_query_timeout);
        if let Some(path) = &config.checkpoint_path {
            let store = SqliteCheckpointStore::open(path)?;
            info!(path = %path.display(), "checkpoint store opened");
            cycle = cycle.with_checkpoint(Box::new(store));
        }
        Ok(cycle)
    }

    /// Attaches a checkpoint store and loads what it holds. Job attributes
    /// are applied as the jobs reappear; reservations are rebuilt after the
    /// first successful poll.
    pub fn with_checkpoint(mut self, store: Box<dyn CheckpointStore>) -> Self {
        self.restored = checkpoint::load(store.as_ref());
        self.checkpoint = Some(store);
        self
    }

    pub fn with_rm_timeout(mut self, timeout: Duration) -> Self {
        self.rm_timeout = timeout;
        self
    }

    /// Receiver for the queue published at the end of every iteration.
    pub fn subscribe(&self) -> QueueWatch {
        self.queue_tx.subscribe()
    }

    pub fn state(&self) -> &SchedState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut SchedState {
        &mut self.state
    }

    /// Runs one complete scheduling pass as of `now` (unix seconds).
    #[instrument(skip(self), fields(cycle_id = %CycleId::new()))]
    pub async fn run_iteration(&mut self, now: i64) -> CycleStats {
        self.state.iteration = self.state.iteration.next();
        self.stats = CycleStats {
            iteration: self.state.iteration.value(),
            ..CycleStats::default()
        };
        self.starts = 0;

        let healthy = self.reconcile(now).await;
        self.stats.rm_degraded = !healthy;
        self.refresh_reservations(now);
        let queue = self.select_and_prioritize(now);

        if healthy {
            self.schedule_suspended(now).await;
            self.schedule_reserved(&queue, now).await;
            let partitions: Vec<String> =
                self.state.partitions.iter().map(|p| p.name.clone()).collect();
            for part in &partitions {
                self.schedule_priority(part, now).await;
            }
            for level in [PolicyLevel::Hard, PolicyLevel::Soft] {
                for part in &partitions {
                    self.backfill(part, level, now).await;
                }
            }
        } else {
            info!("resource manager degraded, no starts this iteration");
        }

        self.finalize(&queue, now).await;
        self.stats.clone()
    }

    /// True once this iteration's start budget is spent.
    fn start_limit_hit(&mut self) -> bool {
        let hit = self.state.policy.start_limit_reached(self.starts);
        if hit && !self.stats.start_limit_hit {
            self.stats.start_limit_hit = true;
            info!(starts = self.starts, "job start limit reached");
        }
        hit
    }

    /// True when `count` more starts fit in this iteration's budget.
    fn start_budget_allows(&mut self, count: usize) -> bool {
        let extra = u32::try_from(count.saturating_sub(1)).unwrap_or(u32::MAX);
        if self.state.policy.start_limit_reached(self.starts.saturating_add(extra)) {
            self.stats.start_limit_hit = true;
            return false;
        }
        true
    }

    fn forget(&mut self, object_type: ObjectType, id: &str) {
        if self.checkpoint.is_some() {
            self.forgotten.push((object_type, id.to_string()));
        }
    }

    fn record_rsv(&mut self, kind: EventKind, rsv: &Reservation, now: i64) {
        emit(
            self.sink.as_ref(),
            kind,
            &rsv.name,
            rsv.kind.as_str(),
            RsvPayload {
                rsv_type: rsv.kind.as_str().to_string(),
                start: rsv.start,
                end: rsv.end,
                task_count: rsv.task_count(),
                job: rsv.job_name.clone(),
            },
            now,
            self.state.iteration,
        );
    }

    fn rsv_created(&mut self, rh: RsvHandle, now: i64) {
        if let Some(rsv) = self.state.rsvs.get(rh).cloned() {
            self.record_rsv(EventKind::RsvCreated, &rsv, now);
            self.stats.rsvs_created += 1;
        }
    }

    // =========================================================================
    // Reconcile
    // =========================================================================

    /// Returns false when the resource manager could not be queried.
    async fn reconcile(&mut self, now: i64) -> bool {
        let queried = tokio::time::timeout(self.rm_timeout, self.rm.query_workload(now)).await;
        let snapshot = match queried.unwrap_or(Err(RmError::Timeout(self.rm_timeout))) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(rm = %self.rm.name(), error = %e, "workload query failed");
                self.sink.record(SchedEvent::simple(
                    EventKind::RmDegraded,
                    self.rm.name(),
                    e.to_string(),
                    now,
                    self.state.iteration,
                ));
                return false;
            }
        };

        let mut ctx = ReconcileCtx {
            sink: self.sink.as_ref(),
            restored: &mut self.restored.jobs,
            retry: &mut self.retry,
        };
        let report = apply_workload(&mut self.state, &snapshot, now, &mut ctx);
        self.stats.jobs_completed += report.jobs_completed.len() as u32;
        self.stats.jobs_rejected += report.jobs_rejected;
        for name in &report.jobs_completed {
            self.cancels_sent.remove(name);
            self.forget(ObjectType::Job, name);
        }
        self.restore_reservations(now);
        true
    }

    fn restore_reservations(&mut self, now: i64) {
        for cp in std::mem::take(&mut self.restored.rsvs) {
            if self.state.rsvs.find(&cp.name).is_some() {
                continue;
            }
            let rsv = cp.to_reservation(&self.state, now);
            match self.state.rsvs.create(rsv, &mut self.state.jobs, &mut self.state.nodes) {
                Ok(_) => info!(rsv = %cp.name, "reservation restored"),
                Err(e) => warn!(rsv = %cp.name, error = %e, "cannot restore reservation"),
            }
        }
    }

    // =========================================================================
    // Reservations
    // =========================================================================

    fn refresh_reservations(&mut self, now: i64) {
        for rsv in expire_reservations(&mut self.state, now) {
            info!(rsv = %rsv.name, kind = %rsv.kind, "reservation expired");
            self.record_rsv(EventKind::RsvDestroyed, &rsv, now);
            self.stats.rsvs_destroyed += 1;
            if matches!(rsv.kind, RsvKind::Standing | RsvKind::User) {
                self.forget(ObjectType::Rsv, &rsv.name);
            }
        }

        let extended = extend_active_reservations(&mut self.state, now);
        if extended > 0 {
            debug!(count = extended, "active reservations extended");
        }

        if self.state.policy.reservation_policy != ReservationPolicy::HighestPriority {
            let purged = purge_transient(&mut self.state, now);
            self.stats.rsvs_destroyed += purged.len() as u32;
        }

        for name in materialize_standing(&mut self.state, now) {
            if let Some(rh) = self.state.rsvs.find(&name) {
                self.rsv_created(rh, now);
            }
        }
    }

    // =========================================================================
    // Selection
    // =========================================================================

    /// Accrues queue time, refreshes priorities and returns every job in
    /// global priority order.
    fn select_and_prioritize(&mut self, now: i64) -> Vec<JobHandle> {
        let iteration = self.state.iteration;
        for name in release_expired_holds(&mut self.state.jobs, now) {
            debug!(job = %name, "defer hold expired");
            self.sink.record(SchedEvent::simple(
                EventKind::JobReleased,
                &name,
                "defer hold expired",
                now,
                iteration,
            ));
        }

        let usage = UsageSnapshot::build(&self.state.jobs);
        let candidates = self.state.jobs.handles();
        let mut eligible = HashSet::new();
        for part in self.state.partitions.iter() {
            let selection = select_jobs(
                &self.state.jobs,
                &candidates,
                &SelectRequest {
                    level: PolicyLevel::Soft,
                    limits: SelectLimits::default(),
                    partition: part,
                    snapshot: None,
                    now,
                },
                self.engine.as_ref(),
                &self.state.creds,
                &usage,
            );
            eligible.extend(selection.selected);
        }

        accrue_queue_time(
            &mut self.state.jobs,
            &eligible,
            now,
            self.state.policy.priority_accrual,
        );
        refresh_priorities(
            &mut self.state.jobs,
            &self.state.partitions,
            &self.state.creds,
            self.engine.as_ref(),
            &usage,
            now,
        );

        let mut queue = candidates;
        sort_queue(&self.state.jobs, &mut queue, None);
        debug!(jobs = queue.len(), eligible = eligible.len(), "queue prioritized");
        queue
    }

    // =========================================================================
    // Scheduling phases
    // =========================================================================

    /// Resumes jobs the scheduler suspended for a preemptor, highest
    /// priority first, once their nodes can take them back.
    #[instrument(skip(self))]
    async fn schedule_suspended(&mut self, now: i64) {
        let mut parked: Vec<JobHandle> = self
            .state
            .jobs
            .iter()
            .filter(|(_, j)| j.suspended_by_scheduler)
            .map(|(h, _)| h)
            .collect();
        sort_queue(&self.state.jobs, &mut parked, None);
        for h in parked {
            if self.start_limit_hit() {
                break;
            }
            self.resume(h, now).await;
        }
    }

    /// Starts idle jobs whose priority or deadline reservation has matured.
    #[instrument(skip(self, queue))]
    async fn schedule_reserved(&mut self, queue: &[JobHandle], now: i64) {
        for &h in queue {
            let Some(job) = self.state.jobs.get(h) else {
                continue;
            };
            if job.state != JobState::Idle || job.estate.is_active() || job.pending_data_stage {
                continue;
            }
            let Some(rsv) = job.rsv.and_then(|rh| self.state.rsvs.get(rh)) else {
                continue;
            };
            if !matches!(rsv.kind, RsvKind::PriorityJob | RsvKind::DeadlineJob) || !rsv.is_mature(now) {
                continue;
            }
            let Some(partition) = rsv.partition.clone() else {
                continue;
            };
            let nodes: BTreeSet<NodeHandle> = rsv.claims_by_node().into_keys().collect();
            let rsv_start = rsv.start;
            if self.start_limit_hit() {
                break;
            }
            self.start_reserved(h, &partition, nodes, rsv_start, now).await;
        }
    }

    /// Priority-ordered immediate starts for one partition, reserving ahead
    /// for jobs that cannot start.
    ///
    /// Once a job misses both a start and a reservation because slots ran
    /// out (or a next-to-run job is blocked), lower jobs may still reserve
    /// but no longer start this iteration.
    #[instrument(skip(self))]
    async fn schedule_priority(&mut self, partition: &str, now: i64) {
        let Some(part) = self.state.partition(partition).cloned() else {
            return;
        };
        if !part.rm_enabled {
            debug!(partition, "partition resource manager disabled");
            return;
        }

        let usage = UsageSnapshot::build(&self.state.jobs);
        let selection = select_jobs(
            &self.state.jobs,
            &self.state.jobs.handles(),
            &SelectRequest {
                level: PolicyLevel::Hard,
                limits: SelectLimits::default(),
                partition: &part,
                snapshot: None,
                now,
            },
            self.engine.as_ref(),
            &self.state.creds,
            &usage,
        );
        record_blocks(&mut self.state.jobs, &selection, partition, now);
        let mut queue = selection.selected;
        sort_queue(&self.state.jobs, &mut queue, Some(partition));

        let rsv_policy = self.state.policy.reservation_policy;
        let mut slots = RsvSlots::from_table(&self.state);
        let mut idle_job_found = false;

        for h in queue {
            let Some(job) = self.state.jobs.get(h) else {
                continue;
            };
            if job.state != JobState::Idle
                || job.estate.is_active()
                || job.has_live_allocation()
                || job.sync_master.is_some()
                || job.cancel_requested.is_some()
            {
                continue;
            }

            if !idle_job_found {
                if self.start_limit_hit() {
                    break;
                }
                if self.try_start(h, &part, now, false).await {
                    continue;
                }
            }

            let Some(job) = self.state.jobs.get(h) else {
                continue;
            };
            if job.state != JobState::Idle || job.cancel_requested.is_some() {
                continue;
            }
            let qos = job.creds.qos.clone();
            let next_to_run = qos.as_ref().is_some_and(|q| q.flags.next_to_run);
            if job.rsv.is_none() && rsv_policy != ReservationPolicy::Never {
                let deadline = job.deadline.is_some() && qos.as_ref().is_some_and(|q| q.flags.deadline);
                if deadline {
                    match create_deadline_reservation(&mut self.state, h, partition, now) {
                        Ok(rh) => self.rsv_created(rh, now),
                        Err(e) => self.deadline_failed(h, &e, now),
                    }
                } else {
                    let reserve_always = qos.as_ref().is_some_and(|q| q.flags.reserve_always);
                    let result = if reserve_always {
                        create_priority_reservation(&mut self.state, h, partition, now, &mut RsvSlots::new())
                    } else {
                        create_priority_reservation(&mut self.state, h, partition, now, &mut slots)
                    };
                    match result {
                        Ok(rh) => self.rsv_created(rh, now),
                        Err(RsvError::SlotsExhausted { bucket, .. }) => {
                            if !idle_job_found {
                                debug!(partition, bucket = %bucket, "reservation slots exhausted, holding back lower jobs");
                            }
                            idle_job_found = true;
                        }
                        Err(e) => debug!(job = %h, error = %e, "no priority reservation"),
                    }
                }
            }
            if next_to_run {
                idle_job_found = true;
            }
        }
    }

    /// Starts lower-priority jobs into gaps that close no earlier than
    /// their walltime.
    #[instrument(skip(self))]
    async fn backfill(&mut self, partition: &str, level: PolicyLevel, now: i64) {
        let policy = self.state.policy.backfill_policy;
        if policy == BackfillPolicy::None {
            return;
        }
        let Some(part) = self.state.partition(partition).cloned() else {
            return;
        };
        if !part.rm_enabled {
            return;
        }
        let windows = backfill_windows(&self.state, partition, now);
        if windows.is_empty() {
            return;
        }
        let snapshot = AvailabilitySnapshot {
            procs: windows.iter().map(|w| w.procs).max().unwrap_or(0),
            nodes: windows.iter().map(|w| w.nodes.len() as u32).max().unwrap_or(0),
        };

        let mut candidates = self.state.jobs.handles();
        sort_queue(&self.state.jobs, &mut candidates, Some(partition));
        let usage = UsageSnapshot::build(&self.state.jobs);
        let selection = select_jobs(
            &self.state.jobs,
            &candidates,
            &SelectRequest {
                level,
                limits: SelectLimits::default(),
                partition: &part,
                snapshot: Some(snapshot),
                now,
            },
            self.engine.as_ref(),
            &self.state.creds,
            &usage,
        );
        if level == PolicyLevel::Hard {
            record_blocks(&mut self.state.jobs, &selection, partition, now);
        }

        let jobs = &self.state.jobs;
        let eligible: Vec<JobHandle> = selection
            .selected
            .into_iter()
            .filter(|h| {
                jobs.get(*h).is_some_and(|j| {
                    j.rsv.is_none()
                        && j.cancel_requested.is_none()
                        && !j.flags.cluster_locked
                        && !j.creds.qos.as_ref().is_some_and(|q| q.flags.no_backfill)
                        && j.sync_master.is_none()
                        && j.sync_with.is_empty()
                })
            })
            .collect();
        let ordered = order_backfill_candidates(
            &self.state,
            &eligible,
            &windows,
            policy,
            self.state.policy.backfill_metric,
        );
        debug!(partition, level = %level, windows = windows.len(), candidates = ordered.len(), "backfill");

        for h in ordered {
            let idle = self
                .state
                .jobs
                .get(h)
                .is_some_and(|j| j.state == JobState::Idle && !j.has_live_allocation());
            if !idle {
                continue;
            }
            if self.start_limit_hit() {
                break;
            }
            self.try_start(h, &part, now, true).await;
        }
    }

    // =========================================================================
    // Finalize
    // =========================================================================

    async fn finalize(&mut self, queue: &[JobHandle], now: i64) {
        let iteration = self.state.iteration;

        if !self.stats.rm_degraded {
            let cancels: Vec<(String, String)> = self
                .state
                .jobs
                .iter()
                .filter(|(_, j)| !self.cancels_sent.contains(&j.name))
                .filter_map(|(_, j)| j.cancel_requested.clone().map(|m| (j.name.clone(), m)))
                .collect();
            for (name, message) in cancels {
                match self.rm.cancel_job(&name, &message).await {
                    Ok(()) => {
                        info!(job = %name, reason = %message, "job cancel requested");
                        self.cancels_sent.insert(name);
                    }
                    Err(e) => warn!(job = %name, error = %e, "cannot cancel job"),
                }
            }
        }

        let purged = self
            .state
            .jobs
            .purge_completed(now, self.state.policy.completed_job_retention);
        if purged > 0 {
            debug!(count = purged, "completed jobs purged");
        }

        if let Some(store) = self.checkpoint.as_mut() {
            for (object_type, id) in self.forgotten.drain(..) {
                if let Err(e) = store.remove(object_type, &id) {
                    warn!(object_id = %id, error = %e, "cannot drop checkpoint records");
                }
            }
            match checkpoint::persist_state(store.as_mut(), &self.state) {
                Ok(n) => debug!(records = n, "checkpoint written"),
                Err(e) => warn!(error = %e, "checkpoint failed"),
            }
        }

        let rows = queue_snapshot(&self.state, queue);
        self.stats.idle_jobs = rows.len() as u32;
        self.queue_tx.send_replace(rows);

        for problem in self.state.rsvs.check_consistency(&self.state.jobs, &self.state.nodes) {
            warn!(problem = %problem, "reservation accounting drift");
        }
        self.retry.prune(now);

        emit(
            self.sink.as_ref(),
            EventKind::CycleCompleted,
            "scheduler",
            format!("iteration {iteration} complete"),
            CycleCompletedPayload {
                jobs_started: self.stats.jobs_started,
                jobs_backfilled: self.stats.jobs_backfilled,
                reservations_created: self.stats.rsvs_created,
                jobs_rejected: self.stats.jobs_rejected,
                rm_degraded: self.stats.rm_degraded,
            },
            now,
            iteration,
        );
        info!(
            iteration = %iteration,
            started = self.stats.jobs_started,
            backfilled = self.stats.jobs_backfilled,
            resumed = self.stats.jobs_resumed,
            preempted = self.stats.jobs_preempted,
            rejected = self.stats.jobs_rejected,
            completed = self.stats.jobs_completed,
            reservations = self.stats.rsvs_created,
            idle = self.stats.idle_jobs,
            rm_degraded = self.stats.rm_degraded,
            "scheduling cycle complete"
        );
    }
}

impl std::fmt::Debug for SchedulingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulingCycle")
            .field("rm", &self.rm.name())
            .field("iteration", &self.state.iteration)
            .field("jobs", &self.state.jobs.len())
            .field("nodes", &self.state.nodes.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::SqliteCheckpointStore;
    use crate::config::{JobRejectPolicy, PreemptPolicy, SchedPolicy};
    use crate::model::{HoldKind, Resources};
    use crate::rm::{JobSpec, MockResourceManager, NodeSnapshot, RmAction};
    use batchd_events::MemoryEventSink;

    struct Harness {
        rm: Arc<MockResourceManager>,
        sink: Arc<MemoryEventSink>,
        cycle: SchedulingCycle,
    }

    async fn harness(policy: SchedPolicy, rm: MockResourceManager, procs: &[i64]) -> Harness {
        for (i, p) in procs.iter().enumerate() {
            rm.add_node(NodeSnapshot::new(format!("n{}", i + 1), "batch", Resources::new(*p, 8192)))
                .await;
        }
        let rm = Arc::new(rm);
        let sink = Arc::new(MemoryEventSink::new());
        let engine = WeightedPolicyEngine::new(policy.weights.clone(), policy.user_limits.clone());
        let cycle = SchedulingCycle::new(
            SchedState::new(policy),
            rm.clone(),
            sink.clone(),
            Box::new(engine),
        );
        Harness { rm, sink, cycle }
    }

    impl Harness {
        fn job(&self, name: &str) -> &crate::model::Job {
            self.cycle.state().jobs.by_name(name).unwrap()
        }

        fn dedicated_procs(&self, node: &str) -> i64 {
            self.cycle.state().nodes.by_name(node).unwrap().dres.procs
        }
    }

    #[tokio::test]
    async fn test_job_starts_and_completes() {
        let mut h = harness(SchedPolicy::default(), MockResourceManager::new(), &[4]).await;
        h.rm.submit(JobSpec::new("j1", "alice", 4, 1).with_walltime(100)).await;

        let stats = h.cycle.run_iteration(0).await;
        assert_eq!(stats.jobs_started, 1);
        assert_eq!(h.job("j1").state, JobState::Starting);
        assert_eq!(h.job("j1").estate, JobState::Running);
        assert_eq!(h.dedicated_procs("n1"), 4);
        assert_eq!(
            h.rm.actions().await,
            vec![RmAction::Start {
                job: "j1".into(),
                nodes: vec![("n1".into(), 4)]
            }]
        );
        let rsv = h.cycle.state().rsvs.by_name("j1").unwrap();
        assert_eq!(rsv.kind, RsvKind::ActiveJob);
        assert_eq!((rsv.start, rsv.end), (0, 100));

        let stats = h.cycle.run_iteration(30).await;
        assert_eq!(stats.jobs_started, 0);
        assert_eq!(h.job("j1").state, JobState::Running);

        h.rm.complete_job("j1", 80).await.unwrap();
        let stats = h.cycle.run_iteration(90).await;
        assert_eq!(stats.jobs_completed, 1);
        assert!(h.cycle.state().jobs.by_name("j1").is_none());
        assert!(h.cycle.state().jobs.find_completed("j1").is_some());
        assert_eq!(h.dedicated_procs("n1"), 0);
        assert!(h.cycle.state().rsvs.is_empty());

        assert_eq!(h.sink.of_kind(EventKind::JobStarted).len(), 1);
        assert_eq!(h.sink.of_kind(EventKind::JobCompleted).len(), 1);
        assert_eq!(h.sink.of_kind(EventKind::CycleCompleted).len(), 3);
    }

    #[tokio::test]
    async fn test_degraded_rm_starts_nothing() {
        let mut h = harness(SchedPolicy::default(), MockResourceManager::new(), &[4]).await;
        h.rm.submit(JobSpec::new("big", "alice", 8, 1)).await;
        h.cycle.run_iteration(0).await;
        let mut queue = h.cycle.subscribe();

        h.rm.set_unavailable(true);
        h.rm.submit(JobSpec::new("small", "alice", 1, 1)).await;
        let stats = h.cycle.run_iteration(30).await;

        assert!(stats.rm_degraded);
        assert_eq!(stats.jobs_started, 0);
        assert!(h.rm.actions().await.is_empty());
        assert_eq!(h.sink.of_kind(EventKind::RmDegraded).len(), 1);
        // The queue is still refreshed from the last known workload.
        assert!(queue.has_changed().unwrap());
        assert_eq!(queue.borrow_and_update()[0].job, "big");

        h.rm.set_unavailable(false);
        let stats = h.cycle.run_iteration(60).await;
        assert!(!stats.rm_degraded);
        assert_eq!(stats.jobs_started, 1);
        assert_eq!(h.job("small").estate, JobState::Running);
    }

    #[tokio::test]
    async fn test_start_limit_spans_all_phases() {
        let policy = SchedPolicy {
            max_job_start_per_iteration: 1,
            ..SchedPolicy::default()
        };
        let mut h = harness(policy, MockResourceManager::new(), &[4]).await;
        h.rm.submit(JobSpec::new("a", "alice", 1, 1).with_priority(10)).await;
        h.rm.submit(JobSpec::new("b", "bob", 1, 1)).await;

        let stats = h.cycle.run_iteration(0).await;
        assert_eq!(stats.jobs_started + stats.jobs_backfilled, 1);
        assert!(stats.start_limit_hit);
        assert_eq!(h.job("a").estate, JobState::Running);
        assert_eq!(h.job("b").state, JobState::Idle);

        let stats = h.cycle.run_iteration(30).await;
        assert_eq!(stats.jobs_started + stats.jobs_backfilled, 1);
        assert_eq!(h.job("b").estate, JobState::Running);
    }

    async fn started_jobs(h: &Harness) -> Vec<String> {
        h.rm.actions()
            .await
            .into_iter()
            .filter_map(|a| match a {
                RmAction::Start { job, .. } => Some(job),
                _ => None,
            })
            .collect()
    }

    async fn submit_sync_pair(h: &Harness) {
        let mut master = JobSpec::new("m", "alice", 2, 1).with_priority(10);
        master.sync_with = vec!["s".into()];
        h.rm.submit(master).await;
        h.rm.submit(JobSpec::new("s", "alice", 2, 1)).await;
    }

    #[tokio::test]
    async fn test_sync_group_starts_together() {
        let mut h = harness(SchedPolicy::default(), MockResourceManager::new(), &[8]).await;
        submit_sync_pair(&h).await;

        let stats = h.cycle.run_iteration(0).await;
        assert_eq!(stats.jobs_started, 2);
        assert_eq!(h.job("m").estate, JobState::Running);
        assert_eq!(h.job("s").estate, JobState::Running);
        let started = started_jobs(&h).await;
        assert_eq!(started.len(), 2);
        assert!(started.contains(&"m".to_string()));
        assert!(started.contains(&"s".to_string()));
        assert_eq!(h.dedicated_procs("n1"), 4);
    }

    #[tokio::test]
    async fn test_sync_group_waits_for_held_member() {
        let mut h = harness(SchedPolicy::default(), MockResourceManager::new(), &[8]).await;
        submit_sync_pair(&h).await;
        h.rm.set_job_state("s", JobState::Hold).await.unwrap();

        let stats = h.cycle.run_iteration(0).await;
        assert_eq!(stats.jobs_started, 0);
        assert_eq!(h.job("m").state, JobState::Idle);
        assert!(!h.job("m").has_live_allocation());
        assert!(started_jobs(&h).await.is_empty());
        assert_eq!(h.dedicated_procs("n1"), 0);
    }

    #[tokio::test]
    async fn test_sync_group_respects_start_limit() {
        let policy = SchedPolicy {
            max_job_start_per_iteration: 1,
            ..SchedPolicy::default()
        };
        let mut h = harness(policy, MockResourceManager::new(), &[8]).await;
        submit_sync_pair(&h).await;

        let stats = h.cycle.run_iteration(0).await;
        assert_eq!(stats.jobs_started + stats.jobs_backfilled, 0);
        assert!(stats.start_limit_hit);
        assert!(started_jobs(&h).await.is_empty());
        assert_eq!(h.job("m").state, JobState::Idle);
        assert_eq!(h.job("s").state, JobState::Idle);
        assert_eq!(h.dedicated_procs("n1"), 0);
    }

    #[tokio::test]
    async fn test_reservation_protects_top_job_and_backfill_fills_gap() {
        let policy = SchedPolicy {
            reservation_policy: ReservationPolicy::HighestPriority,
            ..SchedPolicy::default()
        };
        let mut h = harness(policy, MockResourceManager::new().simulated(), &[4]).await;
        h.rm.submit(JobSpec::new("first", "alice", 2, 1).with_walltime(100)).await;
        h.cycle.run_iteration(0).await;
        assert_eq!(h.job("first").estate, JobState::Running);

        h.rm.submit(JobSpec::new("big", "alice", 4, 1).with_walltime(100).with_priority(100)).await;
        h.rm.submit(JobSpec::new("big2", "bob", 4, 1).with_walltime(100).with_priority(50)).await;
        h.rm.submit(JobSpec::new("small", "carol", 2, 1).with_walltime(50)).await;
        let stats = h.cycle.run_iteration(10).await;

        // big reserves the node once first ends; the single slot is taken
        // so big2 stays unreserved and small may only backfill.
        let rsv = h.cycle.state().rsvs.get(h.job("big").rsv.unwrap()).unwrap();
        assert_eq!(rsv.kind, RsvKind::PriorityJob);
        assert_eq!(rsv.start, 100);
        assert!(h.job("big2").rsv.is_none());
        assert_eq!(stats.jobs_started, 0);
        assert_eq!(stats.jobs_backfilled, 1);
        assert_eq!(h.job("small").estate, JobState::Running);
        assert_eq!(h.sink.of_kind(EventKind::JobBackfilled).len(), 1);

        let stats = h.cycle.run_iteration(100).await;
        assert_eq!(stats.jobs_completed, 2);
        assert_eq!(stats.jobs_started, 1);
        let big = h.job("big");
        assert_eq!(big.estate, JobState::Running);
        assert!(!big.messages.contains("reserved resources"));
        let rsv = h.cycle.state().rsvs.get(big.rsv.unwrap()).unwrap();
        assert_eq!(rsv.kind, RsvKind::ActiveJob);
        assert_eq!(h.job("big2").state, JobState::Idle);
    }

    #[tokio::test]
    async fn test_suspend_preemption_and_resume() {
        let policy = SchedPolicy {
            allow_preemption: true,
            preempt_policy: PreemptPolicy::Suspend,
            ..SchedPolicy::default()
        };
        let mut h = harness(policy, MockResourceManager::new().simulated(), &[4]).await;
        let mut low = JobSpec::new("low", "alice", 4, 1).with_walltime(1000);
        low.flags.preemptible = true;
        h.rm.submit(low).await;
        h.cycle.run_iteration(0).await;
        assert_eq!(h.job("low").estate, JobState::Running);

        let mut urgent = JobSpec::new("urgent", "bob", 4, 1)
            .with_walltime(50)
            .with_priority(1000);
        urgent.flags.preemptor = true;
        h.rm.submit(urgent).await;
        let stats = h.cycle.run_iteration(10).await;

        assert_eq!(stats.jobs_preempted, 1);
        assert_eq!(stats.jobs_started, 1);
        let low = h.job("low");
        assert_eq!(low.state, JobState::Suspended);
        assert!(low.suspended_by_scheduler);
        assert_eq!(h.job("urgent").estate, JobState::Running);
        assert_eq!(h.dedicated_procs("n1"), 4);
        assert!(h
            .rm
            .actions()
            .await
            .contains(&RmAction::Suspend { job: "low".into() }));

        let stats = h.cycle.run_iteration(60).await;
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.jobs_resumed, 1);
        let low = h.job("low");
        assert_eq!(low.state, JobState::Running);
        assert!(!low.suspended_by_scheduler);
        assert_eq!(h.dedicated_procs("n1"), 4);
        assert_eq!(h.sink.of_kind(EventKind::JobResumed).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_preempts_nothing() {
        let policy = SchedPolicy {
            allow_preemption: true,
            preempt_policy: PreemptPolicy::Suspend,
            ..SchedPolicy::default()
        };
        let mut h = harness(policy, MockResourceManager::new().simulated(), &[4]).await;
        let mut low = JobSpec::new("low", "alice", 4, 1).with_walltime(1000);
        low.flags.preemptible = true;
        h.rm.submit(low).await;
        h.cycle.run_iteration(0).await;

        let mut urgent = JobSpec::new("urgent", "bob", 4, 1)
            .with_walltime(50)
            .with_priority(1000);
        urgent.flags.preemptor = true;
        h.rm.submit(urgent).await;
        assert!(h.cycle.reconcile(10).await);

        let job = h.cycle.state.jobs.find("urgent").unwrap();
        let opts = crate::alloc::AllocOptions {
            allow_preemption: true,
            restrict_to: None,
        };
        let plan = crate::alloc::plan_allocation(&h.cycle.state, job, "batch", 10, 10, &opts).unwrap();
        assert_eq!(plan.preempt.len(), 1);

        // The node shrinks between planning and commit.
        let n1 = h.cycle.state.nodes.find("n1").unwrap();
        h.cycle.state.nodes.get_mut(n1).unwrap().cres.procs = 3;

        let result = h
            .cycle
            .launch(vec![workflow::MemberPlan { job, plan }], false, 10)
            .await;
        assert!(matches!(
            result,
            Err(start::LaunchError::Alloc(crate::alloc::AllocError::Oversubscribed { .. }))
        ));
        let low = h.job("low");
        assert_eq!(low.estate, JobState::Running);
        assert_ne!(low.state, JobState::Suspended);
        assert!(!low.suspended_by_scheduler);
        assert!(low.has_live_allocation());
        assert!(!h.job("urgent").has_live_allocation());
        assert_eq!(h.cycle.stats.jobs_preempted, 0);
        assert_eq!(h.dedicated_procs("n1"), 4);
        assert!(!h
            .rm
            .actions()
            .await
            .contains(&RmAction::Suspend { job: "low".into() }));
    }

    #[tokio::test]
    async fn test_malformed_geometry_is_rejected() {
        let mut h = harness(SchedPolicy::default(), MockResourceManager::new(), &[4]).await;
        let mut spec = JobSpec::new("odd", "alice", 2, 1);
        spec.geometry = Some("{0,1,2}".into());
        h.rm.submit(spec).await;

        let stats = h.cycle.run_iteration(0).await;
        assert_eq!(stats.jobs_started, 0);
        assert_eq!(stats.jobs_rejected, 1);
        let job = h.job("odd");
        assert_eq!(job.state, JobState::Hold);
        assert_eq!(job.holds.active(0), Some(HoldKind::Batch));
        assert!(job.messages.contains("job was rejected"));
        assert_eq!(h.sink.of_kind(EventKind::JobHeld).len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_policy_dispatches_once() {
        let policy = SchedPolicy {
            job_reject_policy: vec![JobRejectPolicy::Cancel, JobRejectPolicy::Notify],
            ..SchedPolicy::default()
        };
        let mut h = harness(policy, MockResourceManager::new(), &[4]).await;
        let mut spec = JobSpec::new("odd", "alice", 2, 1);
        spec.geometry = Some("{0,1,2}".into());
        h.rm.submit(spec).await;

        h.cycle.run_iteration(0).await;
        assert_eq!(h.sink.of_kind(EventKind::JobRejected).len(), 1);
        let cancels = h
            .rm
            .actions()
            .await
            .into_iter()
            .filter(|a| matches!(a, RmAction::Cancel { .. }))
            .count();
        assert_eq!(cancels, 1);

        let stats = h.cycle.run_iteration(30).await;
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(h.sink.of_kind(EventKind::JobCancelled).len(), 1);
    }

    #[tokio::test]
    async fn test_holds_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.db");
        let rm = Arc::new(MockResourceManager::new());
        rm.add_node(NodeSnapshot::new("n1", "batch", Resources::new(4, 8192))).await;
        let mut spec = JobSpec::new("odd", "alice", 2, 1);
        spec.geometry = Some("{0,1,2}".into());
        rm.submit(spec).await;

        let policy = SchedPolicy::default();
        let engine = || {
            Box::new(WeightedPolicyEngine::new(
                policy.weights.clone(),
                policy.user_limits.clone(),
            ))
        };
        {
            let store = SqliteCheckpointStore::open(&path).unwrap();
            let mut cycle = SchedulingCycle::new(
                SchedState::new(policy.clone()),
                rm.clone(),
                Arc::new(MemoryEventSink::new()),
                engine(),
            )
            .with_checkpoint(Box::new(store));
            cycle.run_iteration(0).await;
            assert_eq!(cycle.state().jobs.by_name("odd").unwrap().state, JobState::Hold);
        }

        // A restarted scheduler that only notifies on rejection still
        // sees the hold it placed before.
        let restarted = SchedPolicy {
            job_reject_policy: vec![JobRejectPolicy::Notify],
            ..policy.clone()
        };
        let sink = Arc::new(MemoryEventSink::new());
        let store = SqliteCheckpointStore::open(&path).unwrap();
        let mut cycle = SchedulingCycle::new(SchedState::new(restarted), rm.clone(), sink.clone(), engine())
            .with_checkpoint(Box::new(store));
        cycle.run_iteration(30).await;
        let job = cycle.state().jobs.by_name("odd").unwrap();
        assert_eq!(job.state, JobState::Hold);
        assert_eq!(job.holds.active(30), Some(HoldKind::Batch));
        assert!(sink.of_kind(EventKind::JobRejected).is_empty());
    }

    #[tokio::test]
    async fn test_queue_snapshot_lists_blocked_jobs() {
        let mut h = harness(SchedPolicy::default(), MockResourceManager::new(), &[4]).await;
        let queue = h.cycle.subscribe();
        h.rm.submit(JobSpec::new("fits", "alice", 4, 1).with_priority(10)).await;
        h.rm.submit(JobSpec::new("waits", "bob", 4, 1)).await;

        let stats = h.cycle.run_iteration(0).await;
        assert_eq!(stats.idle_jobs, 1);
        let rows = queue.borrow().clone();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].job, "waits");
    }
}
