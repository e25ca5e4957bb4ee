//! Per-iteration job selection.
//!
//! [`select_jobs`] is a pure function over the job table: the soft pass can
//! be called any number of times for statistics without changing anything.
//! The hard pass is followed by [`record_blocks`], which writes the blocking
//! reason of every rejected job for diagnostics.

use batchd_id::JobHandle;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::engine::{PolicyContext, PolicyEngine, PolicyLevel, UsageSnapshot};
use crate::model::{evaluate_for_partition, CredStore, HoldKind, JobState, JobTable, Partition};

/// Why a job was not selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "code", content = "detail")]
pub enum BlockReason {
    PartitionAccess,
    State(JobState),
    Deferred(i64),
    Hold(HoldKind),
    Triggers,
    InadequateProcs { requested: i64, configured: i64 },
    PolicyViolation(String),
    Resources,
    NodeLimit,
    TaskLimit,
    TimeLimit,
}

impl BlockReason {
    /// Short code for queue reporting.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PartitionAccess => "partition_access",
            Self::State(_) => "state",
            Self::Deferred(_) => "deferred",
            Self::Hold(_) => "hold",
            Self::Triggers => "triggers",
            Self::InadequateProcs { .. } => "inadequate_procs",
            Self::PolicyViolation(_) => "policy",
            Self::Resources => "resources",
            Self::NodeLimit => "node_limit",
            Self::TaskLimit => "task_limit",
            Self::TimeLimit => "time_limit",
        }
    }

    /// Operator message.
    pub fn message(&self, partition: &str) -> String {
        match self {
            Self::PartitionAccess => format!("cannot access partition {partition}"),
            Self::State(s) => format!("non-idle state '{s}'"),
            Self::Deferred(secs) => format!("deferred for {secs} seconds"),
            Self::Hold(kind) => format!("job hold active - {kind}"),
            Self::Triggers => "waiting on triggers".to_string(),
            Self::InadequateProcs {
                requested,
                configured,
            } => format!("inadequate procs in partition: (R:{requested}, C:{configured})"),
            Self::PolicyViolation(reason) => format!("policy violation - {reason}"),
            Self::Resources => "inadequate resources available".to_string(),
            Self::NodeLimit => "node count exceeds window".to_string(),
            Self::TaskLimit => "task count exceeds window".to_string(),
            Self::TimeLimit => "walltime exceeds window".to_string(),
        }
    }
}

/// The last blocking reason recorded for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub partition: String,
    pub reason: BlockReason,
    pub message: String,
    pub at: i64,
}

/// Resource window bounds a selected job must fit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectLimits {
    pub node_limit: Option<u32>,
    pub task_limit: Option<u32>,
    pub time_limit: Option<i64>,
}

/// Free capacity seen by a hard pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AvailabilitySnapshot {
    pub procs: i64,
    pub nodes: u32,
}

/// Parameters of one selection call.
#[derive(Debug, Clone, Copy)]
pub struct SelectRequest<'a> {
    pub level: PolicyLevel,
    pub limits: SelectLimits,
    pub partition: &'a Partition,
    /// Hard passes with a snapshot also require current feasibility.
    pub snapshot: Option<AvailabilitySnapshot>,
    pub now: i64,
}

/// Outcome of a selection call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub selected: Vec<JobHandle>,
    pub blocked: Vec<(JobHandle, BlockReason)>,
    /// Candidates whose slot no longer holds a job.
    pub stale: usize,
}

/// Selects the candidates that may be scheduled in `req.partition`.
///
/// Candidate order is preserved. Jobs with a pending cancel are dropped
/// silently.
pub fn select_jobs(
    jobs: &JobTable,
    candidates: &[JobHandle],
    req: &SelectRequest<'_>,
    engine: &dyn PolicyEngine,
    creds: &CredStore,
    usage: &UsageSnapshot,
) -> Selection {
    let mut out = Selection::default();
    let part = req.partition;

    for &handle in candidates {
        let Some(job) = jobs.get(handle) else {
            out.stale += 1;
            continue;
        };
        if job.cancel_requested.is_some() {
            continue;
        }

        let reason = if job.state != JobState::Idle || job.estate.is_active() {
            let shown = if job.state == JobState::Idle { job.estate } else { job.state };
            Some(BlockReason::State(shown))
        } else if !job.pal.contains(part.index) {
            Some(BlockReason::PartitionAccess)
        } else if let Some(kind) = job.holds.active(req.now) {
            match (kind, job.holds.defer_until) {
                (HoldKind::Defer, Some(until)) => Some(BlockReason::Deferred(until - req.now)),
                _ => Some(BlockReason::Hold(kind)),
            }
        } else if job.waiting_on_triggers() {
            Some(BlockReason::Triggers)
        } else if part.config_procs > 0 && job.requested_procs() > part.config_procs {
            Some(BlockReason::InadequateProcs {
                requested: job.requested_procs(),
                configured: part.config_procs,
            })
        } else if req
            .limits
            .node_limit
            .is_some_and(|max| job.reqs.iter().map(|r| r.node_count).sum::<u32>() > max)
        {
            Some(BlockReason::NodeLimit)
        } else if req.limits.task_limit.is_some_and(|max| job.request_tc() > max) {
            Some(BlockReason::TaskLimit)
        } else if req.limits.time_limit.is_some_and(|max| job.walltime > max) {
            Some(BlockReason::TimeLimit)
        } else {
            let view = evaluate_for_partition(&job.creds, part, creds);
            let ctx = PolicyContext {
                job,
                view: &view,
                partition: part,
                usage,
                now: req.now,
            };
            let verdict = engine.limit_violation(&ctx, req.level);
            if verdict.violated {
                Some(BlockReason::PolicyViolation(
                    verdict.reason.unwrap_or_else(|| "limit".to_string()),
                ))
            } else if req.level == PolicyLevel::Hard
                && req
                    .snapshot
                    .is_some_and(|s| s.nodes == 0 || job.requested_procs() > s.procs)
            {
                Some(BlockReason::Resources)
            } else {
                None
            }
        };

        match reason {
            Some(r) => out.blocked.push((handle, r)),
            None => out.selected.push(handle),
        }
    }

    if out.stale > 0 {
        warn!(stale = out.stale, partition = %part.name, "job table slots went stale during selection");
    }
    debug!(
        partition = %part.name,
        level = %req.level,
        selected = out.selected.len(),
        blocked = out.blocked.len(),
        "job selection"
    );

    out
}

/// Writes hard-pass blocking reasons to the jobs.
pub fn record_blocks(jobs: &mut JobTable, selection: &Selection, partition: &str, now: i64) {
    for (handle, reason) in &selection.blocked {
        if let Some(job) = jobs.get_mut(*handle) {
            job.block = Some(BlockRecord {
                partition: partition.to_string(),
                message: reason.message(partition),
                reason: reason.clone(),
                at: now,
            });
        }
    }
    for handle in &selection.selected {
        if let Some(job) = jobs.get_mut(*handle) {
            job.block = None;
        }
    }
}

/// Releases defer holds that have expired. Returns the released job names.
pub fn release_expired_holds(jobs: &mut JobTable, now: i64) -> Vec<String> {
    let mut released = Vec::new();
    for (_, job) in jobs.iter_mut() {
        if job.holds.release_expired_defer(now) {
            if job.state == JobState::Deferred {
                job.state = JobState::Idle;
            }
            released.push(job.name.clone());
        }
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HoldReason, Job, JobCredentials, PartitionMask, Req, Resources};
    use crate::policy::WeightedPolicyEngine;

    struct Fixture {
        jobs: JobTable,
        creds: CredStore,
        part: Partition,
        engine: WeightedPolicyEngine,
    }

    impl Fixture {
        fn new() -> Self {
            let mut part = Partition::new("batch", 0);
            part.config_procs = 8;
            Self {
                jobs: JobTable::default(),
                creds: CredStore::new(),
                part,
                engine: WeightedPolicyEngine::default(),
            }
        }

        fn add(&mut self, name: &str, tasks: u32) -> JobHandle {
            let job = Job::new(name, JobCredentials::for_user(&mut self.creds, "alice"))
                .with_req(Req::new(tasks, Resources::new(1, 0)))
                .with_walltime(600);
            self.jobs.insert(job).unwrap()
        }

        fn select(&self, level: PolicyLevel, snapshot: Option<AvailabilitySnapshot>) -> Selection {
            let usage = UsageSnapshot::build(&self.jobs);
            let req = SelectRequest {
                level,
                limits: SelectLimits::default(),
                partition: &self.part,
                snapshot,
                now: 100,
            };
            select_jobs(&self.jobs, &self.jobs.handles(), &req, &self.engine, &self.creds, &usage)
        }
    }

    #[test]
    fn test_block_reasons() {
        let mut f = Fixture::new();
        let ok = f.add("ok", 2);
        let running = f.add("running", 1);
        let no_access = f.add("noaccess", 1);
        let deferred = f.add("deferred", 1);
        let held = f.add("held", 1);
        let big = f.add("big", 16);
        let cancelled = f.add("cancelled", 1);

        f.jobs.get_mut(running).unwrap().state = JobState::Running;
        f.jobs.get_mut(no_access).unwrap().pal = PartitionMask::empty().with(3);
        f.jobs
            .get_mut(deferred)
            .unwrap()
            .holds
            .set(HoldKind::Defer, HoldReason::RmReject, Some(160));
        f.jobs
            .get_mut(held)
            .unwrap()
            .holds
            .set(HoldKind::User, HoldReason::Admin, None);
        f.jobs.get_mut(cancelled).unwrap().cancel_requested = Some("admin".into());

        let sel = f.select(PolicyLevel::Soft, None);
        assert_eq!(sel.selected, vec![ok]);
        let reason = |h| sel.blocked.iter().find(|(b, _)| *b == h).map(|(_, r)| r.clone());
        assert_eq!(reason(running), Some(BlockReason::State(JobState::Running)));
        assert_eq!(reason(no_access), Some(BlockReason::PartitionAccess));
        assert_eq!(reason(deferred), Some(BlockReason::Deferred(60)));
        assert_eq!(reason(held), Some(BlockReason::Hold(HoldKind::User)));
        assert_eq!(
            reason(big),
            Some(BlockReason::InadequateProcs {
                requested: 16,
                configured: 8
            })
        );
        assert_eq!(reason(cancelled), None);

        assert_eq!(
            BlockReason::InadequateProcs {
                requested: 16,
                configured: 8
            }
            .message("batch"),
            "inadequate procs in partition: (R:16, C:8)"
        );
    }

    #[test]
    fn test_soft_selection_is_idempotent() {
        let mut f = Fixture::new();
        f.add("a", 1);
        let held = f.add("b", 1);
        f.jobs
            .get_mut(held)
            .unwrap()
            .holds
            .set(HoldKind::User, HoldReason::Admin, None);

        let first = f.select(PolicyLevel::Soft, None);
        let blocks_before: Vec<_> = f.jobs.iter().map(|(_, j)| j.block.clone()).collect();
        let second = f.select(PolicyLevel::Soft, None);
        let blocks_after: Vec<_> = f.jobs.iter().map(|(_, j)| j.block.clone()).collect();

        assert_eq!(first, second);
        assert_eq!(blocks_before, blocks_after);
    }

    #[test]
    fn test_hard_pass_snapshot_and_records() {
        let mut f = Fixture::new();
        let small = f.add("small", 2);
        let large = f.add("large", 6);

        let sel = f.select(
            PolicyLevel::Hard,
            Some(AvailabilitySnapshot { procs: 4, nodes: 1 }),
        );
        assert_eq!(sel.selected, vec![small]);
        assert_eq!(sel.blocked, vec![(large, BlockReason::Resources)]);

        record_blocks(&mut f.jobs, &sel, "batch", 100);
        let rec = f.jobs.get(large).unwrap().block.clone().unwrap();
        assert_eq!(rec.reason, BlockReason::Resources);
        assert_eq!(rec.partition, "batch");
        assert!(f.jobs.get(small).unwrap().block.is_none());
    }

    #[test]
    fn test_window_limits() {
        let mut f = Fixture::new();
        let short = f.add("short", 1);
        let long = f.add("long", 1);
        f.jobs.get_mut(long).unwrap().walltime = 7200;

        let usage = UsageSnapshot::build(&f.jobs);
        let req = SelectRequest {
            level: PolicyLevel::Hard,
            limits: SelectLimits {
                node_limit: None,
                task_limit: Some(4),
                time_limit: Some(3600),
            },
            partition: &f.part,
            snapshot: None,
            now: 0,
        };
        let sel = select_jobs(&f.jobs, &f.jobs.handles(), &req, &f.engine, &f.creds, &usage);
        assert_eq!(sel.selected, vec![short]);
        assert_eq!(sel.blocked, vec![(long, BlockReason::TimeLimit)]);
    }

    #[test]
    fn test_release_expired_holds() {
        let mut f = Fixture::new();
        let h = f.add("a", 1);
        f.jobs
            .get_mut(h)
            .unwrap()
            .holds
            .set(HoldKind::Defer, HoldReason::RmReject, Some(50));
        assert!(release_expired_holds(&mut f.jobs, 40).is_empty());
        assert_eq!(release_expired_holds(&mut f.jobs, 60), vec!["a".to_string()]);
        assert!(f.jobs.get(h).unwrap().holds.defer_until.is_none());
    }
}
