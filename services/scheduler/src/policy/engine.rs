//! Policy engine seam: limit checks and priority values.
//!
//! The scheduler only depends on the [`PolicyEngine`] trait. The default
//! [`WeightedPolicyEngine`] combines queue time, expansion factor and
//! credential priorities and enforces per-user idle job and processor
//! limits.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{PriorityWeights, UserLimits};
use crate::model::{CredentialView, Job, JobState, JobTable, Partition};

/// Which limit set a check runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyLevel {
    Hard,
    Soft,
}

impl std::fmt::Display for PolicyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hard => f.write_str("hard"),
            Self::Soft => f.write_str("soft"),
        }
    }
}

/// Result of a limit check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicyVerdict {
    pub violated: bool,
    pub reason: Option<String>,
}

impl PolicyVerdict {
    pub fn pass() -> Self {
        Self::default()
    }

    pub fn violation(reason: impl Into<String>) -> Self {
        Self {
            violated: true,
            reason: Some(reason.into()),
        }
    }
}

/// Per-user usage, computed once per iteration before selection.
#[derive(Debug, Clone, Default)]
pub struct UsageSnapshot {
    /// Position of each idle job among its user's idle jobs (submit order).
    idle_rank: HashMap<String, u32>,
    /// Processors dedicated to each user's active jobs.
    active_procs: HashMap<String, i64>,
}

impl UsageSnapshot {
    pub fn build(jobs: &JobTable) -> Self {
        let mut idle: HashMap<String, Vec<(i64, String)>> = HashMap::new();
        let mut active_procs: HashMap<String, i64> = HashMap::new();

        for (_, job) in jobs.iter() {
            let user = job.creds.user.name.clone();
            if job.state.is_active() || job.estate.is_active() {
                *active_procs.entry(user).or_insert(0) += job.requested_procs();
            } else if job.state == JobState::Idle {
                idle.entry(user)
                    .or_default()
                    .push((job.submit_time, job.name.clone()));
            }
        }

        let mut idle_rank = HashMap::new();
        for (_, mut list) in idle {
            list.sort();
            for (rank, (_, name)) in list.into_iter().enumerate() {
                idle_rank.insert(name, rank as u32);
            }
        }

        Self {
            idle_rank,
            active_procs,
        }
    }

    pub fn idle_rank(&self, job: &str) -> u32 {
        self.idle_rank.get(job).copied().unwrap_or(0)
    }

    pub fn active_procs(&self, user: &str) -> i64 {
        self.active_procs.get(user).copied().unwrap_or(0)
    }
}

/// Inputs to one policy evaluation.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    pub job: &'a Job,
    pub view: &'a CredentialView,
    pub partition: &'a Partition,
    pub usage: &'a UsageSnapshot,
    pub now: i64,
}

/// Injected policy: limit checks and priority.
pub trait PolicyEngine: Send + Sync {
    /// Checks the job against the `level` limits of its partition.
    fn limit_violation(&self, ctx: &PolicyContext<'_>, level: PolicyLevel) -> PolicyVerdict;

    /// Start priority of the job in the context's partition.
    fn priority(&self, ctx: &PolicyContext<'_>) -> i64;
}

/// Default weighted-sum policy.
#[derive(Debug, Clone, Default)]
pub struct WeightedPolicyEngine {
    pub weights: PriorityWeights,
    pub limits: UserLimits,
}

impl WeightedPolicyEngine {
    pub fn new(weights: PriorityWeights, limits: UserLimits) -> Self {
        Self { weights, limits }
    }

    /// Expansion factor `(queued + walltime) / walltime`, scaled by 100.
    fn xfactor(job: &Job) -> i64 {
        let wall = job.spec_walltime.max(1);
        (job.eff_queue_duration + wall) * 100 / wall
    }
}

impl PolicyEngine for WeightedPolicyEngine {
    fn limit_violation(&self, ctx: &PolicyContext<'_>, level: PolicyLevel) -> PolicyVerdict {
        let idle_limit = match level {
            PolicyLevel::Hard => self.limits.max_idle_jobs_hard,
            PolicyLevel::Soft => self.limits.max_idle_jobs_soft.or(self.limits.max_idle_jobs_hard),
        };
        if let Some(max) = idle_limit {
            if ctx.usage.idle_rank(&ctx.job.name) >= max {
                return PolicyVerdict::violation(format!(
                    "MaxIJob ({} {}) for user {}",
                    level, max, ctx.view.user.name
                ));
            }
        }

        if let Some(max) = self.limits.max_procs {
            let used = ctx.usage.active_procs(&ctx.view.user.name);
            let wanted = ctx.job.requested_procs();
            if used + wanted > max {
                return PolicyVerdict::violation(format!(
                    "MaxProc ({} + {} > {}) for user {}",
                    used, wanted, max, ctx.view.user.name
                ));
            }
        }

        PolicyVerdict::pass()
    }

    fn priority(&self, ctx: &PolicyContext<'_>) -> i64 {
        let queue_minutes = ctx.job.eff_queue_duration / 60;
        self.weights.queue_time * queue_minutes
            + self.weights.credential * ctx.view.priority()
            + self.weights.xfactor * Self::xfactor(ctx.job) / 100
            + ctx.job.user_priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{evaluate_for_partition, CredStore, JobCredentials, Req, Resources};

    fn setup() -> (CredStore, Partition) {
        (CredStore::new(), Partition::new("batch", 0))
    }

    #[test]
    fn test_priority_monotonic_in_queue_time() {
        let (mut store, part) = setup();
        let mut job = Job::new("j1", JobCredentials::for_user(&mut store, "alice")).with_walltime(600);
        let view = evaluate_for_partition(&job.creds, &part, &store);
        let usage = UsageSnapshot::default();
        let engine = WeightedPolicyEngine::new(
            PriorityWeights {
                queue_time: 2,
                xfactor: 10,
                credential: 1,
            },
            UserLimits::default(),
        );

        let mut last = i64::MIN;
        for minutes in [0, 1, 5, 60, 600] {
            job.eff_queue_duration = minutes * 60;
            let ctx = PolicyContext {
                job: &job,
                view: &view,
                partition: &part,
                usage: &usage,
                now: 0,
            };
            let p = engine.priority(&ctx);
            assert!(p >= last);
            last = p;
        }
    }

    #[test]
    fn test_idle_job_limit() {
        let (mut store, part) = setup();
        let mut jobs = JobTable::default();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let mut j = Job::new(*name, JobCredentials::for_user(&mut store, "alice"))
                .with_req(Req::new(1, Resources::new(1, 0)));
            j.submit_time = i as i64;
            jobs.insert(j).unwrap();
        }
        let usage = UsageSnapshot::build(&jobs);
        let engine = WeightedPolicyEngine::new(
            PriorityWeights::default(),
            UserLimits {
                max_idle_jobs_soft: Some(1),
                max_idle_jobs_hard: Some(2),
                max_procs: None,
            },
        );

        let check = |name: &str, level| {
            let job = jobs.by_name(name).unwrap();
            let view = evaluate_for_partition(&job.creds, &part, &store);
            let ctx = PolicyContext {
                job,
                view: &view,
                partition: &part,
                usage: &usage,
                now: 0,
            };
            engine.limit_violation(&ctx, level).violated
        };

        assert!(!check("a", PolicyLevel::Soft));
        assert!(check("b", PolicyLevel::Soft));
        assert!(!check("b", PolicyLevel::Hard));
        assert!(check("c", PolicyLevel::Hard));
    }

    #[test]
    fn test_max_procs_reason() {
        let (mut store, part) = setup();
        let mut jobs = JobTable::default();
        let mut running = Job::new("r", JobCredentials::for_user(&mut store, "alice"))
            .with_req(Req::new(6, Resources::new(1, 0)));
        running.state = JobState::Running;
        jobs.insert(running).unwrap();
        let idle = Job::new("i", JobCredentials::for_user(&mut store, "alice"))
            .with_req(Req::new(4, Resources::new(1, 0)));
        jobs.insert(idle).unwrap();

        let usage = UsageSnapshot::build(&jobs);
        let engine = WeightedPolicyEngine::new(
            PriorityWeights::default(),
            UserLimits {
                max_procs: Some(8),
                ..UserLimits::default()
            },
        );
        let job = jobs.by_name("i").unwrap();
        let view = evaluate_for_partition(&job.creds, &part, &store);
        let verdict = engine.limit_violation(
            &PolicyContext {
                job,
                view: &view,
                partition: &part,
                usage: &usage,
                now: 0,
            },
            PolicyLevel::Hard,
        );
        assert!(verdict.violated);
        assert!(verdict.reason.unwrap().starts_with("MaxProc"));
    }
}
