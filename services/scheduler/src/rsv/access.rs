//! Reservation access rules.
//!
//! Rules are evaluated in a fixed order and the first match decides. Every
//! outcome carries an operator-readable reason.

use batchd_id::JobHandle;
use serde::{Deserialize, Serialize};

use super::{Reservation, RsvKind};
use crate::model::{CredKind, Job};

/// Preference of a job for a reservation's resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Affinity {
    Positive,
    Neutral,
    Negative,
    Unavailable,
}

/// Result of an access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsvAccess {
    pub granted: bool,
    pub affinity: Affinity,
    pub reason: String,
}

impl RsvAccess {
    fn grant(affinity: Affinity, reason: impl Into<String>) -> Self {
        Self {
            granted: true,
            affinity,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            granted: false,
            affinity: Affinity::Unavailable,
            reason: reason.into(),
        }
    }
}

/// Job-side inputs to an access check.
#[derive(Debug, Clone)]
pub struct AccessContext<'a> {
    pub job: &'a Job,
    /// `None` for pseudo jobs that are not in the table.
    pub handle: Option<JobHandle>,
    /// Credentials of the job in the partition being scheduled.
    pub creds: &'a [(CredKind, String)],
    /// Jobs currently running inside the reservation.
    pub jobs_in_rsv: u32,
    /// The reservation's owning job is active.
    pub owner_active: bool,
    pub now: i64,
}

const ALL: &str = "ALL";
const ALL_JOB: &str = "[ALLJOB]";

fn list_matches(list: &[String], rsv: &Reservation, use_group: bool) -> bool {
    list.iter().any(|entry| {
        entry == &rsv.name
            || entry == ALL
            || (entry == ALL_JOB && rsv.kind.is_job())
            || (use_group && rsv.group.as_deref() == Some(entry.as_str()))
    })
}

/// Decides whether `ctx.job` may use the resources of `rsv`.
pub fn check_job_access(rsv: &Reservation, ctx: &AccessContext<'_>) -> RsvAccess {
    let job = ctx.job;

    if let Some(max) = rsv.max_jobs {
        if ctx.jobs_in_rsv >= max {
            return RsvAccess::deny(format!(
                "reservation {} already holds its maximum of {} jobs",
                rsv.name, max
            ));
        }
    }

    if list_matches(&job.rsv_exclude, rsv, true) {
        return RsvAccess {
            granted: false,
            affinity: Affinity::Negative,
            reason: format!("job {} excludes reservation {}", job.name, rsv.name),
        };
    }

    if job.flags.ignore_rsv {
        return RsvAccess::grant(Affinity::Positive, "job ignores reservations");
    }
    if job.flags.ignore_job_rsv && rsv.kind.is_job() {
        return RsvAccess::grant(Affinity::Positive, "job ignores job reservations");
    }

    if rsv.flags.allow_all && !rsv.flags.allow_sandbox_only {
        return RsvAccess::grant(Affinity::Neutral, format!("reservation {} allows all jobs", rsv.name));
    }

    if list_matches(&job.rsv_access, rsv, !rsv.flags.exclude_my_group) {
        return RsvAccess::grant(
            Affinity::Positive,
            format!("job {} has explicit access to reservation {}", job.name, rsv.name),
        );
    }

    if ctx.handle.is_some() && ctx.handle == rsv.job {
        return RsvAccess::grant(Affinity::Positive, format!("job owns reservation {}", rsv.name));
    }

    if job.flags.ignore_idle_job_rsv
        && rsv.kind.is_job()
        && !ctx.owner_active
        && !rsv.flags.preempting
    {
        return RsvAccess::grant(
            Affinity::Neutral,
            format!("job ignores idle job reservation {}", rsv.name),
        );
    }

    if rsv.kind.is_job() && !rsv.flags.allow_grid {
        return RsvAccess::deny(format!(
            "reservation {} is held exclusively by job {}",
            rsv.name,
            rsv.job_name.as_deref().unwrap_or("?")
        ));
    }

    if rsv.flags.by_name_only || rsv.flags.allow_sandbox_only {
        return RsvAccess::deny(format!("reservation {} requires access by name", rsv.name));
    }

    if let Some(required) = &job.required_rsv {
        if required != &rsv.name && rsv.group.as_deref() != Some(required.as_str()) {
            return RsvAccess::deny(format!(
                "job requires reservation {} (not {})",
                required, rsv.name
            ));
        }
    }

    if ctx.creds.is_empty() {
        return RsvAccess::deny(format!("job {} has no credentials", job.name));
    }

    if rsv.acl.matches(ctx.creds) {
        return RsvAccess::grant(
            Affinity::Positive,
            format!("credentials match reservation {} ACL", rsv.name),
        );
    }

    if rsv.flags.allow_job_overlap && rsv.start > ctx.now {
        return RsvAccess::grant(
            Affinity::Neutral,
            format!("reservation {} allows overlap before start", rsv.name),
        );
    }

    RsvAccess::deny(format!(
        "no ACL match for job {} in reservation {}",
        job.name, rsv.name
    ))
}

/// Whether two reservations may share resources.
pub fn check_rsv_access(a: &Reservation, b: &Reservation) -> bool {
    if a.flags.exclude_all || b.flags.exclude_all {
        return false;
    }
    if a.kind.is_job() && b.kind.is_job() && (a.flags.exclude_jobs || b.flags.exclude_jobs) {
        return false;
    }
    if a.flags.allow_sandbox_only || b.flags.allow_sandbox_only {
        return false;
    }
    if a.kind == RsvKind::ActiveJob && b.kind == RsvKind::ActiveJob {
        return false;
    }
    a.acl.intersects(&b.acl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Acl, CredStore, JobCredentials};
    use batchd_id::Handle;
    use rstest::rstest;

    fn rsv() -> Reservation {
        let mut r = Reservation::new("maint", RsvKind::User, 100, 200);
        r.acl = Acl::new().allow(CredKind::User, "alice");
        r
    }

    fn job(name: &str, user: &str) -> (Job, Vec<(CredKind, String)>) {
        let mut store = CredStore::new();
        let j = Job::new(name, JobCredentials::for_user(&mut store, user));
        let creds = vec![(CredKind::User, user.to_string()), (CredKind::Job, name.to_string())];
        (j, creds)
    }

    fn ctx<'a>(job: &'a Job, creds: &'a [(CredKind, String)]) -> AccessContext<'a> {
        AccessContext {
            job,
            handle: None,
            creds,
            jobs_in_rsv: 0,
            owner_active: false,
            now: 0,
        }
    }

    #[test]
    fn test_acl_grants_and_denies_with_reason() {
        let r = rsv();
        let (alice, alice_creds) = job("j1", "alice");
        let granted = check_job_access(&r, &ctx(&alice, &alice_creds));
        assert!(granted.granted);
        assert_eq!(granted.affinity, Affinity::Positive);

        let (bob, bob_creds) = job("j2", "bob");
        let denied = check_job_access(&r, &ctx(&bob, &bob_creds));
        assert!(!denied.granted);
        assert!(!denied.reason.is_empty());
        assert!(denied.reason.contains("j2"));
    }

    #[rstest]
    #[case("maint")]
    #[case("ALL")]
    fn test_exclude_list_wins_over_acl(#[case] entry: &str) {
        let r = rsv();
        let (mut alice, creds) = job("j1", "alice");
        alice.rsv_exclude.push(entry.to_string());
        let out = check_job_access(&r, &ctx(&alice, &creds));
        assert!(!out.granted);
        assert_eq!(out.affinity, Affinity::Negative);
    }

    #[test]
    fn test_overrides_and_allow_list() {
        let r = rsv();
        let (mut bob, creds) = job("j2", "bob");
        bob.rsv_access.push("maint".into());
        assert!(check_job_access(&r, &ctx(&bob, &creds)).granted);

        let (mut bob, creds) = job("j2", "bob");
        bob.flags.ignore_rsv = true;
        assert!(check_job_access(&r, &ctx(&bob, &creds)).granted);
    }

    #[test]
    fn test_job_reservations_are_exclusive() {
        let owner = JobHandle::from_parts(0, 0);
        let r = Reservation::new("j9", RsvKind::PriorityJob, 100, 200).for_job(owner, "j9");
        let (other, creds) = job("j2", "alice");
        let denied = check_job_access(&r, &ctx(&other, &creds));
        assert!(!denied.granted);
        assert!(denied.reason.contains("j9"));

        let mut own_ctx = ctx(&other, &creds);
        own_ctx.handle = Some(owner);
        assert!(check_job_access(&r, &own_ctx).granted);

        let (mut idle_skipper, creds) = job("j3", "alice");
        idle_skipper.flags.ignore_idle_job_rsv = true;
        assert!(check_job_access(&r, &ctx(&idle_skipper, &creds)).granted);
        let mut active = ctx(&idle_skipper, &creds);
        active.owner_active = true;
        assert!(!check_job_access(&r, &active).granted);
    }

    #[test]
    fn test_overlap_exception_before_start() {
        let mut r = rsv();
        r.flags.allow_job_overlap = true;
        let (bob, creds) = job("j2", "bob");
        assert!(check_job_access(&r, &ctx(&bob, &creds)).granted);
        let mut late = ctx(&bob, &creds);
        late.now = 150;
        assert!(!check_job_access(&r, &late).granted);
    }

    #[test]
    fn test_max_jobs_and_by_name() {
        let mut r = rsv();
        r.max_jobs = Some(1);
        let (alice, creds) = job("j1", "alice");
        let mut full = ctx(&alice, &creds);
        full.jobs_in_rsv = 1;
        assert!(!check_job_access(&r, &full).granted);

        let mut r = rsv();
        r.flags.by_name_only = true;
        assert!(!check_job_access(&r, &ctx(&alice, &creds)).granted);
    }

    #[test]
    fn test_rsv_to_rsv_access() {
        let a = rsv();
        let mut b = rsv();
        assert!(check_rsv_access(&a, &b));
        b.flags.exclude_all = true;
        assert!(!check_rsv_access(&a, &b));
        let mut c = rsv();
        c.acl = Acl::new().allow(CredKind::User, "bob");
        assert!(!check_rsv_access(&a, &c));
    }
}
