//! Queue ordering and priority bookkeeping.

use std::cmp::Ordering;
use std::collections::HashSet;

use batchd_id::JobHandle;
use tracing::debug;

use super::engine::{PolicyContext, PolicyEngine, UsageSnapshot};
use crate::config::PriorityAccrual;
use crate::model::{evaluate_for_partition, CredStore, Job, JobState, JobTable, PartitionTable};

/// Version-aware string comparison compatible with glibc `strverscmp`.
///
/// Digit runs compare numerically, so `job9 < job10`. Runs with a leading
/// zero are fractional and sort before integral runs: `000 < 00 < 01 < 010
/// < 09 < 0 < 1 < 9 < 10`.
pub fn strverscmp(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();

    let mut i = 0;
    while i < a.len() && i < b.len() && a[i] == b[i] {
        i += 1;
    }
    if i == a.len() && i == b.len() {
        return Ordering::Equal;
    }

    let mut start = i;
    while start > 0 && a[start - 1].is_ascii_digit() {
        start -= 1;
    }

    let a_run = digit_run(a, start);
    let b_run = digit_run(b, start);
    if a_run.is_empty() || b_run.is_empty() {
        return a.get(i).cmp(&b.get(i));
    }

    let a_frac = a_run[0] == b'0';
    let b_frac = b_run[0] == b'0';
    let ord = match (a_frac, b_frac) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (true, true) => compare_fractional(a_run, b_run),
        (false, false) => a_run.len().cmp(&b_run.len()).then_with(|| a_run.cmp(b_run)),
    };

    ord.then_with(|| a.get(i).cmp(&b.get(i)))
}

fn digit_run(s: &[u8], start: usize) -> &[u8] {
    let end = s[start..]
        .iter()
        .position(|c| !c.is_ascii_digit())
        .map_or(s.len(), |p| start + p);
    &s[start..end]
}

fn compare_fractional(a: &[u8], b: &[u8]) -> Ordering {
    let common = a.len().min(b.len());
    match a[..common].cmp(&b[..common]) {
        Ordering::Equal if a.len() != b.len() => {
            if a[..common].iter().all(|c| *c == b'0') {
                b.len().cmp(&a.len())
            } else {
                a.len().cmp(&b.len())
            }
        }
        ord => ord,
    }
}

/// Start-priority order: priority descending, then array index within the
/// same array group, then version-aware name.
///
/// Array members are keyed by their group name so that the order stays
/// total when members and plain jobs tie on priority.
pub fn compare_start_priority(a: &Job, b: &Job, partition: Option<&str>) -> Ordering {
    let pa = partition.map_or(a.start_priority, |p| a.priority_in(p));
    let pb = partition.map_or(b.start_priority, |p| b.priority_in(p));

    let key = |j: &Job| match &j.array {
        Some(m) => (m.group.clone(), m.index),
        None => (j.name.clone(), 0),
    };
    let (ga, ia) = key(a);
    let (gb, ib) = key(b);

    pb.cmp(&pa)
        .then_with(|| strverscmp(&ga, &gb))
        .then_with(|| ia.cmp(&ib))
        .then_with(|| strverscmp(&a.name, &b.name))
}

/// Sorts `queue` by start priority. Stale handles sort last.
pub fn sort_queue(jobs: &JobTable, queue: &mut [JobHandle], partition: Option<&str>) {
    queue.sort_by(|x, y| match (jobs.get(*x), jobs.get(*y)) {
        (Some(a), Some(b)) => compare_start_priority(a, b, partition),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

/// Accrues effective queue time for idle jobs.
///
/// Jobs in `eligible` gain the time since their last accrual. Under
/// [`PriorityAccrual::Reset`] every other idle job drops back to zero.
pub fn accrue_queue_time(
    jobs: &mut JobTable,
    eligible: &HashSet<JobHandle>,
    now: i64,
    policy: PriorityAccrual,
) {
    for (handle, job) in jobs.iter_mut() {
        if job.state != JobState::Idle {
            job.accrued_at = None;
            continue;
        }
        if eligible.contains(&handle) {
            job.system_queue_time.get_or_insert(now);
            if let Some(last) = job.accrued_at {
                job.eff_queue_duration += (now - last).max(0);
            }
        } else if policy == PriorityAccrual::Reset {
            job.eff_queue_duration = 0;
        }
        job.accrued_at = Some(now);
    }
}

/// Recomputes per-partition and global start priorities of idle jobs.
///
/// The global priority is the best partition priority.
pub fn refresh_priorities(
    jobs: &mut JobTable,
    partitions: &PartitionTable,
    creds: &CredStore,
    engine: &dyn PolicyEngine,
    usage: &UsageSnapshot,
    now: i64,
) {
    let mut updates = Vec::new();
    for (handle, job) in jobs.iter() {
        if job.state != JobState::Idle {
            continue;
        }
        let mut per_part = Vec::new();
        for part in partitions.iter() {
            if !job.pal.contains(part.index) {
                continue;
            }
            let view = evaluate_for_partition(&job.creds, part, creds);
            let ctx = PolicyContext {
                job,
                view: &view,
                partition: part,
                usage,
                now,
            };
            per_part.push((part.name.clone(), engine.priority(&ctx)));
        }
        updates.push((handle, per_part));
    }

    let count = updates.len();
    for (handle, per_part) in updates {
        if let Some(job) = jobs.get_mut(handle) {
            if let Some(best) = per_part.iter().map(|(_, p)| *p).max() {
                job.start_priority = best;
            }
            job.partition_priority = per_part.into_iter().collect();
        }
    }
    debug!(jobs = count, "priorities refreshed");
}
