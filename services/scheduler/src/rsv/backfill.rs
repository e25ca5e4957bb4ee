//! Backfill windows.
//!
//! A window is a `(duration, procs)` pair: `procs` processors are free now
//! and stay free for at least `duration` seconds before some reservation
//! claims them. Windows only pre-filter and order candidates; every
//! backfill start is still planned against the full reservation table.

use std::collections::BTreeSet;

use batchd_id::{JobHandle, NodeHandle};

use super::RsvKind;
use crate::config::{BackfillMetric, BackfillPolicy};
use crate::state::SchedState;

/// Duration of a window that no reservation closes.
pub const UNBOUNDED_WINDOW: i64 = i64::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillWindow {
    pub duration: i64,
    pub procs: i64,
    pub nodes: Vec<NodeHandle>,
}

impl BackfillWindow {
    pub fn fits(&self, procs: i64, walltime: i64) -> bool {
        procs <= self.procs && walltime <= self.duration
    }
}

/// Free processors on each schedulable node of `partition` and how long
/// they stay free.
fn node_gaps(state: &SchedState, partition: &str, now: i64) -> Vec<(NodeHandle, i64, i64)> {
    let mut out = Vec::new();
    for nh in state.nodes.in_partition(partition) {
        let Some(node) = state.nodes.get(nh) else {
            continue;
        };
        if !node.state.is_schedulable() {
            continue;
        }
        let mut free = node.ares.procs;
        let mut until = UNBOUNDED_WINDOW;
        for rh in &node.rsv_refs {
            let Some(rsv) = state.rsvs.get(*rh) else {
                continue;
            };
            if rsv.kind == RsvKind::ActiveJob || rsv.end <= now {
                continue;
            }
            if rsv.start <= now {
                free -= rsv.claim_on(nh).map_or(0, |c| c.res.procs);
            } else {
                until = until.min(rsv.start);
            }
        }
        if free > 0 {
            let duration = if until == UNBOUNDED_WINDOW { until } else { until - now };
            out.push((nh, free, duration));
        }
    }
    out
}

/// Backfill windows of `partition`, longest first.
///
/// Each distinct node gap length yields one window summing the free
/// processors of every node whose gap is at least that long.
pub fn backfill_windows(state: &SchedState, partition: &str, now: i64) -> Vec<BackfillWindow> {
    let gaps = node_gaps(state, partition, now);
    let durations: BTreeSet<i64> = gaps.iter().map(|(_, _, d)| *d).collect();

    durations
        .into_iter()
        .rev()
        .map(|duration| {
            let members: Vec<_> = gaps.iter().filter(|(_, _, d)| *d >= duration).collect();
            BackfillWindow {
                duration,
                procs: members.iter().map(|(_, p, _)| *p).sum(),
                nodes: members.iter().map(|(n, _, _)| *n).collect(),
            }
        })
        .collect()
}

/// Orders backfill candidates (given in priority order).
///
/// Jobs that fit no window are dropped. First-fit keeps priority order;
/// best-fit sorts by the configured metric, largest first, ties keeping
/// priority order.
pub fn order_backfill_candidates(
    state: &SchedState,
    candidates: &[JobHandle],
    windows: &[BackfillWindow],
    policy: BackfillPolicy,
    metric: BackfillMetric,
) -> Vec<JobHandle> {
    if policy == BackfillPolicy::None {
        return Vec::new();
    }
    let mut fitting: Vec<(JobHandle, i64)> = candidates
        .iter()
        .filter_map(|h| {
            let job = state.jobs.get(*h)?;
            let procs = job.requested_procs();
            let walltime = job.walltime.max(1);
            windows.iter().any(|w| w.fits(procs, walltime)).then(|| {
                let score = match metric {
                    BackfillMetric::Procs => procs,
                    BackfillMetric::Walltime => walltime,
                    BackfillMetric::ProcSeconds => procs.saturating_mul(walltime),
                };
                (*h, score)
            })
        })
        .collect();
    if policy == BackfillPolicy::BestFit {
        fitting.sort_by(|a, b| b.1.cmp(&a.1));
    }
    fitting.into_iter().map(|(h, _)| h).collect()
}
