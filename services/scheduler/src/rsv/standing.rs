//! Standing reservations.
//!
//! Each configured standing reservation is materialized for the current
//! period and the following `depth - 1` periods. Instances are named
//! `<name>.<period number>` so re-materializing is idempotent; finished
//! instances fall to [`super::expire_reservations`].

use tracing::{debug, warn};

use super::{Reservation, RsvKind, RsvNodeClaim};
use crate::config::StandingReservationConfig;
use crate::model::Resources;
use crate::state::SchedState;

fn claims(state: &SchedState, cfg: &StandingReservationConfig) -> Vec<RsvNodeClaim> {
    let mut out = Vec::with_capacity(cfg.nodes.len());
    for name in &cfg.nodes {
        let Some(nh) = state.nodes.find(name) else {
            warn!(rsv = %cfg.name, node = %name, "standing reservation names unknown node");
            continue;
        };
        let Some(node) = state.nodes.get(nh) else {
            continue;
        };
        let procs = node.cres.procs.max(0);
        let claim = if cfg.tasks_per_node == 0 {
            RsvNodeClaim {
                node: nh,
                task_count: procs as u32,
                res: node.cres.clone(),
            }
        } else {
            let tasks = i64::from(cfg.tasks_per_node).min(procs);
            RsvNodeClaim {
                node: nh,
                task_count: tasks as u32,
                res: Resources::new(tasks, 0),
            }
        };
        out.push(claim);
    }
    out
}

/// Creates missing standing reservation instances. Returns their names.
pub fn materialize_standing(state: &mut SchedState, now: i64) -> Vec<String> {
    let configs = state.policy.standing_reservations.clone();
    let mut created = Vec::new();

    for cfg in &configs {
        let period = cfg.period.seconds();
        let first = now.div_euclid(period);
        let node_claims = claims(state, cfg);

        for n in first..first + i64::from(cfg.depth.max(1)) {
            let start = n * period + cfg.start_offset;
            let end = start + cfg.duration.max(0);
            let name = format!("{}.{}", cfg.name, n);
            if end <= now || state.rsvs.find(&name).is_some() {
                continue;
            }
            let mut rsv = Reservation::new(name.clone(), RsvKind::Standing, start, end)
                .with_claims(node_claims.clone());
            rsv.group = Some(cfg.name.clone());
            rsv.acl = cfg.acl.clone();
            rsv.flags = cfg.flags.clone();
            rsv.created_at = now;
            match state.rsvs.create(rsv, &mut state.jobs, &mut state.nodes) {
                Ok(_) => {
                    debug!(rsv = %name, start, end, "standing reservation materialized");
                    created.push(name);
                }
                Err(e) => warn!(rsv = %name, error = %e, "standing reservation not created"),
            }
        }
    }
    created
}
