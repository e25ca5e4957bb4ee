//! Task distribution over feasible nodes.
//!
//! One [`TaskDistributionStrategy`] per policy, chosen once per request by
//! [`select_strategy`]. Every strategy returns per-node task counts that
//! sum to the requested task count and never exceed a node's feasible
//! count, or fails.

use batchd_id::NodeHandle;

use super::feasible::Candidate;
use super::geometry::TaskGeometry;
use super::{AllocError, AllocResult, ReqShape};
use crate::model::{DistributionPolicy, NodeAlloc};

/// Placement of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    pub allocs: Vec<NodeAlloc>,
    /// Node of each task, in task id order.
    pub task_order: Vec<NodeHandle>,
}

impl Distribution {
    /// Lays tasks out node by node.
    pub fn from_allocs(allocs: Vec<NodeAlloc>) -> Self {
        let task_order = allocs
            .iter()
            .flat_map(|a| std::iter::repeat_n(a.node, a.task_count as usize))
            .collect();
        Self { allocs, task_order }
    }

    pub fn task_count(&self) -> u32 {
        self.allocs.iter().map(|a| a.task_count).sum()
    }
}

/// Places a request's tasks on feasible nodes.
pub trait TaskDistributionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn distribute(&self, candidates: &[Candidate], shape: &ReqShape) -> AllocResult<Distribution>;
}

/// Strategy for a request. Geometry overrides everything, then shared
/// memory partitions, then the distribution policy.
pub fn select_strategy<'a>(
    policy: DistributionPolicy,
    shared_mem: bool,
    geometry: Option<&'a TaskGeometry>,
) -> Box<dyn TaskDistributionStrategy + 'a> {
    match (geometry, shared_mem, policy) {
        (Some(g), _, _) => Box::new(ArbitraryGeometry(g)),
        (None, true, _) => Box::new(SharedMemory),
        (None, false, DistributionPolicy::RoundRobin) => Box::new(RoundRobin),
        (None, false, DistributionPolicy::Pack) => Box::new(Pack),
        (None, false, DistributionPolicy::Disperse) => Box::new(Disperse),
    }
}

fn unplaceable(strategy: &'static str, shape: &ReqShape, slots: &[(NodeHandle, u32)]) -> AllocError {
    AllocError::Unplaceable {
        strategy,
        requested: shape.task_count,
        available: slots.iter().map(|(_, n)| *n).sum(),
    }
}

/// Per-node capacity, pinned to the tasks-per-node constraint if any.
fn slots(candidates: &[Candidate], shape: &ReqShape) -> Vec<(NodeHandle, u32)> {
    candidates
        .iter()
        .filter(|c| shape.tasks_per_node == 0 || c.tasks >= shape.tasks_per_node)
        .map(|c| {
            let cap = if shape.tasks_per_node > 0 {
                shape.tasks_per_node
            } else {
                c.tasks
            };
            (c.node, cap)
        })
        .collect()
}

/// Exactly `nodes` nodes carrying `tasks` in total.
///
/// Balanced (equal counts, plus one on the first nodes) when that works
/// exactly, otherwise a greedy fill over the largest nodes that keeps one
/// task back for every node still to be chosen.
fn fixed_node_count(slots: &[(NodeHandle, u32)], tasks: u32, nodes: u32) -> Option<Vec<NodeAlloc>> {
    let nc = nodes as usize;
    if nodes == 0 || slots.len() < nc || tasks < nodes {
        return None;
    }

    let base = tasks / nodes;
    let mut extra = tasks % nodes;
    let mut allocs = Vec::with_capacity(nc);
    for (node, cap) in slots {
        if allocs.len() == nc {
            break;
        }
        let take = if extra > 0 && *cap > base {
            extra -= 1;
            base + 1
        } else if *cap >= base {
            base
        } else {
            continue;
        };
        allocs.push(NodeAlloc {
            node: *node,
            task_count: take,
        });
    }
    if allocs.len() == nc && extra == 0 {
        return Some(allocs);
    }

    let mut by_size = slots.to_vec();
    by_size.sort_by(|a, b| b.1.cmp(&a.1));
    allocs.clear();
    let mut remaining_tasks = tasks;
    let mut remaining_nodes = nodes;
    for (node, cap) in by_size {
        if remaining_nodes == 0 {
            break;
        }
        let max_tpn = 1 + remaining_tasks - remaining_nodes;
        let take = cap.min(max_tpn);
        if take == 0 {
            continue;
        }
        allocs.push(NodeAlloc {
            node,
            task_count: take,
        });
        remaining_tasks -= take;
        remaining_nodes -= 1;
    }
    (remaining_tasks == 0 && remaining_nodes == 0).then_some(allocs)
}

/// One task per node per pass, raising the per-node ceiling each pass.
fn fill_in_passes(slots: &[(NodeHandle, u32)], tasks: u32) -> Option<Vec<NodeAlloc>> {
    let mut counts = vec![0u32; slots.len()];
    let mut remaining = tasks;
    let ceiling = slots.iter().map(|(_, cap)| *cap).max().unwrap_or(0);
    let mut tpn = 1;
    while remaining > 0 && tpn <= ceiling {
        for (i, (_, cap)) in slots.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            if counts[i] < tpn && counts[i] < *cap {
                counts[i] += 1;
                remaining -= 1;
            }
        }
        tpn += 1;
    }
    if remaining > 0 {
        return None;
    }
    Some(
        slots
            .iter()
            .zip(counts)
            .filter(|(_, n)| *n > 0)
            .map(|((node, _), n)| NodeAlloc {
                node: *node,
                task_count: n,
            })
            .collect(),
    )
}

/// Spreads tasks evenly over the fewest leading nodes that can take them,
/// so counts step down by at most one (4,4,3,3 rather than 4,4,4,2).
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobin;

impl TaskDistributionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn distribute(&self, candidates: &[Candidate], shape: &ReqShape) -> AllocResult<Distribution> {
        let slots = slots(candidates, shape);
        if shape.node_count > 0 {
            return fixed_node_count(&slots, shape.task_count, shape.node_count)
                .map(Distribution::from_allocs)
                .ok_or_else(|| unplaceable(self.name(), shape, &slots));
        }

        let tasks = shape.task_count;
        let widest = slots.len().min(tasks as usize);
        for k in 1..=widest {
            let base = tasks / k as u32;
            let extra = tasks % k as u32;
            let share = |i: usize| base + u32::from((i as u32) < extra);
            if slots[..k].iter().enumerate().all(|(i, (_, cap))| *cap >= share(i)) {
                let allocs = slots[..k]
                    .iter()
                    .enumerate()
                    .map(|(i, (node, _))| NodeAlloc {
                        node: *node,
                        task_count: share(i),
                    })
                    .collect();
                return Ok(Distribution::from_allocs(allocs));
            }
        }

        fill_in_passes(&slots, tasks)
            .map(Distribution::from_allocs)
            .ok_or_else(|| unplaceable(self.name(), shape, &slots))
    }
}

/// Fills each node to capacity before moving on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pack;

impl TaskDistributionStrategy for Pack {
    fn name(&self) -> &'static str {
        "pack"
    }

    fn distribute(&self, candidates: &[Candidate], shape: &ReqShape) -> AllocResult<Distribution> {
        let slots = slots(candidates, shape);
        if shape.node_count > 0 {
            return fixed_node_count(&slots, shape.task_count, shape.node_count)
                .map(Distribution::from_allocs)
                .ok_or_else(|| unplaceable(self.name(), shape, &slots));
        }

        let mut remaining = shape.task_count;
        let mut allocs = Vec::new();
        for (node, cap) in &slots {
            if remaining == 0 {
                break;
            }
            let take = (*cap).min(remaining);
            allocs.push(NodeAlloc {
                node: *node,
                task_count: take,
            });
            remaining -= take;
        }
        if remaining > 0 {
            return Err(unplaceable(self.name(), shape, &slots));
        }
        Ok(Distribution::from_allocs(allocs))
    }
}

/// Touches as many nodes as possible: one more task per node per pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct Disperse;

impl TaskDistributionStrategy for Disperse {
    fn name(&self) -> &'static str {
        "disperse"
    }

    fn distribute(&self, candidates: &[Candidate], shape: &ReqShape) -> AllocResult<Distribution> {
        let slots = slots(candidates, shape);
        let allocs = if shape.node_count > 0 {
            fixed_node_count(&slots, shape.task_count, shape.node_count)
        } else {
            fill_in_passes(&slots, shape.task_count)
        };
        allocs
            .map(Distribution::from_allocs)
            .ok_or_else(|| unplaceable(self.name(), shape, &slots))
    }
}

/// Shared-memory partitions hand out whole node shares.
///
/// Several jobs share one node, so each node taken contributes its whole
/// memory share. Nodes are added until both the task count and the memory
/// requirement are covered, then the tasks are spread one per node first
/// and packed up to each node's feasible count.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedMemory;

impl TaskDistributionStrategy for SharedMemory {
    fn name(&self) -> &'static str {
        "shared_memory"
    }

    fn distribute(&self, candidates: &[Candidate], shape: &ReqShape) -> AllocResult<Distribution> {
        let mem_needed = shape.mem_per_task.max(0) * i64::from(shape.task_count);
        let mut capacity = 0u32;
        let mut mem = 0i64;
        let mut taken: Vec<&Candidate> = Vec::new();
        for c in candidates.iter().filter(|c| c.tasks > 0) {
            if capacity >= shape.task_count && mem >= mem_needed {
                break;
            }
            taken.push(c);
            capacity += c.tasks;
            mem += c.mem;
        }
        if capacity < shape.task_count || mem < mem_needed {
            let slots: Vec<_> = candidates.iter().map(|c| (c.node, c.tasks)).collect();
            return Err(unplaceable(self.name(), shape, &slots));
        }

        let mut counts = vec![0u32; taken.len()];
        let mut remaining = shape.task_count;
        for count in counts.iter_mut() {
            if remaining == 0 {
                break;
            }
            *count = 1;
            remaining -= 1;
        }
        for (count, c) in counts.iter_mut().zip(&taken) {
            let extra = (c.tasks - *count).min(remaining);
            *count += extra;
            remaining -= extra;
        }
        let allocs = taken
            .iter()
            .zip(counts)
            .filter(|(_, n)| *n > 0)
            .map(|(c, task_count)| NodeAlloc {
                node: c.node,
                task_count,
            })
            .collect();
        Ok(Distribution::from_allocs(allocs))
    }
}

/// Explicit task-to-node layout from the job's geometry string.
#[derive(Debug, Clone, Copy)]
pub struct ArbitraryGeometry<'a>(pub &'a TaskGeometry);

impl TaskDistributionStrategy for ArbitraryGeometry<'_> {
    fn name(&self) -> &'static str {
        "geometry"
    }

    fn distribute(&self, candidates: &[Candidate], _shape: &ReqShape) -> AllocResult<Distribution> {
        let slots: Vec<_> = candidates.iter().map(|c| (c.node, c.tasks)).collect();
        let (allocs, task_order) = self.0.place(&slots)?;
        Ok(Distribution { allocs, task_order })
    }
}
