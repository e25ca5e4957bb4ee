//! Node capacity, availability and operational state.
//!
//! A node tracks three resource vectors:
//! - `cres`: configured capacity after overcommit scaling (`base` holds the
//!   real, unscaled amounts)
//! - `dres`: resources dedicated to active allocations
//! - `ares`: what is available right now, derived once per iteration by
//!   [`Node::adjust_available_resources`] and kept in step by allocation
//!   commit and release
//!
//! # Invariants
//!
//! - `ares <= cres` and `dres <= cres` per dimension after every adjustment
//! - A node references reservations but never owns them

use std::collections::{BTreeMap, BTreeSet, HashMap};

use batchd_id::{Arena, Handle, NodeHandle, RsvHandle};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::resources::{RejectReason, ResourceDim, Resources, UNBOUNDED_TASKS, WHOLE};

/// Node operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    None,
    Down,
    Idle,
    Busy,
    Active,
    Drained,
    Draining,
    Flush,
    Reserved,
    Unknown,
    Up,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Down => "down",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Active => "active",
            Self::Drained => "drained",
            Self::Draining => "draining",
            Self::Flush => "flush",
            Self::Reserved => "reserved",
            Self::Unknown => "unknown",
            Self::Up => "up",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "down" => Some(Self::Down),
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "active" | "running" => Some(Self::Active),
            "drained" => Some(Self::Drained),
            "draining" => Some(Self::Draining),
            "flush" => Some(Self::Flush),
            "reserved" => Some(Self::Reserved),
            "unknown" => Some(Self::Unknown),
            "up" => Some(Self::Up),
            _ => None,
        }
    }

    /// States in which processors count as available.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Idle | Self::Active | Self::Unknown | Self::Up)
    }

    /// States that rule a node out even for future windows.
    pub fn is_out_of_service(&self) -> bool {
        matches!(
            self,
            Self::None | Self::Down | Self::Drained | Self::Draining | Self::Flush
        )
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How available resources are accounted for one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// Observed utilization (load, reported free memory) governs.
    Utilized,
    /// Scheduler-dedicated amounts govern.
    Dedicated,
    /// The more pessimistic of the two.
    #[default]
    Combined,
    /// Configured capacity, ignoring usage.
    None,
}

impl Availability {
    fn uses_dedicated(&self) -> bool {
        matches!(self, Self::Dedicated | Self::Combined)
    }
}

/// Availability accounting, with optional per-dimension overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityPolicy {
    pub default: Availability,
    pub per_dim: BTreeMap<ResourceDim, Availability>,
}

impl AvailabilityPolicy {
    pub fn uniform(policy: Availability) -> Self {
        Self {
            default: policy,
            per_dim: BTreeMap::new(),
        }
    }

    pub fn for_dim(&self, dim: ResourceDim) -> Availability {
        self.per_dim.get(&dim).copied().unwrap_or(self.default)
    }
}

/// A named filesystem exposed by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filesystem {
    pub name: String,
    pub configured: i64,
    pub available: i64,
}

/// One schedulable node.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub partition: String,
    /// Arena slot index, stable for the life of the node.
    pub index: u32,

    pub state: NodeState,
    pub expected_state: NodeState,

    /// Real capacity before overcommit scaling.
    pub base: Resources,
    pub cres: Resources,
    pub dres: Resources,
    pub ares: Resources,
    /// Free amounts last reported by the resource manager.
    pub observed: Resources,

    pub filesystems: Vec<Filesystem>,
    pub load: f64,
    pub max_load: Option<f64>,
    pub overcommit_threshold: Option<f64>,
    pub features: BTreeSet<String>,
    pub arch: Option<String>,
    pub os: Option<String>,
    pub is_vm: bool,
    pub speed: f64,

    pub rsv_refs: BTreeSet<RsvHandle>,
    pub last_update: i64,
}

impl Node {
    /// New idle node with `configured` capacity and nothing in use.
    pub fn new(name: impl Into<String>, partition: impl Into<String>, configured: Resources) -> Self {
        Self {
            name: name.into(),
            partition: partition.into(),
            index: 0,
            state: NodeState::Idle,
            expected_state: NodeState::Idle,
            base: configured.clone(),
            cres: configured.clone(),
            dres: Resources::default(),
            ares: configured.clone(),
            observed: configured,
            filesystems: Vec::new(),
            load: 0.0,
            max_load: None,
            overcommit_threshold: None,
            features: BTreeSet::new(),
            arch: None,
            os: None,
            is_vm: false,
            speed: 1.0,
            rsv_refs: BTreeSet::new(),
            last_update: 0,
        }
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features = features.into_iter().map(Into::into).collect();
        self
    }

    /// Configured and available disk, resolved per filesystem when present.
    fn disk(&self) -> (i64, i64) {
        if self.filesystems.is_empty() {
            return (self.cres.disk, self.ares.disk);
        }
        let cfg = self.filesystems.iter().map(|f| f.configured).max().unwrap_or(0);
        let avail = self.filesystems.iter().map(|f| f.available).max().unwrap_or(0);
        (cfg, avail)
    }

    /// Number of tasks of shape `request` the node can host as of `as_of`.
    ///
    /// Utilization and dedication accounting only apply when
    /// `as_of <= now`; later windows see configured capacity. Returns the
    /// first dimension that came up short alongside a zero count.
    pub fn available_task_count(
        &self,
        request: &Resources,
        as_of: i64,
        now: i64,
        min_tc: u32,
        policy: &AvailabilityPolicy,
    ) -> (u32, RejectReason) {
        let apply = as_of <= now;
        let mut tc = i64::from(UNBOUNDED_TASKS);
        let (disk_cfg, disk_avail) = self.disk();

        for dim in ResourceDim::ALL {
            let req = request.get(dim);
            if req == 0 {
                continue;
            }

            let (cfg, utilized) = match dim {
                ResourceDim::Disk => (disk_cfg, disk_avail),
                _ => (self.cres.get(dim), self.ares.get(dim)),
            };
            if req != WHOLE && cfg < req {
                return (0, dim.reject_reason());
            }

            let mode = if apply { policy.for_dim(dim) } else { Availability::None };
            let dedicated = self.dres.get(dim);

            let dim_tc = if req == WHOLE {
                let free = cfg > 0
                    && match mode {
                        Availability::Utilized => utilized >= cfg,
                        Availability::Dedicated => dedicated == 0,
                        Availability::Combined => utilized >= cfg && dedicated == 0,
                        Availability::None => true,
                    };
                i64::from(free)
            } else {
                let avail = match mode {
                    Availability::Utilized => utilized,
                    Availability::Dedicated => cfg - dedicated,
                    Availability::Combined => utilized.min(cfg - dedicated),
                    Availability::None => cfg,
                };
                avail.max(0) / req
            };

            tc = tc.min(dim_tc);
            if tc == 0 || tc < i64::from(min_tc) {
                return (0, dim.reject_reason());
            }
        }

        for (name, req) in &request.gres {
            if *req == 0 {
                continue;
            }
            let cfg = self.cres.gres(name);
            if *req != WHOLE && cfg < *req {
                return (0, RejectReason::GenericResource);
            }
            let avail = if !apply {
                cfg
            } else if policy.default.uses_dedicated() {
                cfg - self.dres.gres(name)
            } else if policy.default == Availability::Utilized {
                self.ares.gres(name)
            } else {
                cfg
            };
            let dim_tc = if *req == WHOLE {
                i64::from(cfg > 0 && avail >= cfg)
            } else {
                avail.max(0) / req
            };
            tc = tc.min(dim_tc);
            if tc == 0 || tc < i64::from(min_tc) {
                return (0, RejectReason::GenericResource);
            }
        }

        (tc as u32, RejectReason::None)
    }

    /// Recomputes `ares` from configured, dedicated and observed amounts and
    /// derives the operational state.
    ///
    /// Returns `(old, new)` when the state changed.
    pub fn adjust_available_resources(
        &mut self,
        policy: &AvailabilityPolicy,
        default_max_load: Option<f64>,
    ) -> Option<(NodeState, NodeState)> {
        let old = self.state;
        let base = self.cres.procs;
        let load = self.load.round() as i64;

        let procs_mode = policy.for_dim(ResourceDim::Procs);
        self.ares.procs = if !self.state.is_schedulable() {
            0
        } else {
            match procs_mode {
                Availability::Combined => (self.cres.procs - self.dres.procs).min(base - load).max(0),
                Availability::Utilized => (base - load).max(0),
                Availability::Dedicated => self.cres.procs - self.dres.procs,
                Availability::None => self.cres.procs,
            }
        };

        if let Some(threshold) = self.overcommit_threshold {
            if self.base.procs > 0 && self.load / self.base.procs as f64 >= threshold {
                self.ares.procs = 0;
            }
        }

        for dim in [ResourceDim::Mem, ResourceDim::Swap, ResourceDim::Disk] {
            let cfg = self.cres.get(dim);
            let free = cfg - self.dres.get(dim);
            let observed = self.observed.get(dim);
            *self.ares.get_mut(dim) = match policy.for_dim(dim) {
                Availability::Utilized => observed,
                Availability::Dedicated => free,
                Availability::Combined => observed.min(free),
                Availability::None => cfg,
            };
        }

        let gres: Vec<(String, i64)> = self
            .cres
            .gres
            .iter()
            .map(|(name, cfg)| (name.clone(), cfg - self.dres.gres(name)))
            .collect();
        self.ares.gres = gres.into_iter().collect();
        let cap = self.cres.clone();
        self.ares.clamp_to(&cap);

        // Derive the pessimistic state.
        if procs_mode.uses_dedicated() {
            let dprocs = self.dres.procs;
            let busy_by_ded = (self.state == NodeState::Idle && dprocs > 0)
                || (self.state == NodeState::Active && dprocs >= self.cres.procs);
            if busy_by_ded {
                self.state = if dprocs >= self.cres.procs && self.cres.procs > 0 {
                    NodeState::Busy
                } else {
                    NodeState::Active
                };
            }
        }

        if let Some(max_load) = self.max_load.or(default_max_load) {
            if max_load > 0.0 && self.load >= max_load && self.state.is_schedulable() {
                self.state = NodeState::Busy;
            }
        }

        if matches!(self.state, NodeState::Unknown | NodeState::Up) {
            self.state = if self.ares.procs == base {
                NodeState::Idle
            } else if self.ares.procs <= 0 {
                NodeState::Busy
            } else {
                NodeState::Active
            };
        }

        if self.state == NodeState::Idle && self.dres.procs > 0 {
            self.state = NodeState::Active;
        }

        if old != self.state {
            debug!(node = %self.name, old = %old, new = %self.state, "node state derived");
            Some((old, self.state))
        } else {
            None
        }
    }

    /// Scales configured capacity from the real base amounts.
    ///
    /// Virtual machines are never overcommitted.
    pub fn apply_overcommit(&mut self, factors: &BTreeMap<ResourceDim, f64>) {
        self.cres = self.base.clone();
        if self.is_vm {
            return;
        }
        for (dim, factor) in factors {
            if *factor > 0.0 {
                let scaled = (self.base.get(*dim) as f64 * factor).round() as i64;
                *self.cres.get_mut(*dim) = scaled;
            }
        }
    }

    /// Dedicates `res` to an allocation.
    pub fn dedicate(&mut self, res: &Resources) {
        self.dres.add(res);
        self.ares.saturating_sub(res);
    }

    /// Reverses [`Node::dedicate`].
    pub fn release(&mut self, res: &Resources) {
        self.dres.saturating_sub(res);
        self.ares.add(res);
        let cap = self.cres.clone();
        self.ares.clamp_to(&cap);
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }
}

/// Node storage keyed by name.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: Arena<NodeHandle, Node>,
    by_name: HashMap<String, NodeHandle>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a node, replacing any node with the same name.
    pub fn insert(&mut self, mut node: Node) -> NodeHandle {
        if let Some(existing) = self.by_name.get(&node.name).copied() {
            if let Some(slot) = self.nodes.get_mut(existing) {
                node.index = existing.index();
                node.rsv_refs = std::mem::take(&mut slot.rsv_refs);
                *slot = node;
                return existing;
            }
        }
        let name = node.name.clone();
        let handle = self.nodes.insert_with(|h| {
            node.index = h.index();
            node
        });
        self.by_name.insert(name, handle);
        handle
    }

    pub fn find(&self, name: &str) -> Option<NodeHandle> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, handle: NodeHandle) -> Option<&Node> {
        self.nodes.get(handle)
    }

    pub fn get_mut(&mut self, handle: NodeHandle) -> Option<&mut Node> {
        self.nodes.get_mut(handle)
    }

    pub fn by_name(&self, name: &str) -> Option<&Node> {
        self.find(name).and_then(|h| self.nodes.get(h))
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeHandle, &Node)> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (NodeHandle, &mut Node)> {
        self.nodes.iter_mut()
    }

    pub fn handles(&self) -> Vec<NodeHandle> {
        self.nodes.handles()
    }

    /// Handles of nodes in `partition`, in index order.
    pub fn in_partition(&self, partition: &str) -> Vec<NodeHandle> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.partition == partition)
            .map(|(h, _)| h)
            .collect()
    }

    pub fn name_of(&self, handle: NodeHandle) -> String {
        self.nodes
            .get(handle)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| handle.to_string())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Removes nodes not reported since `now - purge_time` that hold no
    /// dedicated resources. Returns the purged names.
    pub fn purge_stale(&mut self, now: i64, purge_time: i64) -> Vec<String> {
        let purged = self
            .nodes
            .retain(|_, n| n.last_update + purge_time >= now || !n.dres.is_empty());
        let names: Vec<String> = purged.into_iter().map(|n| n.name).collect();
        for name in &names {
            self.by_name.remove(name);
        }
        names
    }
}
