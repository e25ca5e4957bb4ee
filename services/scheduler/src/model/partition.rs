//! Partitions and partition access masks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::job::DistributionPolicy;
use super::node::NodeTable;

/// Maximum number of partitions a mask can address.
pub const MAX_PARTITIONS: u32 = 64;

/// Order in which feasible nodes are offered to task distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeAllocPolicy {
    /// Node index order.
    #[default]
    FirstAvailable,
    /// Smallest configured processor count first.
    MinResource,
    /// Most available task slots first.
    MaxAvailable,
}

/// A partition of the cluster.
#[derive(Debug, Clone)]
pub struct Partition {
    pub name: String,
    pub index: u32,
    /// Nodes are shared-memory (NUMA) systems hosting many jobs each.
    pub shared_mem: bool,
    /// Resource manager for this partition accepts starts.
    pub rm_enabled: bool,
    pub node_alloc_policy: NodeAllocPolicy,
    pub distribution: Option<DistributionPolicy>,
    /// Job QOS name -> QOS name used inside this partition.
    pub qos_map: BTreeMap<String, String>,
    pub default_class: Option<String>,
    /// Configured processors across member nodes, refreshed per iteration.
    pub config_procs: i64,
    pub config_nodes: u32,
}

impl Partition {
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
            shared_mem: false,
            rm_enabled: true,
            node_alloc_policy: NodeAllocPolicy::default(),
            distribution: None,
            qos_map: BTreeMap::new(),
            default_class: None,
            config_procs: 0,
            config_nodes: 0,
        }
    }
}

/// Bitmap of partitions a job may run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionMask(u64);

impl PartitionMask {
    pub fn all() -> Self {
        Self(u64::MAX)
    }

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn set(&mut self, index: u32) {
        if index < MAX_PARTITIONS {
            self.0 |= 1 << index;
        }
    }

    pub fn with(mut self, index: u32) -> Self {
        self.set(index);
        self
    }

    pub fn contains(&self, index: u32) -> bool {
        index < MAX_PARTITIONS && self.0 & (1 << index) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Partition registry.
#[derive(Debug, Default)]
pub struct PartitionTable {
    parts: Vec<Partition>,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `name`, registering a new partition when unknown.
    ///
    /// Returns `None` once [`MAX_PARTITIONS`] are registered.
    pub fn ensure(&mut self, name: &str) -> Option<u32> {
        if let Some(p) = self.find(name) {
            return Some(p.index);
        }
        let index = self.parts.len() as u32;
        if index >= MAX_PARTITIONS {
            return None;
        }
        self.parts.push(Partition::new(name, index));
        Some(index)
    }

    /// Registers a fully configured partition, keeping its index slot.
    pub fn define(&mut self, mut partition: Partition) -> Option<u32> {
        let index = self.ensure(&partition.name)?;
        partition.index = index;
        self.parts[index as usize] = partition;
        Some(index)
    }

    pub fn find(&self, name: &str) -> Option<&Partition> {
        self.parts.iter().find(|p| p.name == name)
    }

    pub fn get(&self, index: u32) -> Option<&Partition> {
        self.parts.get(index as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.parts.iter()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Mask for a list of partition names; an empty list means all.
    pub fn mask_for(&self, names: &[String]) -> PartitionMask {
        if names.is_empty() {
            return PartitionMask::all();
        }
        names
            .iter()
            .filter_map(|n| self.find(n))
            .fold(PartitionMask::empty(), |m, p| m.with(p.index))
    }

    /// Recomputes configured capacity totals from the node table.
    pub fn refresh_capacity(&mut self, nodes: &NodeTable) {
        for part in &mut self.parts {
            part.config_procs = 0;
            part.config_nodes = 0;
        }
        for (_, node) in nodes.iter() {
            if node.state.is_out_of_service() {
                continue;
            }
            if let Some(part) = self.parts.iter_mut().find(|p| p.name == node.partition) {
                part.config_procs += node.cres.procs;
                part.config_nodes += 1;
            }
        }
    }
}
