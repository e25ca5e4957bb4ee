//! Scheduler state repository.
//!
//! All tables the engines work on, owned in one place and passed by
//! reference into every phase of an iteration.

use batchd_id::{Iteration, JobHandle, NodeHandle};
use tracing::{debug, warn};

use crate::config::SchedPolicy;
use crate::model::{
    evaluate_for_partition, Class, CredKind, CredStore, Job, JobResult, JobTable, Node,
    NodeTable, Partition, PartitionTable, Qos,
};
use crate::rsv::RsvTable;

/// Everything one scheduling iteration reads and writes.
#[derive(Debug)]
pub struct SchedState {
    pub nodes: NodeTable,
    pub jobs: JobTable,
    pub rsvs: RsvTable,
    pub partitions: PartitionTable,
    pub creds: CredStore,
    pub policy: SchedPolicy,
    pub iteration: Iteration,
}

impl SchedState {
    /// Empty state with the policy's partitions and credentials defined.
    pub fn new(policy: SchedPolicy) -> Self {
        let mut state = Self {
            nodes: NodeTable::new(),
            jobs: JobTable::new(policy.completed_job_capacity, policy.job_max_task_count),
            rsvs: RsvTable::new(),
            partitions: PartitionTable::new(),
            creds: CredStore::new(),
            policy,
            iteration: Iteration::default(),
        };
        state.apply_policy_objects();
        state
    }

    fn apply_policy_objects(&mut self) {
        for cfg in &self.policy.partitions {
            let mut part = Partition::new(cfg.name.clone(), 0);
            part.shared_mem = cfg.shared_mem;
            part.rm_enabled = cfg.rm_enabled.unwrap_or(true);
            part.node_alloc_policy = cfg.node_alloc_policy.unwrap_or(self.policy.node_alloc_policy);
            part.distribution = cfg.distribution;
            part.qos_map = cfg.qos_map.clone();
            part.default_class = cfg.default_class.clone();
            if self.partitions.define(part).is_none() {
                warn!(partition = %cfg.name, "partition table full, partition ignored");
            }
        }
        for cfg in &self.policy.qos {
            self.creds.define_qos(Qos {
                name: cfg.name.clone(),
                priority: cfg.priority,
                flags: cfg.flags.clone(),
                rsv_bucket: cfg.rsv_bucket.clone(),
            });
        }
        for cfg in &self.policy.classes {
            self.creds.define_class(Class {
                name: cfg.name.clone(),
                priority: cfg.priority,
                cancel_on_fail: cfg.cancel_on_fail,
            });
        }
        for cfg in &self.policy.users {
            self.creds.define(CredKind::User, &cfg.name, cfg.priority);
        }
    }

    /// Adds or replaces a node, creating its partition on first sight.
    pub fn add_node(&mut self, mut node: Node) -> NodeHandle {
        if self.partitions.ensure(&node.partition).is_none() {
            warn!(node = %node.name, partition = %node.partition, "partition table full");
        }
        if node.overcommit_threshold.is_none() {
            node.overcommit_threshold = self.policy.overcommit_threshold;
        }
        node.apply_overcommit(&self.policy.node_overcommit_factor);
        let handle = self.nodes.insert(node);
        self.partitions.refresh_capacity(&self.nodes);
        handle
    }

    /// Queues a job, sizing its task map to the request.
    pub fn submit(&mut self, mut job: Job) -> JobResult<JobHandle> {
        let needed = job.request_tc() as usize + 1;
        if job.task_map.capacity() < needed && needed <= self.jobs.max_task_count() {
            job.task_map = crate::model::TaskMap::with_capacity(needed);
        }
        let name = job.name.clone();
        let handle = self.jobs.insert(job)?;
        debug!(job = %name, "job queued");
        Ok(handle)
    }

    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.find(name)
    }

    /// Credential list of `job` as seen in `partition`.
    pub fn cred_list(&self, job: &Job, partition: &Partition) -> Vec<(CredKind, String)> {
        evaluate_for_partition(&job.creds, partition, &self.creds).cred_list(&job.name)
    }

    /// Names of the nodes in `handles`.
    pub fn node_names(&self, handles: &[NodeHandle]) -> Vec<String> {
        handles.iter().map(|h| self.nodes.name_of(*h)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassConfig, PartitionConfig};
    use crate::model::{JobCredentials, Req, Resources};

    #[test]
    fn test_policy_objects_are_defined() {
        let policy = SchedPolicy {
            partitions: vec![PartitionConfig {
                name: "gpu".into(),
                shared_mem: true,
                ..Default::default()
            }],
            classes: vec![ClassConfig {
                name: "short".into(),
                priority: 5,
                cancel_on_fail: true,
            }],
            ..Default::default()
        };
        let state = SchedState::new(policy);
        assert!(state.partition("gpu").is_some_and(|p| p.shared_mem));
        assert!(state.creds.find_class("short").is_some_and(|c| c.cancel_on_fail));
    }

    #[test]
    fn test_add_node_refreshes_partition_capacity() {
        let mut state = SchedState::new(SchedPolicy::default());
        state.add_node(Node::new("n1", "batch", Resources::new(4, 0)));
        state.add_node(Node::new("n2", "batch", Resources::new(8, 0)));
        let part = state.partition("batch").unwrap();
        assert_eq!(part.config_procs, 12);
        assert_eq!(part.config_nodes, 2);
    }

    #[test]
    fn test_submit_sizes_task_map() {
        let mut state = SchedState::new(SchedPolicy::default());
        let creds = JobCredentials::for_user(&mut state.creds, "alice");
        let h = state
            .submit(Job::new("j1", creds).with_req(Req::new(6, Resources::new(1, 0))))
            .unwrap();
        assert_eq!(state.jobs.get(h).unwrap().task_map.capacity(), 7);
    }
}
