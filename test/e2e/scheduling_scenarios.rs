//! End-to-end scheduling scenarios.
//!
//! Each test drives the scheduler through the public library API against
//! the in-memory resource manager, the same way the daemon does:
//!
//! 1. A job fills a node and the allocation is accounted
//! 2. A blocked job waits on a priority reservation and starts when it matures
//! 3. A task geometry spreads tasks over nodes, and a duplicated task is refused
//! 4. A start the resource manager silently dropped is rejected and deferred
//!
//! ## Running
//!
//! ```bash
//! cargo test -p batchd-e2e --test scheduling_scenarios
//! ```

use std::sync::Arc;

use batchd_events::{EventKind, MemoryEventSink};
use batchd_scheduler::alloc::{parse_geometry, GeometryError, GeometryLimits};
use batchd_scheduler::config::SchedPolicy;
use batchd_scheduler::model::{HoldKind, Job, JobState, Node, Resources};
use batchd_scheduler::policy::WeightedPolicyEngine;
use batchd_scheduler::rm::{JobSpec, MockResourceManager, NodeSnapshot};
use batchd_scheduler::rsv::RsvKind;
use batchd_scheduler::{SchedState, SchedulingCycle};

struct Cluster {
    rm: Arc<MockResourceManager>,
    sink: Arc<MemoryEventSink>,
    cycle: SchedulingCycle,
}

impl Cluster {
    async fn new(policy: SchedPolicy, nodes: &[(&str, i64)]) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,batchd_scheduler=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let rm = Arc::new(MockResourceManager::new());
        for (name, procs) in nodes {
            rm.add_node(NodeSnapshot::new(*name, "batch", Resources::new(*procs, 8192)))
                .await;
        }
        let sink = Arc::new(MemoryEventSink::new());
        let engine = WeightedPolicyEngine::new(policy.weights.clone(), policy.user_limits.clone());
        let cycle = SchedulingCycle::new(
            SchedState::new(policy),
            rm.clone(),
            sink.clone(),
            Box::new(engine),
        );
        Self { rm, sink, cycle }
    }

    fn job(&self, name: &str) -> &Job {
        self.cycle
            .state()
            .jobs
            .by_name(name)
            .unwrap_or_else(|| panic!("job {name} not tracked"))
    }

    fn node(&self, name: &str) -> &Node {
        self.cycle
            .state()
            .nodes
            .by_name(name)
            .unwrap_or_else(|| panic!("node {name} not tracked"))
    }
}

#[tokio::test]
async fn test_full_node_allocation_is_accounted() {
    let mut cluster = Cluster::new(SchedPolicy::default(), &[("n1", 4)]).await;

    // Discover the node before any work arrives.
    cluster.cycle.run_iteration(0).await;
    let policy = cluster.cycle.state().policy.node_availability_policy.clone();
    let (tasks, _) = cluster
        .node("n1")
        .available_task_count(&Resources::new(1, 0), 0, 0, 1, &policy);
    assert_eq!(tasks, 4);

    cluster.rm.submit(JobSpec::new("j1", "alice", 4, 1)).await;
    let stats = cluster.cycle.run_iteration(10).await;
    assert_eq!(stats.jobs_started, 1);

    let n1 = cluster.node("n1");
    assert_eq!(n1.dres.procs, 4);
    assert_eq!(n1.ares.procs, 0);
    assert_eq!(n1.cres.mem, 8192);

    // The resource manager now reports the job running; accounting holds.
    cluster.cycle.run_iteration(20).await;
    let n1 = cluster.node("n1");
    assert_eq!(n1.dres.procs, 4);
    assert_eq!(n1.ares.procs, 0);
    assert_eq!(cluster.job("j1").state, JobState::Running);
}

#[tokio::test]
async fn test_blocked_job_starts_when_reservation_matures() {
    let mut cluster = Cluster::new(SchedPolicy::default(), &[("n1", 4)]).await;
    cluster
        .rm
        .submit(JobSpec::new("j2", "alice", 4, 1).with_priority(100).with_walltime(100))
        .await;
    cluster
        .rm
        .submit(JobSpec::new("j3", "bob", 4, 1).with_priority(50).with_walltime(100))
        .await;

    let stats = cluster.cycle.run_iteration(0).await;
    assert_eq!(stats.jobs_started, 1);
    assert_eq!(cluster.job("j2").estate, JobState::Running);
    assert_eq!(cluster.job("j3").state, JobState::Idle);

    let rsv = cluster.cycle.state().rsvs.by_name("j3").expect("priority reservation");
    assert_eq!(rsv.kind, RsvKind::PriorityJob);
    assert!(rsv.start > 0);
    assert_eq!(rsv.start, 100);
    assert!(cluster
        .sink
        .of_kind(EventKind::RsvCreated)
        .iter()
        .any(|e| e.object_id == "j3"));

    cluster.rm.complete_job("j2", 100).await.unwrap();
    let stats = cluster.cycle.run_iteration(100).await;
    assert_eq!(stats.jobs_completed, 1);
    assert_eq!(stats.jobs_started, 1);

    let j3 = cluster.job("j3");
    assert_eq!(j3.estate, JobState::Running);
    assert_eq!(j3.start_time, 100);
    assert!(cluster.cycle.state().jobs.find_completed("j2").is_some());
    assert_eq!(cluster.node("n1").dres.procs, 4);
}

#[tokio::test]
async fn test_task_geometry_spreads_groups_over_nodes() {
    let mut cluster = Cluster::new(SchedPolicy::default(), &[("n1", 2), ("n2", 2)]).await;
    let mut spec = JobSpec::new("j4", "alice", 4, 1);
    spec.geometry = Some("{(0,1)(2,3)}".into());
    cluster.rm.submit(spec).await;

    let stats = cluster.cycle.run_iteration(0).await;
    assert_eq!(stats.jobs_started, 1);

    let tasks = cluster.job("j4").task_map.tasks();
    assert_eq!(tasks.len(), 4);
    assert_eq!(tasks[0], tasks[1]);
    assert_eq!(tasks[2], tasks[3]);
    assert_ne!(tasks[0], tasks[2]);
    assert_eq!(cluster.node("n1").dres.procs, 2);
    assert_eq!(cluster.node("n2").dres.procs, 2);

    let limits = GeometryLimits {
        task_count: 4,
        max_task_count: 4096,
        taskmap_size: 5,
    };
    assert_eq!(
        parse_geometry("{(0,1)(1,2)}", limits),
        Err(GeometryError::DoubleAssigned {
            task: 1,
            first: 0,
            second: 1
        })
    );
}

#[tokio::test]
async fn test_duplicated_task_geometry_is_rejected() {
    let mut cluster = Cluster::new(SchedPolicy::default(), &[("n1", 2), ("n2", 2)]).await;
    let mut spec = JobSpec::new("j4", "alice", 4, 1);
    spec.geometry = Some("{(0,1)(1,2)}".into());
    cluster.rm.submit(spec).await;

    let stats = cluster.cycle.run_iteration(0).await;
    assert_eq!(stats.jobs_started, 0);
    assert_eq!(stats.jobs_rejected, 1);
    let job = cluster.job("j4");
    assert_eq!(job.holds.active(0), Some(HoldKind::Batch));
    assert!(!job.has_live_allocation());
}

#[tokio::test]
async fn test_dropped_start_is_rejected_and_deferred() {
    let mut cluster = Cluster::new(SchedPolicy::default(), &[("n1", 4)]).await;
    cluster.rm.submit(JobSpec::new("j5", "alice", 2, 1)).await;

    let stats = cluster.cycle.run_iteration(100).await;
    assert_eq!(stats.jobs_started, 1);
    assert_eq!(cluster.job("j5").start_count, 1);

    // The resource manager forgets the start.
    cluster.rm.set_job_state("j5", JobState::Idle).await.unwrap();

    // Within the start grace period the scheduler keeps waiting.
    cluster.cycle.run_iteration(300).await;
    assert_eq!(cluster.job("j5").estate, JobState::Running);
    assert!(cluster.sink.of_kind(EventKind::JobRejected).is_empty());

    let max_delay = cluster.cycle.state().policy.max_job_start_delay;
    let defer_time = cluster.cycle.state().policy.defer_time;
    let now = 100 + max_delay + 1;
    let stats = cluster.cycle.run_iteration(now).await;
    assert_eq!(stats.jobs_started, 0);

    let job = cluster.job("j5");
    assert_eq!(job.estate, JobState::Idle);
    assert!(job.exclude_hosts.contains("n1"));
    assert_eq!(job.holds.defer_until, Some(now + defer_time * 2));
    assert_eq!(job.holds.active(now), Some(HoldKind::Defer));
    assert!(!job.has_live_allocation());
    assert_eq!(cluster.node("n1").dres.procs, 0);

    let events = cluster.sink.of_kind(EventKind::JobRejected);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].object_id, "j5");
    assert_eq!(events[0].payload["excluded_node"], "n1");
    assert_eq!(events[0].payload["defer_secs"], defer_time * 2);
    assert_eq!(events[0].payload["hostlist"], serde_json::json!(["n1"]));
}
