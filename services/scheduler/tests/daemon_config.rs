//! Integration tests for the daemon's file-driven setup.
//!
//! A policy file and a workload file are loaded the way the daemon loads
//! them, the scheduler runs against the simulated resource manager, and a
//! second scheduler on the same checkpoint picks up where the first left
//! off.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use batchd_events::{EventKind, MemoryEventSink};
use batchd_scheduler::config::{Config, SchedPolicy};
use batchd_scheduler::model::JobState;
use batchd_scheduler::rm::MockResourceManager;
use batchd_scheduler::rsv::RsvKind;
use batchd_scheduler::SchedulingCycle;

const NOW: i64 = 1_000_000;

const POLICY: &str = r#"
poll_interval = 60
reservation_policy = "current_highest"

[[standing_reservations]]
name = "maint"
period = "daily"
duration = 86400
nodes = ["n2"]
depth = 2
acl = { entries = [{ kind = "user", name = "ops" }] }
"#;

const WORKLOAD: &str = r#"
[[nodes]]
name = "n1"
configured = { procs = 4, mem = 8192 }

[[nodes]]
name = "n2"
configured = { procs = 4, mem = 8192 }

[[jobs]]
state = "idle"
prolog_pending = false
internally_requeued = false
nodes = []
[jobs.spec]
name = "wide"
user = "alice"
walltime = 600
[[jobs.spec.reqs]]
tasks = 8

[[jobs]]
state = "idle"
prolog_pending = false
internally_requeued = false
nodes = []
[jobs.spec]
name = "upgrade"
user = "ops"
walltime = 600
[[jobs.spec.reqs]]
tasks = 4
"#;

fn config(dir: &Path) -> Config {
    let policy_file = dir.join("policy.toml");
    let workload_file = dir.join("workload.toml");
    std::fs::write(&policy_file, POLICY).unwrap();
    std::fs::write(&workload_file, WORKLOAD).unwrap();
    Config {
        log_level: "debug".to_string(),
        poll_interval: Duration::from_secs(60),
        rm_query_timeout: Duration::from_secs(5),
        checkpoint_path: Some(dir.join("checkpoint.db")),
        policy: SchedPolicy::from_file(&policy_file).unwrap(),
        policy_file: Some(policy_file),
        workload_file: Some(workload_file),
    }
}

fn cycle(config: &Config, rm: Arc<MockResourceManager>) -> (SchedulingCycle, Arc<MemoryEventSink>) {
    let sink = Arc::new(MemoryEventSink::new());
    let cycle = SchedulingCycle::from_config(config, rm, sink.clone()).unwrap();
    (cycle, sink)
}

#[tokio::test]
async fn test_maintenance_window_blocks_wide_job() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let rm = Arc::new(
        MockResourceManager::from_workload_file(config.workload_file.as_deref().unwrap())
            .unwrap()
            .simulated(),
    );
    let (mut cycle, sink) = cycle(&config, rm);

    let stats = cycle.run_iteration(NOW).await;

    let state = cycle.state();
    let standing: Vec<&str> = state
        .rsvs
        .iter()
        .filter(|(_, r)| r.kind == RsvKind::Standing)
        .map(|(_, r)| r.name.as_str())
        .collect();
    assert_eq!(standing.len(), 2);
    assert!(standing.contains(&"maint.11"));
    assert!(standing.contains(&"maint.12"));

    assert_eq!(stats.jobs_started + stats.jobs_backfilled, 1);
    assert_eq!(state.jobs.by_name("upgrade").unwrap().estate, JobState::Running);
    let wide = state.jobs.by_name("wide").unwrap();
    assert_eq!(wide.state, JobState::Idle);
    assert!(!wide.has_live_allocation());
    assert_eq!(sink.of_kind(EventKind::RsvCreated).len() as u32, stats.rsvs_created);
}

#[tokio::test]
async fn test_restart_restores_checkpointed_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let rm = Arc::new(
        MockResourceManager::from_workload_file(config.workload_file.as_deref().unwrap())
            .unwrap()
            .simulated(),
    );

    {
        let (mut first, _) = cycle(&config, rm.clone());
        first.run_iteration(NOW).await;
        let wide = first.state().jobs.by_name("wide").unwrap();
        assert_eq!(wide.system_queue_time, Some(NOW));
    }

    let (mut second, sink) = cycle(&config, rm);
    second.run_iteration(NOW + 60).await;

    let state = second.state();
    let standing = state
        .rsvs
        .iter()
        .filter(|(_, r)| r.kind == RsvKind::Standing)
        .count();
    assert_eq!(standing, 2);
    // Restored instances are not materialized again.
    assert!(sink
        .of_kind(EventKind::RsvCreated)
        .iter()
        .all(|e| !e.object_id.starts_with("maint.")));

    let wide = state.jobs.by_name("wide").unwrap();
    assert_eq!(wide.system_queue_time, Some(NOW));
    // The running job is adopted, not started twice.
    let upgrade = state.jobs.by_name("upgrade").unwrap();
    assert_eq!(upgrade.state, JobState::Running);
    assert_eq!(upgrade.start_time, NOW);
}
