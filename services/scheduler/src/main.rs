//! batchd scheduler daemon
//!
//! Polls the resource manager every interval, runs a scheduling
//! iteration and checkpoints scheduler-owned state. Without a live
//! resource manager adapter the built-in simulated one is used, seeded
//! from `BATCHD_WORKLOAD_FILE` when set.

use std::sync::Arc;

use anyhow::Result;
use batchd_scheduler::config::Config;
use batchd_scheduler::rm::MockResourceManager;
use batchd_scheduler::sink::TracingEventSink;
use batchd_scheduler::{SchedulerWorker, SchedulingCycle};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        poll_interval_secs = config.poll_interval.as_secs(),
        rm_query_timeout_secs = config.rm_query_timeout.as_secs(),
        checkpoint = ?config.checkpoint_path,
        policy_file = ?config.policy_file,
        "starting batchd scheduler"
    );

    let rm = match &config.workload_file {
        Some(path) => MockResourceManager::from_workload_file(path)?,
        None => {
            warn!("no workload file configured, starting with an empty simulated cluster");
            MockResourceManager::new()
        }
    };
    let rm = Arc::new(rm.simulated());

    let cycle = SchedulingCycle::from_config(&config, rm, Arc::new(TracingEventSink))?;
    let mut worker = SchedulerWorker::new(cycle, config.poll_interval);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        result = &mut worker_handle => {
            if let Err(e) = result {
                error!(error = %e, "scheduler worker panicked");
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = worker_handle.await {
        error!(error = %e, "scheduler worker panicked");
    }

    info!("batchd scheduler shutdown complete");
    Ok(())
}
