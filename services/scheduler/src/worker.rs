//! Scheduler background worker.
//!
//! Runs one scheduling iteration per poll interval until shutdown.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, instrument, warn};

use crate::cycle::SchedulingCycle;

/// Drives a [`SchedulingCycle`] on a fixed interval.
pub struct SchedulerWorker {
    cycle: SchedulingCycle,
    interval: Duration,
}

impl SchedulerWorker {
    pub fn new(cycle: SchedulingCycle, interval: Duration) -> Self {
        Self { cycle, interval }
    }

    pub fn cycle(&self) -> &SchedulingCycle {
        &self.cycle
    }

    /// Runs until shutdown is signaled. The first iteration starts
    /// immediately; an iteration that overruns delays the next one.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "starting scheduler worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.cycle.run_iteration(Utc::now().timestamp()).await;
                    if stats.rm_degraded {
                        warn!(iteration = stats.iteration, "iteration ran without resource manager");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
