//! Daemon configuration and scheduling policy.
//!
//! Process settings come from `BATCHD_*` environment variables. Scheduling
//! policy lives in [`SchedPolicy`], optionally loaded from a TOML file named
//! by `BATCHD_POLICY_FILE`; every knob has a default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    Acl, AvailabilityPolicy, DistributionPolicy, NodeAllocPolicy, QosFlags, ResourceDim,
};
use crate::rsv::{RsvFlags, StandingPeriod};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid policy file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// =============================================================================
// Policy enums
// =============================================================================

/// Administrative rejection actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRejectPolicy {
    Hold,
    Cancel,
    Retry,
    Ignore,
    Notify,
}

/// Action when a deadline cannot be reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeadlinePolicy {
    Escalate,
    Retry,
    Ignore,
    Cancel,
    #[default]
    Hold,
}

/// Which blocked jobs receive priority reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReservationPolicy {
    Never,
    /// Reservations are kept once made, only refreshed when lost.
    HighestPriority,
    /// Reservations are recomputed every iteration.
    #[default]
    CurrentHighest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackfillPolicy {
    None,
    #[default]
    FirstFit,
    BestFit,
}

/// Metric maximized by best-fit backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackfillMetric {
    #[default]
    Procs,
    Walltime,
    ProcSeconds,
}

/// How preempted jobs give up their resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PreemptPolicy {
    #[default]
    Requeue,
    /// Suspended in place; resumed once the nodes free up.
    Suspend,
}

/// Queue-time accrual when a job drops out of eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriorityAccrual {
    #[default]
    Accrue,
    Reset,
}

// =============================================================================
// Object definitions
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    pub name: String,
    pub shared_mem: bool,
    pub rm_enabled: Option<bool>,
    pub node_alloc_policy: Option<NodeAllocPolicy>,
    pub distribution: Option<DistributionPolicy>,
    pub qos_map: BTreeMap<String, String>,
    pub default_class: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    pub name: String,
    pub priority: i64,
    pub flags: QosFlags,
    pub rsv_bucket: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassConfig {
    pub name: String,
    pub priority: i64,
    pub cancel_on_fail: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredConfig {
    pub name: String,
    pub priority: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StandingReservationConfig {
    pub name: String,
    pub period: StandingPeriod,
    /// Seconds from the start of each period.
    pub start_offset: i64,
    pub duration: i64,
    pub nodes: Vec<String>,
    /// Tasks claimed per node; zero claims the whole node.
    pub tasks_per_node: u32,
    pub acl: Acl,
    pub flags: RsvFlags,
    /// Number of future periods kept materialized.
    pub depth: u32,
}

impl Default for StandingReservationConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            period: StandingPeriod::Daily,
            start_offset: 0,
            duration: 3600,
            nodes: Vec::new(),
            tasks_per_node: 0,
            acl: Acl::default(),
            flags: RsvFlags::default(),
            depth: 2,
        }
    }
}

/// Weights for the default priority formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    /// Per minute of effective queue time.
    pub queue_time: i64,
    pub xfactor: i64,
    pub credential: i64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            queue_time: 1,
            xfactor: 0,
            credential: 1,
        }
    }
}

/// Per-user usage limits; `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserLimits {
    pub max_idle_jobs_soft: Option<u32>,
    pub max_idle_jobs_hard: Option<u32>,
    pub max_procs: Option<i64>,
}

// =============================================================================
// SchedPolicy
// =============================================================================

/// Scheduling policy knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedPolicy {
    /// Starts per iteration across all phases; negative is unlimited.
    pub max_job_start_per_iteration: i64,
    pub poll_interval: i64,
    pub defer_time: i64,
    pub defer_start_count: u32,
    pub max_job_start_delay: i64,
    pub max_start_failures: u32,
    pub start_failure_window: i64,
    pub job_reject_policy: Vec<JobRejectPolicy>,
    pub deadline_policy: DeadlinePolicy,
    pub reservation_policy: ReservationPolicy,
    /// Priority reservation slots per QOS bucket (`default` applies otherwise).
    pub reservation_depth: BTreeMap<String, u32>,
    /// Priority reservations per partition; `None` is unlimited.
    pub max_priority_rsv_per_partition: Option<u32>,
    pub backfill_policy: BackfillPolicy,
    pub backfill_metric: BackfillMetric,
    pub allow_preemption: bool,
    pub preempt_policy: PreemptPolicy,
    pub node_availability_policy: AvailabilityPolicy,
    pub node_alloc_policy: NodeAllocPolicy,
    pub default_distribution: DistributionPolicy,
    pub node_overcommit_factor: BTreeMap<ResourceDim, f64>,
    pub overcommit_threshold: Option<f64>,
    pub job_max_task_count: usize,
    pub priority_accrual: PriorityAccrual,
    pub max_load: Option<f64>,
    pub completed_job_capacity: usize,
    pub completed_job_retention: i64,
    pub node_purge_time: i64,
    pub rsv_extension_min: i64,
    pub weights: PriorityWeights,
    pub user_limits: UserLimits,
    pub partitions: Vec<PartitionConfig>,
    pub qos: Vec<QosConfig>,
    pub classes: Vec<ClassConfig>,
    pub users: Vec<CredConfig>,
    pub standing_reservations: Vec<StandingReservationConfig>,
}

impl Default for SchedPolicy {
    fn default() -> Self {
        let mut reservation_depth = BTreeMap::new();
        reservation_depth.insert(DEFAULT_RSV_BUCKET.to_string(), 1);

        Self {
            max_job_start_per_iteration: -1,
            poll_interval: 30,
            defer_time: batchd_reconcile::DEFAULT_DEFER_TIME,
            defer_start_count: batchd_reconcile::DEFAULT_DEFER_START_COUNT,
            max_job_start_delay: 300,
            max_start_failures: batchd_reconcile::DEFAULT_MAX_START_FAILURES,
            start_failure_window: batchd_reconcile::DEFAULT_START_FAILURE_WINDOW,
            job_reject_policy: vec![JobRejectPolicy::Hold],
            deadline_policy: DeadlinePolicy::default(),
            reservation_policy: ReservationPolicy::default(),
            reservation_depth,
            max_priority_rsv_per_partition: None,
            backfill_policy: BackfillPolicy::default(),
            backfill_metric: BackfillMetric::default(),
            allow_preemption: false,
            preempt_policy: PreemptPolicy::default(),
            node_availability_policy: AvailabilityPolicy::default(),
            node_alloc_policy: NodeAllocPolicy::default(),
            default_distribution: DistributionPolicy::default(),
            node_overcommit_factor: BTreeMap::new(),
            overcommit_threshold: None,
            job_max_task_count: 4096,
            priority_accrual: PriorityAccrual::default(),
            max_load: None,
            completed_job_capacity: 1024,
            completed_job_retention: 300,
            node_purge_time: 24 * 60 * 60,
            rsv_extension_min: 60,
            weights: PriorityWeights::default(),
            user_limits: UserLimits::default(),
            partitions: Vec::new(),
            qos: Vec::new(),
            classes: Vec::new(),
            users: Vec::new(),
            standing_reservations: Vec::new(),
        }
    }
}

/// Bucket used by QOSes without an explicit reservation bucket.
pub const DEFAULT_RSV_BUCKET: &str = "default";

impl SchedPolicy {
    pub fn from_toml_str(s: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Slots available to a reservation bucket.
    pub fn bucket_depth(&self, bucket: &str) -> u32 {
        self.reservation_depth
            .get(bucket)
            .or_else(|| self.reservation_depth.get(DEFAULT_RSV_BUCKET))
            .copied()
            .unwrap_or(0)
    }

    /// True when `count` starts this iteration reach the configured limit.
    pub fn start_limit_reached(&self, count: u32) -> bool {
        self.max_job_start_per_iteration >= 0 && i64::from(count) >= self.max_job_start_per_iteration
    }

    pub fn rejects_with(&self, policy: JobRejectPolicy) -> bool {
        self.job_reject_policy.contains(&policy)
    }
}

// =============================================================================
// Config
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub poll_interval: Duration,
    pub rm_query_timeout: Duration,
    pub checkpoint_path: Option<PathBuf>,
    pub policy_file: Option<PathBuf>,
    /// Simulated cluster description for the built-in resource manager.
    pub workload_file: Option<PathBuf>,
    pub policy: SchedPolicy,
}

impl Config {
    pub fn from_env() -> ConfigResult<Self> {
        let log_level = std::env::var("BATCHD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let poll_secs = env_u64("BATCHD_POLL_INTERVAL_SECS", 30)?;
        let timeout_secs = env_u64("BATCHD_RM_QUERY_TIMEOUT_SECS", poll_secs.max(1))?;

        let checkpoint_path = std::env::var("BATCHD_CHECKPOINT_PATH").ok().map(PathBuf::from);
        let policy_file = std::env::var("BATCHD_POLICY_FILE").ok().map(PathBuf::from);
        let workload_file = std::env::var("BATCHD_WORKLOAD_FILE").ok().map(PathBuf::from);

        let mut policy = match &policy_file {
            Some(path) => SchedPolicy::from_file(path)?,
            None => SchedPolicy::default(),
        };
        policy.poll_interval = poll_secs as i64;

        Ok(Self {
            log_level,
            poll_interval: Duration::from_secs(poll_secs),
            rm_query_timeout: Duration::from_secs(timeout_secs),
            checkpoint_path,
            policy_file,
            workload_file,
            policy,
        })
    }
}

fn env_u64(var: &'static str, default: u64) -> ConfigResult<u64> {
    match std::env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}
