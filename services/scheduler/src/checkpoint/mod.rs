//! Scheduler checkpointing.
//!
//! Persists the job attributes the resource manager does not track (start
//! counts, holds, queue-time accounting, exclusion hosts) and standing and
//! user reservations as `(object_type, object_id, attr, value)` records,
//! each guarded by a [`RecordDigest`]. A record that fails its digest is
//! skipped on load; an unreadable store yields an empty restore.

mod store;

use std::collections::{BTreeSet, HashMap};

use batchd_reconcile::RecordDigest;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{Acl, Holds, Job, Resources};
use crate::rsv::{Reservation, RsvFlags, RsvKind, RsvNodeClaim};
use crate::state::SchedState;

pub use store::{MemoryCheckpointStore, SqliteCheckpointStore};

/// Checkpoint errors.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectType {
    Job,
    Rsv,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Rsv => "rsv",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "job" => Some(Self::Job),
            "rsv" => Some(Self::Rsv),
            _ => None,
        }
    }
}

/// One persisted attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub object_type: ObjectType,
    pub object_id: String,
    pub attr: String,
    pub value: serde_json::Value,
}

impl CheckpointRecord {
    fn new(object_type: ObjectType, object_id: &str, attr: &str, value: serde_json::Value) -> Self {
        Self {
            object_type,
            object_id: object_id.to_string(),
            attr: attr.to_string(),
            value,
        }
    }

    /// Digest key: `type/id/attr`.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.object_type.as_str(), self.object_id, self.attr)
    }

    pub fn digest(&self) -> RecordDigest {
        RecordDigest::compute(&self.key(), &self.value)
    }
}

/// Durable checkpoint storage.
pub trait CheckpointStore: Send {
    fn persist(&mut self, record: &CheckpointRecord) -> CheckpointResult<()>;

    /// Drops every record of one object.
    fn remove(&mut self, object_type: ObjectType, object_id: &str) -> CheckpointResult<()>;

    /// Every record whose digest verifies.
    fn load_all(&self) -> CheckpointResult<Vec<CheckpointRecord>>;
}

// =============================================================================
// Persisted shapes
// =============================================================================

/// Scheduler-owned attributes of one job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobCheckpoint {
    pub start_count: Option<u32>,
    pub holds: Option<Holds>,
    pub system_queue_time: Option<i64>,
    pub eff_queue_duration: Option<i64>,
    pub exclude_hosts: Option<BTreeSet<String>>,
}

impl JobCheckpoint {
    fn set(&mut self, attr: &str, value: serde_json::Value) -> CheckpointResult<()> {
        match attr {
            "start_count" => self.start_count = Some(serde_json::from_value(value)?),
            "holds" => self.holds = Some(serde_json::from_value(value)?),
            "system_queue_time" => self.system_queue_time = serde_json::from_value(value)?,
            "eff_queue_duration" => self.eff_queue_duration = Some(serde_json::from_value(value)?),
            "exclude_hosts" => self.exclude_hosts = Some(serde_json::from_value(value)?),
            other => warn!(attr = %other, "unknown job checkpoint attribute"),
        }
        Ok(())
    }

    /// Copies the restored attributes onto `job`.
    pub fn apply(&self, job: &mut Job) {
        if let Some(n) = self.start_count {
            job.start_count = n;
        }
        if let Some(h) = &self.holds {
            job.holds = h.clone();
        }
        if self.system_queue_time.is_some() {
            job.system_queue_time = self.system_queue_time;
        }
        if let Some(d) = self.eff_queue_duration {
            job.eff_queue_duration = d;
        }
        if let Some(x) = &self.exclude_hosts {
            job.exclude_hosts = x.clone();
        }
    }
}

/// A node claim by node name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub node: String,
    pub task_count: u32,
    pub res: Resources,
}

/// A persisted standing or user reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RsvCheckpoint {
    pub name: String,
    pub kind: RsvKind,
    pub group: Option<String>,
    pub start: i64,
    pub end: i64,
    pub expire: Option<i64>,
    pub acl: Acl,
    pub flags: RsvFlags,
    pub claims: Vec<ClaimRecord>,
}

impl RsvCheckpoint {
    fn of(rsv: &Reservation, state: &SchedState) -> Self {
        Self {
            name: rsv.name.clone(),
            kind: rsv.kind,
            group: rsv.group.clone(),
            start: rsv.start,
            end: rsv.end,
            expire: rsv.expire,
            acl: rsv.acl.clone(),
            flags: rsv.flags.clone(),
            claims: rsv
                .nodes
                .iter()
                .map(|c| ClaimRecord {
                    node: state.nodes.name_of(c.node),
                    task_count: c.task_count,
                    res: c.res.clone(),
                })
                .collect(),
        }
    }

    /// Rebuilds the reservation against the current node table. Claims on
    /// nodes that are gone are dropped.
    pub fn to_reservation(&self, state: &SchedState, now: i64) -> Reservation {
        let mut rsv = Reservation::new(self.name.clone(), self.kind, self.start, self.end)
            .with_claims(
                self.claims
                    .iter()
                    .filter_map(|c| {
                        state.nodes.find(&c.node).map(|node| RsvNodeClaim {
                            node,
                            task_count: c.task_count,
                            res: c.res.clone(),
                        })
                    })
                    .collect(),
            );
        rsv.group = self.group.clone();
        rsv.expire = self.expire;
        rsv.acl = self.acl.clone();
        rsv.flags = self.flags.clone();
        rsv.created_at = now;
        rsv
    }
}

/// Everything a load produced.
#[derive(Debug, Clone, Default)]
pub struct Restored {
    pub jobs: HashMap<String, JobCheckpoint>,
    pub rsvs: Vec<RsvCheckpoint>,
}

impl Restored {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.rsvs.is_empty()
    }
}

// =============================================================================
// Snapshot and restore
// =============================================================================

fn persisted_rsv(kind: RsvKind) -> bool {
    matches!(kind, RsvKind::Standing | RsvKind::User)
}

/// Records describing `state`.
pub fn snapshot(state: &SchedState) -> CheckpointResult<Vec<CheckpointRecord>> {
    let mut out = Vec::new();
    for (_, job) in state.jobs.iter() {
        let id = job.name.as_str();
        out.push(CheckpointRecord::new(ObjectType::Job, id, "start_count", serde_json::to_value(job.start_count)?));
        out.push(CheckpointRecord::new(ObjectType::Job, id, "holds", serde_json::to_value(&job.holds)?));
        out.push(CheckpointRecord::new(
            ObjectType::Job,
            id,
            "system_queue_time",
            serde_json::to_value(job.system_queue_time)?,
        ));
        out.push(CheckpointRecord::new(
            ObjectType::Job,
            id,
            "eff_queue_duration",
            serde_json::to_value(job.eff_queue_duration)?,
        ));
        out.push(CheckpointRecord::new(
            ObjectType::Job,
            id,
            "exclude_hosts",
            serde_json::to_value(&job.exclude_hosts)?,
        ));
    }
    for (_, rsv) in state.rsvs.iter() {
        if persisted_rsv(rsv.kind) {
            out.push(CheckpointRecord::new(
                ObjectType::Rsv,
                &rsv.name,
                "definition",
                serde_json::to_value(RsvCheckpoint::of(rsv, state))?,
            ));
        }
    }
    Ok(out)
}

/// Writes every record of `state` to `store`.
pub fn persist_state(store: &mut dyn CheckpointStore, state: &SchedState) -> CheckpointResult<usize> {
    let records = snapshot(state)?;
    for record in &records {
        store.persist(record)?;
    }
    Ok(records.len())
}

/// Loads and groups every verified record. Failures yield an empty restore.
pub fn load(store: &dyn CheckpointStore) -> Restored {
    let records = match store.load_all() {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "checkpoint store unreadable, starting empty");
            return Restored::default();
        }
    };

    let mut restored = Restored::default();
    for record in records {
        match record.object_type {
            ObjectType::Job => {
                let entry = restored.jobs.entry(record.object_id.clone()).or_default();
                if let Err(e) = entry.set(&record.attr, record.value) {
                    warn!(job = %record.object_id, attr = %record.attr, error = %e, "bad job checkpoint");
                }
            }
            ObjectType::Rsv => match serde_json::from_value::<RsvCheckpoint>(record.value) {
                Ok(rsv) => restored.rsvs.push(rsv),
                Err(e) => warn!(rsv = %record.object_id, error = %e, "bad reservation checkpoint"),
            },
        }
    }
    info!(jobs = restored.jobs.len(), rsvs = restored.rsvs.len(), "checkpoint loaded");
    restored
}
