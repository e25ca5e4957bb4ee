//! Credentials, access control lists and per-partition credential views.
//!
//! Credential objects are shared singletons owned by the [`CredStore`]; jobs
//! hold `Arc` references. Partition-specific policy is evaluated through a
//! [`CredentialView`] computed by [`evaluate_for_partition`], which never
//! touches the job.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::partition::Partition;

/// Kind of credential (or job name) an ACL entry matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredKind {
    User,
    Group,
    Account,
    Qos,
    Class,
    Job,
}

/// A user, group or account credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub kind: CredKind,
    pub name: String,
    pub priority: i64,
}

/// QOS behavior flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QosFlags {
    /// Jobs may not be backfilled.
    pub no_backfill: bool,
    /// Jobs carry a completion deadline that must be reserved for.
    pub deadline: bool,
    /// Jobs get a priority reservation regardless of rank.
    pub reserve_always: bool,
    /// A blocked job of this QOS stops later jobs from starting.
    pub next_to_run: bool,
    /// Reservations of this QOS survive restoration.
    pub no_preemptible: bool,
    /// Jobs may preempt preemptible work.
    pub preemptor: bool,
}

/// Quality-of-service credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qos {
    pub name: String,
    pub priority: i64,
    pub flags: QosFlags,
    /// Priority reservation slot bucket; `None` uses the default bucket.
    pub rsv_bucket: Option<String>,
}

/// Class (queue) credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Class {
    pub name: String,
    pub priority: i64,
    /// Cancel rejected jobs rather than excluding the failing node.
    pub cancel_on_fail: bool,
}

/// Shared credential registry, looked up by name.
#[derive(Debug, Default)]
pub struct CredStore {
    users: HashMap<String, Arc<Credential>>,
    groups: HashMap<String, Arc<Credential>>,
    accounts: HashMap<String, Arc<Credential>>,
    qos: HashMap<String, Arc<Qos>>,
    classes: HashMap<String, Arc<Class>>,
}

impl CredStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn cred(
        map: &mut HashMap<String, Arc<Credential>>,
        kind: CredKind,
        name: &str,
    ) -> Arc<Credential> {
        map.entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Credential {
                    kind,
                    name: name.to_string(),
                    priority: 0,
                })
            })
            .clone()
    }

    pub fn user(&mut self, name: &str) -> Arc<Credential> {
        Self::cred(&mut self.users, CredKind::User, name)
    }

    pub fn group(&mut self, name: &str) -> Arc<Credential> {
        Self::cred(&mut self.groups, CredKind::Group, name)
    }

    pub fn account(&mut self, name: &str) -> Arc<Credential> {
        Self::cred(&mut self.accounts, CredKind::Account, name)
    }

    /// Registers (or replaces) a credential with an explicit priority.
    pub fn define(&mut self, kind: CredKind, name: &str, priority: i64) -> Arc<Credential> {
        let cred = Arc::new(Credential {
            kind,
            name: name.to_string(),
            priority,
        });
        let map = match kind {
            CredKind::Group => &mut self.groups,
            CredKind::Account => &mut self.accounts,
            _ => &mut self.users,
        };
        map.insert(name.to_string(), cred.clone());
        cred
    }

    pub fn define_qos(&mut self, qos: Qos) -> Arc<Qos> {
        let qos = Arc::new(qos);
        self.qos.insert(qos.name.clone(), qos.clone());
        qos
    }

    pub fn define_class(&mut self, class: Class) -> Arc<Class> {
        let class = Arc::new(class);
        self.classes.insert(class.name.clone(), class.clone());
        class
    }

    /// QOS by name, created with default flags when unknown.
    pub fn qos(&mut self, name: &str) -> Arc<Qos> {
        self.qos
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Qos {
                    name: name.to_string(),
                    priority: 0,
                    flags: QosFlags::default(),
                    rsv_bucket: None,
                })
            })
            .clone()
    }

    pub fn find_qos(&self, name: &str) -> Option<Arc<Qos>> {
        self.qos.get(name).cloned()
    }

    /// Class by name, created with defaults when unknown.
    pub fn class(&mut self, name: &str) -> Arc<Class> {
        self.classes
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Class {
                    name: name.to_string(),
                    priority: 0,
                    cancel_on_fail: false,
                })
            })
            .clone()
    }

    pub fn find_class(&self, name: &str) -> Option<Arc<Class>> {
        self.classes.get(name).cloned()
    }
}

/// Credential references held by a job.
#[derive(Debug, Clone)]
pub struct JobCredentials {
    pub user: Arc<Credential>,
    pub group: Arc<Credential>,
    pub account: Option<Arc<Credential>>,
    pub qos: Option<Arc<Qos>>,
    pub class: Option<Arc<Class>>,
}

impl JobCredentials {
    /// Credentials for `user` in a group of the same name, nothing else.
    pub fn for_user(store: &mut CredStore, user: &str) -> Self {
        Self {
            user: store.user(user),
            group: store.group(user),
            account: None,
            qos: None,
            class: None,
        }
    }
}

/// Effective credentials of a job within one partition.
#[derive(Debug, Clone)]
pub struct CredentialView {
    pub partition: String,
    pub user: Arc<Credential>,
    pub group: Arc<Credential>,
    pub account: Option<Arc<Credential>>,
    pub qos: Option<Arc<Qos>>,
    pub class: Option<Arc<Class>>,
}

impl CredentialView {
    /// Flattened `(kind, name)` list used for ACL matching.
    pub fn cred_list(&self, job_name: &str) -> Vec<(CredKind, String)> {
        let mut list = vec![
            (CredKind::User, self.user.name.clone()),
            (CredKind::Group, self.group.name.clone()),
        ];
        if let Some(a) = &self.account {
            list.push((CredKind::Account, a.name.clone()));
        }
        if let Some(q) = &self.qos {
            list.push((CredKind::Qos, q.name.clone()));
        }
        if let Some(c) = &self.class {
            list.push((CredKind::Class, c.name.clone()));
        }
        if !job_name.is_empty() {
            list.push((CredKind::Job, job_name.to_string()));
        }
        list
    }

    /// Sum of credential priorities.
    pub fn priority(&self) -> i64 {
        self.user.priority
            + self.group.priority
            + self.account.as_ref().map_or(0, |a| a.priority)
            + self.qos.as_ref().map_or(0, |q| q.priority)
            + self.class.as_ref().map_or(0, |c| c.priority)
    }
}

/// Computes the credential view of a job in `partition`.
///
/// A partition may remap the job's QOS and supply a default class. The
/// shared job and credential objects are never modified.
pub fn evaluate_for_partition(
    creds: &JobCredentials,
    partition: &Partition,
    store: &CredStore,
) -> CredentialView {
    let qos = match (&creds.qos, partition.qos_map.is_empty()) {
        (Some(q), false) => partition
            .qos_map
            .get(&q.name)
            .and_then(|mapped| store.find_qos(mapped))
            .or_else(|| Some(q.clone())),
        (q, _) => q.clone(),
    };

    let class = creds.class.clone().or_else(|| {
        partition
            .default_class
            .as_deref()
            .and_then(|c| store.find_class(c))
    });

    CredentialView {
        partition: partition.name.clone(),
        user: creds.user.clone(),
        group: creds.group.clone(),
        account: creds.account.clone(),
        qos,
        class,
    }
}

/// One ACL entry; the name `ALL` matches any credential of that kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub kind: CredKind,
    pub name: String,
}

/// Credential-list matcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub entries: Vec<AclEntry>,
}

impl Acl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, kind: CredKind, name: impl Into<String>) -> Self {
        self.entries.push(AclEntry {
            kind,
            name: name.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when any entry matches any credential in `creds`.
    pub fn matches(&self, creds: &[(CredKind, String)]) -> bool {
        self.entries.iter().any(|e| {
            creds
                .iter()
                .any(|(kind, name)| *kind == e.kind && (e.name == "ALL" || e.name == *name))
        })
    }

    /// True when the two ACLs share an entry.
    pub fn intersects(&self, other: &Acl) -> bool {
        self.entries.iter().any(|a| {
            other
                .entries
                .iter()
                .any(|b| a.kind == b.kind && (a.name == b.name || a.name == "ALL" || b.name == "ALL"))
        })
    }
}
