//! Reservation storage.
//!
//! # Invariants
//!
//! - A job-backed reservation `R` with `R.job == J` exists iff `J.rsv == R`
//! - Every node named in a reservation's claims references it in `rsv_refs`
//! - Overlapping non-job reservations share a node only when
//!   [`check_rsv_access`] allows it

use std::collections::HashMap;

use batchd_id::{Arena, JobHandle, RsvHandle};
use tracing::debug;

use super::access::check_rsv_access;
use super::{Reservation, RsvError, RsvKind, RsvResult};
use crate::model::{JobTable, NodeTable};

#[derive(Debug, Default)]
pub struct RsvTable {
    rsvs: Arena<RsvHandle, Reservation>,
    by_name: HashMap<String, RsvHandle>,
}

impl RsvTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reservation, binding its job and node references.
    ///
    /// Nothing changes when validation fails.
    pub fn create(
        &mut self,
        rsv: Reservation,
        jobs: &mut JobTable,
        nodes: &mut NodeTable,
    ) -> RsvResult<RsvHandle> {
        if rsv.end < rsv.start {
            return Err(RsvError::InvalidWindow {
                name: rsv.name,
                start: rsv.start,
                end: rsv.end,
            });
        }
        if self.by_name.contains_key(&rsv.name) {
            return Err(RsvError::Duplicate(rsv.name));
        }
        if let Some(jh) = rsv.job {
            let job = jobs
                .get(jh)
                .ok_or_else(|| RsvError::JobNotFound(jh.to_string()))?;
            if let Some(existing) = job.rsv {
                return Err(RsvError::JobAlreadyBound {
                    job: job.name.clone(),
                    rsv: self.name_of(existing),
                });
            }
        }

        if let Some(other) = self.conflicting(&rsv) {
            return Err(RsvError::Conflict {
                name: rsv.name,
                other,
            });
        }

        let name = rsv.name.clone();
        let job = rsv.job;
        let node_handles: Vec<_> = rsv.nodes.iter().map(|c| c.node).collect();
        let handle = self.rsvs.insert(rsv);
        self.by_name.insert(name.clone(), handle);

        if let Some(j) = job.and_then(|jh| jobs.get_mut(jh)) {
            j.rsv = Some(handle);
        }
        for nh in node_handles {
            if let Some(node) = nodes.get_mut(nh) {
                node.rsv_refs.insert(handle);
            }
        }
        debug!(rsv = %name, "reservation created");
        Ok(handle)
    }

    /// Name of an existing non-job reservation that overlaps `rsv` in time
    /// on a shared node and refuses to share with it.
    fn conflicting(&self, rsv: &Reservation) -> Option<String> {
        if rsv.kind.is_job() || rsv.nodes.is_empty() {
            return None;
        }
        self.rsvs
            .iter()
            .filter(|(_, other)| !other.kind.is_job() && other.overlaps(rsv.start, rsv.end))
            .filter(|(_, other)| {
                other
                    .nodes
                    .iter()
                    .any(|c| rsv.nodes.iter().any(|n| n.node == c.node))
            })
            .find(|(_, other)| !check_rsv_access(rsv, other))
            .map(|(_, other)| other.name.clone())
    }

    /// Removes a reservation and unbinds its job and nodes.
    pub fn destroy(
        &mut self,
        handle: RsvHandle,
        jobs: &mut JobTable,
        nodes: &mut NodeTable,
    ) -> Option<Reservation> {
        let rsv = self.rsvs.remove(handle)?;
        self.by_name.remove(&rsv.name);
        if let Some(job) = rsv.job.and_then(|jh| jobs.get_mut(jh)) {
            if job.rsv == Some(handle) {
                job.rsv = None;
            }
        }
        for claim in &rsv.nodes {
            if let Some(node) = nodes.get_mut(claim.node) {
                node.rsv_refs.remove(&handle);
            }
        }
        debug!(rsv = %rsv.name, "reservation destroyed");
        Some(rsv)
    }

    /// Releases the reservation bound to `job`, if any.
    pub fn release_job(
        &mut self,
        job: JobHandle,
        jobs: &mut JobTable,
        nodes: &mut NodeTable,
    ) -> Option<Reservation> {
        let handle = jobs.get(job)?.rsv?;
        self.destroy(handle, jobs, nodes)
    }

    /// Moves the end time; the window must stay valid.
    pub fn set_end(&mut self, handle: RsvHandle, end: i64) -> RsvResult<()> {
        let rsv = self
            .rsvs
            .get_mut(handle)
            .ok_or_else(|| RsvError::NotFound(handle.to_string()))?;
        if end < rsv.start {
            return Err(RsvError::InvalidWindow {
                name: rsv.name.clone(),
                start: rsv.start,
                end,
            });
        }
        rsv.end = end;
        Ok(())
    }

    pub fn get(&self, handle: RsvHandle) -> Option<&Reservation> {
        self.rsvs.get(handle)
    }

    pub fn find(&self, name: &str) -> Option<RsvHandle> {
        self.by_name.get(name).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<&Reservation> {
        self.find(name).and_then(|h| self.rsvs.get(h))
    }

    pub fn name_of(&self, handle: RsvHandle) -> String {
        self.rsvs
            .get(handle)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| handle.to_string())
    }

    pub fn iter(&self) -> impl Iterator<Item = (RsvHandle, &Reservation)> {
        self.rsvs.iter()
    }

    pub fn handles(&self) -> Vec<RsvHandle> {
        self.rsvs.handles()
    }

    /// Handles of reservations matching `pred`.
    pub fn select(&self, pred: impl Fn(&Reservation) -> bool) -> Vec<RsvHandle> {
        self.rsvs
            .iter()
            .filter(|(_, r)| pred(r))
            .map(|(h, _)| h)
            .collect()
    }

    /// Count of job reservations of `kind`.
    pub fn count_kind(&self, kind: RsvKind) -> usize {
        self.rsvs.iter().filter(|(_, r)| r.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.rsvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rsvs.is_empty()
    }

    /// Lists binding mismatches between jobs, nodes and reservations.
    pub fn check_consistency(&self, jobs: &JobTable, nodes: &NodeTable) -> Vec<String> {
        let mut problems = Vec::new();
        for (h, rsv) in self.rsvs.iter() {
            if let Some(jh) = rsv.job {
                match jobs.get(jh) {
                    Some(j) if j.rsv == Some(h) => {}
                    Some(j) => problems.push(format!(
                        "reservation {} points at job {} which points elsewhere",
                        rsv.name, j.name
                    )),
                    None => problems.push(format!("reservation {} has a stale job", rsv.name)),
                }
            }
            for claim in &rsv.nodes {
                if !nodes.get(claim.node).is_some_and(|n| n.rsv_refs.contains(&h)) {
                    problems.push(format!(
                        "node {} does not reference reservation {}",
                        nodes.name_of(claim.node),
                        rsv.name
                    ));
                }
            }
        }
        for (jh, job) in jobs.iter() {
            if let Some(rh) = job.rsv {
                if self.rsvs.get(rh).and_then(|r| r.job) != Some(jh) {
                    problems.push(format!("job {} points at a reservation it does not own", job.name));
                }
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Acl, CredKind, CredStore, Job, JobCredentials, Node, Resources};
    use crate::rsv::RsvNodeClaim;

    fn fixture() -> (JobTable, NodeTable, JobHandle, batchd_id::NodeHandle) {
        let mut store = CredStore::new();
        let mut jobs = JobTable::default();
        let mut nodes = NodeTable::new();
        let j = jobs
            .insert(Job::new("j1", JobCredentials::for_user(&mut store, "alice")))
            .unwrap();
        let n = nodes.insert(Node::new("n1", "batch", Resources::new(4, 0)));
        (jobs, nodes, j, n)
    }

    fn claim(node: batchd_id::NodeHandle) -> Vec<RsvNodeClaim> {
        vec![RsvNodeClaim {
            node,
            task_count: 2,
            res: Resources::new(2, 0),
        }]
    }

    #[test]
    fn test_create_and_destroy_keep_binding_paired() {
        let (mut jobs, mut nodes, j, n) = fixture();
        let mut table = RsvTable::new();
        let rsv = Reservation::new("j1", RsvKind::PriorityJob, 100, 200)
            .for_job(j, "j1")
            .with_claims(claim(n));
        let h = table.create(rsv, &mut jobs, &mut nodes).unwrap();

        assert_eq!(jobs.get(j).unwrap().rsv, Some(h));
        assert!(nodes.get(n).unwrap().rsv_refs.contains(&h));
        assert!(table.check_consistency(&jobs, &nodes).is_empty());

        table.destroy(h, &mut jobs, &mut nodes).unwrap();
        assert!(jobs.get(j).unwrap().rsv.is_none());
        assert!(nodes.get(n).unwrap().rsv_refs.is_empty());
        assert!(table.check_consistency(&jobs, &nodes).is_empty());
    }

    #[test]
    fn test_second_binding_is_rejected_without_change() {
        let (mut jobs, mut nodes, j, n) = fixture();
        let mut table = RsvTable::new();
        let first = Reservation::new("a", RsvKind::PriorityJob, 0, 10).for_job(j, "j1");
        let h = table.create(first, &mut jobs, &mut nodes).unwrap();

        let second = Reservation::new("b", RsvKind::DeadlineJob, 0, 10)
            .for_job(j, "j1")
            .with_claims(claim(n));
        let err = table.create(second, &mut jobs, &mut nodes).unwrap_err();
        assert!(matches!(err, RsvError::JobAlreadyBound { .. }));
        assert_eq!(table.len(), 1);
        assert_eq!(jobs.get(j).unwrap().rsv, Some(h));
        assert!(nodes.get(n).unwrap().rsv_refs.is_empty());
    }

    fn admin(name: &str, kind: RsvKind, start: i64, end: i64, node: batchd_id::NodeHandle) -> Reservation {
        let mut rsv = Reservation::new(name, kind, start, end).with_claims(claim(node));
        rsv.acl = Acl::new().allow(CredKind::User, "ops");
        rsv
    }

    #[test]
    fn test_overlapping_exclusive_reservation_is_refused() {
        let (mut jobs, mut nodes, _, n) = fixture();
        let mut table = RsvTable::new();
        let mut maint = admin("maint.0", RsvKind::Standing, 100, 200, n);
        maint.flags.exclude_all = true;
        table.create(maint, &mut jobs, &mut nodes).unwrap();

        let err = table
            .create(admin("drain", RsvKind::User, 150, 250, n), &mut jobs, &mut nodes)
            .unwrap_err();
        assert_eq!(
            err,
            RsvError::Conflict {
                name: "drain".into(),
                other: "maint.0".into()
            }
        );
        assert_eq!(table.len(), 1);
        assert_eq!(nodes.get(n).unwrap().rsv_refs.len(), 1);

        // Outside the window, or with a shared ACL and no exclusivity, it fits.
        table
            .create(admin("later", RsvKind::User, 200, 300, n), &mut jobs, &mut nodes)
            .unwrap();
        table
            .create(admin("shared", RsvKind::User, 250, 280, n), &mut jobs, &mut nodes)
            .unwrap();
        assert!(table.check_consistency(&jobs, &nodes).is_empty());
    }

    #[test]
    fn test_job_reservation_skips_exclusivity_check() {
        let (mut jobs, mut nodes, j, n) = fixture();
        let mut table = RsvTable::new();
        let mut maint = admin("maint.0", RsvKind::Standing, 0, 200, n);
        maint.flags.exclude_all = true;
        table.create(maint, &mut jobs, &mut nodes).unwrap();

        let rsv = Reservation::new("j1", RsvKind::PriorityJob, 100, 300)
            .for_job(j, "j1")
            .with_claims(claim(n));
        assert!(table.create(rsv, &mut jobs, &mut nodes).is_ok());
    }

    #[test]
    fn test_invalid_window_and_duplicate() {
        let (mut jobs, mut nodes, _, _) = fixture();
        let mut table = RsvTable::new();
        assert!(matches!(
            table.create(Reservation::new("x", RsvKind::User, 10, 5), &mut jobs, &mut nodes),
            Err(RsvError::InvalidWindow { .. })
        ));
        table
            .create(Reservation::new("x", RsvKind::User, 0, 5), &mut jobs, &mut nodes)
            .unwrap();
        assert_eq!(
            table
                .create(Reservation::new("x", RsvKind::User, 0, 5), &mut jobs, &mut nodes)
                .unwrap_err(),
            RsvError::Duplicate("x".into())
        );
    }

    #[test]
    fn test_release_job_and_set_end() {
        let (mut jobs, mut nodes, j, n) = fixture();
        let mut table = RsvTable::new();
        let h = table
            .create(
                Reservation::new("j1", RsvKind::ActiveJob, 0, 100)
                    .for_job(j, "j1")
                    .with_claims(claim(n)),
                &mut jobs,
                &mut nodes,
            )
            .unwrap();
        table.set_end(h, 160).unwrap();
        assert_eq!(table.get(h).unwrap().end, 160);
        assert!(table.set_end(h, -1).is_err());

        let released = table.release_job(j, &mut jobs, &mut nodes).unwrap();
        assert_eq!(released.name, "j1");
        assert!(table.is_empty());
        assert!(jobs.get(j).unwrap().rsv.is_none());
    }
}
