//! Multi-dimensional resource vectors.
//!
//! A [`Resources`] value is used for configured, dedicated and available node
//! resources as well as per-task request shapes. Amounts are signed so the
//! whole-resource sentinel ([`WHOLE`]) can be expressed in a request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-task request value meaning "the entire resource, unshared".
pub const WHOLE: i64 = -1;

/// Task count reported for a node when a request asks for nothing countable.
pub const UNBOUNDED_TASKS: u32 = 4096;

/// Scalar resource dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceDim {
    Procs,
    Mem,
    Swap,
    Disk,
}

impl ResourceDim {
    /// All scalar dimensions in evaluation order.
    pub const ALL: [ResourceDim; 4] = [
        ResourceDim::Procs,
        ResourceDim::Mem,
        ResourceDim::Swap,
        ResourceDim::Disk,
    ];

    /// Reject reason reported when this dimension is exhausted.
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            ResourceDim::Procs => RejectReason::Cpu,
            ResourceDim::Mem => RejectReason::Memory,
            ResourceDim::Swap => RejectReason::Swap,
            ResourceDim::Disk => RejectReason::Disk,
        }
    }
}

impl std::fmt::Display for ResourceDim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceDim::Procs => "procs",
            ResourceDim::Mem => "mem",
            ResourceDim::Swap => "swap",
            ResourceDim::Disk => "disk",
        };
        f.write_str(s)
    }
}

/// Why a node cannot host (more of) a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[default]
    None,
    Cpu,
    Memory,
    Swap,
    Disk,
    GenericResource,
    State,
    Features,
    Partition,
    Reservation,
    Excluded,
    Policy,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::None => "none",
            RejectReason::Cpu => "cpu",
            RejectReason::Memory => "memory",
            RejectReason::Swap => "swap",
            RejectReason::Disk => "disk",
            RejectReason::GenericResource => "gres",
            RejectReason::State => "state",
            RejectReason::Features => "features",
            RejectReason::Partition => "partition",
            RejectReason::Reservation => "reservation",
            RejectReason::Excluded => "excluded",
            RejectReason::Policy => "policy",
        };
        f.write_str(s)
    }
}

/// A resource vector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub procs: i64,
    pub mem: i64,
    pub swap: i64,
    pub disk: i64,
    pub gres: BTreeMap<String, i64>,
}

impl Resources {
    /// Shorthand for a procs/mem vector.
    pub fn new(procs: i64, mem: i64) -> Self {
        Self {
            procs,
            mem,
            ..Self::default()
        }
    }

    /// Builder-style generic resource setter.
    pub fn with_gres(mut self, name: impl Into<String>, count: i64) -> Self {
        self.gres.insert(name.into(), count);
        self
    }

    /// Value of a scalar dimension.
    pub fn get(&self, dim: ResourceDim) -> i64 {
        match dim {
            ResourceDim::Procs => self.procs,
            ResourceDim::Mem => self.mem,
            ResourceDim::Swap => self.swap,
            ResourceDim::Disk => self.disk,
        }
    }

    /// Mutable access to a scalar dimension.
    pub fn get_mut(&mut self, dim: ResourceDim) -> &mut i64 {
        match dim {
            ResourceDim::Procs => &mut self.procs,
            ResourceDim::Mem => &mut self.mem,
            ResourceDim::Swap => &mut self.swap,
            ResourceDim::Disk => &mut self.disk,
        }
    }

    /// Generic resource count, zero when absent.
    pub fn gres(&self, name: &str) -> i64 {
        self.gres.get(name).copied().unwrap_or(0)
    }

    /// True when every dimension is zero.
    pub fn is_empty(&self) -> bool {
        ResourceDim::ALL.iter().all(|d| self.get(*d) == 0) && self.gres.values().all(|v| *v == 0)
    }

    /// Adds `times` copies of `other` (a per-task shape) into `self`.
    ///
    /// Whole-resource request values are skipped; callers resolve them
    /// against a node's configured amount first.
    pub fn add_times(&mut self, other: &Resources, times: u32) {
        let t = i64::from(times);
        for dim in ResourceDim::ALL {
            let v = other.get(dim);
            if v > 0 {
                *self.get_mut(dim) += v * t;
            }
        }
        for (name, v) in &other.gres {
            if *v > 0 {
                *self.gres.entry(name.clone()).or_insert(0) += v * t;
            }
        }
    }

    /// Adds another vector.
    pub fn add(&mut self, other: &Resources) {
        self.add_times(other, 1);
    }

    /// Subtracts another vector, flooring every dimension at zero.
    pub fn saturating_sub(&mut self, other: &Resources) {
        for dim in ResourceDim::ALL {
            let v = self.get_mut(dim);
            *v = (*v - other.get(dim)).max(0);
        }
        for (name, v) in &other.gres {
            let e = self.gres.entry(name.clone()).or_insert(0);
            *e = (*e - v).max(0);
        }
    }

    /// Component-wise difference without flooring.
    pub fn minus(&self, other: &Resources) -> Resources {
        let mut out = self.clone();
        for dim in ResourceDim::ALL {
            *out.get_mut(dim) -= other.get(dim);
        }
        for (name, v) in &other.gres {
            *out.gres.entry(name.clone()).or_insert(0) -= v;
        }
        out
    }

    /// Per-task shape with whole-resource sentinels resolved to `configured`.
    pub fn resolve_whole(&self, configured: &Resources) -> Resources {
        let mut out = self.clone();
        for dim in ResourceDim::ALL {
            if self.get(dim) == WHOLE {
                *out.get_mut(dim) = configured.get(dim);
            }
        }
        for (name, v) in out.gres.iter_mut() {
            if *v == WHOLE {
                *v = configured.gres(name);
            }
        }
        out
    }

    /// True when `self <= other` in every dimension.
    pub fn fits_within(&self, other: &Resources) -> bool {
        ResourceDim::ALL
            .iter()
            .all(|d| self.get(*d) <= other.get(*d))
            && self.gres.iter().all(|(n, v)| *v <= other.gres(n))
    }

    /// Clamps every dimension into `[0, cap]`.
    pub fn clamp_to(&mut self, cap: &Resources) {
        for dim in ResourceDim::ALL {
            let c = cap.get(dim);
            let v = self.get_mut(dim);
            *v = (*v).clamp(0, c.max(0));
        }
        for (name, v) in self.gres.iter_mut() {
            *v = (*v).clamp(0, cap.gres(name).max(0));
        }
    }
}

/// Task count `available` supports for the per-task shape `request`, given
/// what the node has `configured`.
///
/// Dimensions with a zero request are ignored. A whole-resource request
/// needs the dimension completely free. Returns the first exhausted
/// dimension as the reason when the result is below `min_tc`.
pub fn task_count_within(
    available: &Resources,
    configured: &Resources,
    request: &Resources,
    min_tc: u32,
) -> (u32, RejectReason) {
    let mut tc = UNBOUNDED_TASKS as i64;

    for dim in ResourceDim::ALL {
        let req = request.get(dim);
        if req == 0 {
            continue;
        }
        let cfg = configured.get(dim);
        let avail = available.get(dim).min(cfg);

        let dim_tc = if req == WHOLE {
            if cfg > 0 && avail >= cfg { 1 } else { 0 }
        } else if cfg < req {
            0
        } else {
            avail.max(0) / req
        };

        tc = tc.min(dim_tc);
        if tc < i64::from(min_tc) || tc == 0 {
            return (0, dim.reject_reason());
        }
    }

    for (name, req) in &request.gres {
        if *req == 0 {
            continue;
        }
        let cfg = configured.gres(name);
        let avail = available.gres(name).min(cfg);
        let dim_tc = if *req == WHOLE {
            if cfg > 0 && avail >= cfg { 1 } else { 0 }
        } else if cfg < *req {
            0
        } else {
            avail.max(0) / req
        };
        tc = tc.min(dim_tc);
        if tc < i64::from(min_tc) || tc == 0 {
            return (0, RejectReason::GenericResource);
        }
    }

    (tc as u32, RejectReason::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_add_times_and_sub() {
        let mut r = Resources::new(1, 100);
        r.add_times(&Resources::new(2, 50).with_gres("gpu", 1), 3);
        assert_eq!(r.procs, 7);
        assert_eq!(r.mem, 250);
        assert_eq!(r.gres("gpu"), 3);

        r.saturating_sub(&Resources::new(10, 10));
        assert_eq!(r.procs, 0);
        assert_eq!(r.mem, 240);
    }

    #[test]
    fn test_resolve_whole() {
        let req = Resources::new(WHOLE, 10);
        let cfg = Resources::new(8, 1024);
        let resolved = req.resolve_whole(&cfg);
        assert_eq!(resolved.procs, 8);
        assert_eq!(resolved.mem, 10);
    }

    #[rstest]
    #[case(Resources::new(4, 8192), Resources::new(1, 0), 4, RejectReason::None)]
    #[case(Resources::new(4, 8192), Resources::new(1, 4096), 2, RejectReason::None)]
    #[case(Resources::new(4, 1000), Resources::new(1, 4096), 0, RejectReason::Memory)]
    #[case(Resources::new(0, 8192), Resources::new(1, 0), 0, RejectReason::Cpu)]
    #[case(Resources::new(4, 8192), Resources::new(WHOLE, 0), 1, RejectReason::None)]
    #[case(Resources::new(3, 8192), Resources::new(WHOLE, 0), 0, RejectReason::Cpu)]
    fn test_task_count_within(
        #[case] available: Resources,
        #[case] request: Resources,
        #[case] want_tc: u32,
        #[case] want_reason: RejectReason,
    ) {
        let configured = Resources::new(4, 8192);
        let (tc, reason) = task_count_within(&available, &configured, &request, 1);
        assert_eq!(tc, want_tc);
        assert_eq!(reason, want_reason);
    }

    #[test]
    fn test_task_count_gres() {
        let cfg = Resources::new(8, 0).with_gres("gpu", 2);
        let req = Resources::new(1, 0).with_gres("gpu", 1);
        assert_eq!(task_count_within(&cfg, &cfg, &req, 1), (2, RejectReason::None));

        let used = Resources::new(8, 0).with_gres("gpu", 0);
        assert_eq!(
            task_count_within(&used, &cfg, &req, 1),
            (0, RejectReason::GenericResource)
        );
    }

    #[test]
    fn test_empty_request_is_unbounded() {
        let cfg = Resources::new(8, 0);
        let (tc, _) = task_count_within(&cfg, &cfg, &Resources::default(), 1);
        assert_eq!(tc, UNBOUNDED_TASKS);
    }
}
