//! Typed handle and identifier definitions.

use crate::{define_handle, define_id};

// =============================================================================
// Arena Handles
// =============================================================================

define_handle!(JobHandle, "job");
define_handle!(NodeHandle, "node");
define_handle!(RsvHandle, "rsv");

// =============================================================================
// External Identifiers
// =============================================================================

define_id!(EventId, "evt");
define_id!(CycleId, "cyc");

/// Scheduling iteration counter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct Iteration(u64);

impl Iteration {
    /// Creates an iteration counter.
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the following iteration.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Iteration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Handle;

    #[test]
    fn test_handle_roundtrip() {
        let h = JobHandle::from_parts(12, 3);
        let s = h.to_string();
        assert_eq!(s, "job:12.3");
        let parsed: JobHandle = s.parse().unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn test_handle_invalid_prefix() {
        let result: Result<NodeHandle, _> = "job:1.0".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_handle_missing_generation() {
        let result: Result<RsvHandle, _> = "rsv:4".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator('.')
        ));
    }

    #[test]
    fn test_handle_bad_component() {
        let result: Result<RsvHandle, _> = "rsv:x.0".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidComponent(_)
        ));
    }

    #[test]
    fn test_handle_wrong_kind() {
        let result: Result<JobHandle, _> = "node:3.1".parse();
        assert!(result.unwrap_err().is_prefix_error());
    }

    #[test]
    fn test_handle_json() {
        let h = NodeHandle::from_parts(0, 1);
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, "\"node:0.1\"");
        let back: NodeHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn test_event_id_roundtrip() {
        let id = EventId::new();
        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!(id.to_string().starts_with("evt_"));
    }

    #[test]
    fn test_event_id_empty() {
        let result: Result<EventId, _> = "".parse();
        assert!(result.unwrap_err().is_empty());
    }

    #[test]
    fn test_iteration_next() {
        let it = Iteration::default();
        assert_eq!(it.next().value(), 1);
    }

    #[test]
    fn test_prefixes_unique() {
        let prefixes = [
            JobHandle::PREFIX,
            NodeHandle::PREFIX,
            RsvHandle::PREFIX,
            EventId::PREFIX,
            CycleId::PREFIX,
        ];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }
}
