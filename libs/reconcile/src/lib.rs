//! Reconciliation primitives.
//!
//! The scheduler acts optimistically: it records what it expects an object's
//! state to be and confirms against what the resource manager reports on a
//! later iteration. This library holds the pieces of that loop that do not
//! depend on the job or node model:
//!
//! - **Agreement**: classifying expected vs observed state, with a grace
//!   period for actions still in flight.
//! - **Backoff**: defer durations that grow with repeated start attempts.
//! - **Retry tracking**: counting consecutive failures per object inside a
//!   window of scheduler time.
//! - **Record digests**: canonical hashes that let a checkpoint store detect
//!   corrupted records.
//!
//! # Invariants
//!
//! - All functions are deterministic given the same inputs and clock value
//! - Time is the scheduler clock (epoch seconds), never the wall clock

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Object referenced by an observation is unknown.
    #[error("object not found: {0}")]
    NotFound(String),

    /// A persisted record failed its integrity check.
    #[error("record digest mismatch for {key}: stored {stored}, computed {computed}")]
    DigestMismatch {
        key: String,
        stored: String,
        computed: String,
    },

    /// Record could not be parsed.
    #[error("malformed record: {0}")]
    Malformed(String),
}

/// Agreement between expected and observed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Agreement {
    /// Observed state matches expectation.
    Converged,

    /// States differ but the action is still within its grace period.
    Converging,

    /// States differ past the grace period; the observation wins.
    Diverged,
}

impl Agreement {
    /// Returns true if expected and observed state agree.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if the disagreement must be acted on.
    pub fn is_diverged(&self) -> bool {
        matches!(self, Self::Diverged)
    }
}

/// Classifies an expected/observed pair.
///
/// `acted_at` is when the scheduler initiated the transition; the pair is
/// only diverged once `acted_at + grace < now`.
pub fn classify<S: PartialEq>(
    expected: &S,
    observed: &S,
    acted_at: i64,
    grace: i64,
    now: i64,
) -> Agreement {
    if expected == observed {
        Agreement::Converged
    } else if acted_at.saturating_add(grace) < now {
        Agreement::Diverged
    } else {
        Agreement::Converging
    }
}

/// Backoff applied when the resource manager rejects a job start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferBackoff {
    /// Base defer duration in seconds.
    pub defer_time: i64,

    /// Start attempts tolerated before a defer hold is applied.
    pub defer_start_count: u32,
}

impl Default for DeferBackoff {
    fn default() -> Self {
        Self {
            defer_time: DEFAULT_DEFER_TIME,
            defer_start_count: DEFAULT_DEFER_START_COUNT,
        }
    }
}

impl DeferBackoff {
    /// Defer duration after `start_count` attempts: `defer_time * (1 + start_count)`.
    pub fn duration(&self, start_count: u32) -> i64 {
        self.defer_time
            .saturating_mul(1 + i64::from(start_count))
    }

    /// Returns true once enough attempts have failed to warrant a hold.
    pub fn should_hold(&self, start_count: u32) -> bool {
        start_count >= self.defer_start_count
    }
}

/// Retry tracker for repeated failures, keyed by object name.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Failures tolerated before the key is exhausted.
    max_retries: u32,

    /// Window in scheduler seconds.
    window: i64,

    /// key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, i64)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: i64) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure at `now`.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, key: &str, now: i64) -> bool {
        let (count, first) = self.failures.entry(key.to_string()).or_insert((0, now));

        if now - *first > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Number of failures currently counted for `key`.
    pub fn failures(&self, key: &str, now: i64) -> u32 {
        match self.failures.get(key) {
            Some((count, first)) if now - *first <= self.window => *count,
            _ => 0,
        }
    }

    /// Check if retries are exhausted for `key`.
    pub fn is_exhausted(&self, key: &str, now: i64) -> bool {
        self.failures(key, now) > self.max_retries
    }

    /// Clear failure tracking for `key` (on success).
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Prune entries whose window has passed.
    pub fn prune(&mut self, now: i64) {
        let window = self.window;
        self.failures.retain(|_, (_, first)| now - *first <= window);
    }
}

/// Digest of a persisted record, for corruption detection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordDigest(String);

impl RecordDigest {
    /// Digest of a record key plus its JSON value in canonical form.
    pub fn compute(key: &str, value: &serde_json::Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical_json(value).as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    /// Wraps a stored digest string.
    pub fn from_stored(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Verifies that `value` still hashes to this digest.
    pub fn verify(&self, key: &str, value: &serde_json::Value) -> Result<(), ReconcileError> {
        let computed = Self::compute(key, value);
        if &computed == self {
            Ok(())
        } else {
            Err(ReconcileError::DigestMismatch {
                key: key.to_string(),
                stored: self.0.clone(),
                computed: computed.0,
            })
        }
    }
}

impl std::fmt::Display for RecordDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::from(k.as_str()), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Default base defer time (1 hour).
pub const DEFAULT_DEFER_TIME: i64 = 60 * 60;

/// Default start attempts tolerated before a defer hold.
pub const DEFAULT_DEFER_START_COUNT: u32 = 1;

/// Default consecutive start failures before a job is held.
pub const DEFAULT_MAX_START_FAILURES: u32 = 3;

/// Default window for counting start failures (10 minutes).
pub const DEFAULT_START_FAILURE_WINDOW: i64 = 10 * 60;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("running", "running", 0, Agreement::Converged)]
    #[case("running", "idle", 90, Agreement::Converging)]
    #[case("running", "idle", 100, Agreement::Converging)]
    #[case("running", "idle", 101, Agreement::Diverged)]
    fn test_classify(
        #[case] expected: &str,
        #[case] observed: &str,
        #[case] now: i64,
        #[case] want: Agreement,
    ) {
        assert_eq!(classify(&expected, &observed, 40, 60, now), want);
    }

    #[rstest]
    #[case(0, 600)]
    #[case(1, 1200)]
    #[case(4, 3000)]
    fn test_defer_backoff_duration(#[case] start_count: u32, #[case] want: i64) {
        let backoff = DeferBackoff {
            defer_time: 600,
            defer_start_count: 2,
        };
        assert_eq!(backoff.duration(start_count), want);
    }

    #[test]
    fn test_defer_backoff_hold_threshold() {
        let backoff = DeferBackoff {
            defer_time: 600,
            defer_start_count: 2,
        };
        assert!(!backoff.should_hold(1));
        assert!(backoff.should_hold(2));
        assert!(backoff.should_hold(3));
    }

    #[test]
    fn test_digest_key_order_independent() {
        let a = serde_json::json!({"b": 2, "a": {"y": 1, "x": [1, 2]}});
        let b = serde_json::json!({"a": {"x": [1, 2], "y": 1}, "b": 2});
        assert_eq!(RecordDigest::compute("job/j1", &a), RecordDigest::compute("job/j1", &b));
    }

    #[test]
    fn test_digest_verify_detects_tamper() {
        let value = serde_json::json!({"start_count": 1});
        let digest = RecordDigest::compute("job/j1/sched", &value);
        assert!(digest.verify("job/j1/sched", &value).is_ok());

        let tampered = serde_json::json!({"start_count": 9});
        assert!(matches!(
            digest.verify("job/j1/sched", &tampered),
            Err(ReconcileError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_retry_tracker() {
        let mut tracker = RetryTracker::new(3, 60);

        assert!(!tracker.record_failure("j1", 0));
        assert!(!tracker.record_failure("j1", 10));
        assert!(!tracker.record_failure("j1", 20));
        assert!(tracker.record_failure("j1", 30));

        assert!(tracker.is_exhausted("j1", 30));
        assert!(!tracker.is_exhausted("j2", 30));

        tracker.clear("j1");
        assert!(!tracker.is_exhausted("j1", 30));
    }

    #[test]
    fn test_retry_tracker_window_resets() {
        let mut tracker = RetryTracker::new(1, 60);
        assert!(!tracker.record_failure("j1", 0));
        assert!(!tracker.record_failure("j1", 100));
        assert_eq!(tracker.failures("j1", 100), 1);

        tracker.prune(1_000);
        assert_eq!(tracker.failures("j1", 1_000), 0);
    }
}
