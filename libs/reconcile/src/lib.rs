//! Reconciliation loop primitives.
//!
//! Helpers shared by the provisioning, consolidation and termination loops:
//!
//! - **Backoff**: exponential delay with jitter between retries of a
//!   cloud-provider call.
//! - **Retry tracking**: bounded attempts per resource within a window.
//! - **Fingerprints**: stable hashes over canonical JSON, used to detect
//!   node-pool drift and to identify placement plans across retries.
//! - **Disruption ordering**: deterministic ordering of nodes to disrupt.
//!
//! # Invariants
//!
//! - Fingerprints depend only on content, never on key order
//! - Orderings are total and deterministic given the same inputs

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The value could not be converted to canonical JSON.
    #[error("fingerprint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

// =============================================================================
// Backoff
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(30) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

// =============================================================================
// Retry Tracking
// =============================================================================

/// Retry tracker for failed operations, keyed by resource.
#[derive(Debug, Clone)]
pub struct RetryTracker<K> {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: key -> (count, first_failure_time).
    failures: BTreeMap<K, (u32, Instant)>,
}

impl<K: Ord + Clone> RetryTracker<K> {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, key: &K) -> bool {
        self.record_failure_at(key, Instant::now())
    }

    /// Record a failure observed at `now`.
    pub fn record_failure_at(&mut self, key: &K, now: Instant) -> bool {
        let (count, first) = self.failures.entry(key.clone()).or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Check if retries are exhausted for a resource.
    pub fn is_exhausted(&self, key: &K) -> bool {
        let Some((count, first)) = self.failures.get(key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Number of failures currently counted for a resource.
    pub fn failures(&self, key: &K) -> u32 {
        self.failures.get(key).map(|(count, _)| *count).unwrap_or(0)
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

// =============================================================================
// Fingerprints
// =============================================================================

/// A content hash for deterministic comparison.
///
/// Used to detect when a node pool's spec has changed since a node was
/// launched from it, and to identify placement plans.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, serde::Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute a fingerprint from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    /// Compute a fingerprint of any serializable value.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, ReconcileError> {
        Ok(Self::from_json(&serde_json::to_value(value)?))
    }

    /// Wrap an already computed fingerprint string.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Get the fingerprint string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
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

// =============================================================================
// Disruption Ordering
// =============================================================================

/// Why a node is being disrupted. Lower values are handled first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisruptionPriority {
    /// Node holds no reschedulable pods.
    Empty = 0,

    /// Node outlived its pool's expiry.
    Expired = 1,

    /// Node no longer matches its pool's spec.
    Drifted = 2,

    /// Node can be removed or replaced to reduce cost.
    Underutilized = 3,
}

impl std::fmt::Display for DisruptionPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisruptionPriority::Empty => "empty",
            DisruptionPriority::Expired => "expired",
            DisruptionPriority::Drifted => "drifted",
            DisruptionPriority::Underutilized => "underutilized",
        };
        write!(f, "{}", s)
    }
}

/// Order items for disruption.
///
/// Items are sorted by priority, then by ascending cost (cheapest to disrupt
/// first), then by the tie-break key so the order is total.
pub fn order_for_disruption<T, K, F>(items: Vec<T>, key: F) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> (DisruptionPriority, f64, K),
{
    let mut keyed: Vec<_> = items.into_iter().map(|i| (key(&i), i)).collect();
    keyed.sort_by(|((pa, ca, ka), _), ((pb, cb, kb), _)| {
        pa.cmp(pb)
            .then_with(|| ca.total_cmp(cb))
            .then_with(|| ka.cmp(kb))
    });
    keyed.into_iter().map(|(_, i)| i).collect()
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Default retry limit per resource.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_fingerprint_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": {"y": [1, 2], "x": "q"}});
        let json2 = serde_json::json!({"a": {"x": "q", "y": [1, 2]}, "b": 2});

        assert_eq!(Fingerprint::from_json(&json1), Fingerprint::from_json(&json2));
    }

    #[test]
    fn test_fingerprint_differs_on_content() {
        let a = Fingerprint::from_json(&serde_json::json!({"zone": "a"}));
        let b = Fingerprint::from_json(&serde_json::json!({"zone": "b"}));
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_fingerprint_escapes_keys() {
        let a = Fingerprint::from_json(&serde_json::json!({"a\"b": 1}));
        let b = Fingerprint::from_json(&serde_json::json!({"a": 1}));
        assert_ne!(a, b);
    }

    #[rstest]
    #[case(0, 400, 600)]
    #[case(1, 800, 1200)]
    #[case(2, 1600, 2400)]
    fn test_backoff_grows(#[case] attempt: u32, #[case] min_ms: u64, #[case] max_ms: u64) {
        let policy = BackoffPolicy {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.2,
        };
        let delay = policy.delay(attempt);
        assert!(delay >= Duration::from_millis(min_ms), "{delay:?}");
        assert!(delay <= Duration::from_millis(max_ms), "{delay:?}");
    }

    #[test]
    fn test_backoff_max() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_tracker() {
        let mut tracker = RetryTracker::new(3, Duration::from_secs(60));
        let key = "node-1".to_string();

        assert!(!tracker.record_failure(&key)); // 1st
        assert!(!tracker.record_failure(&key)); // 2nd
        assert!(!tracker.record_failure(&key)); // 3rd
        assert!(tracker.record_failure(&key)); // 4th - exhausted

        assert!(tracker.is_exhausted(&key));
        assert!(!tracker.is_exhausted(&"node-2".to_string()));
        assert_eq!(tracker.failures(&key), 4);

        tracker.clear(&key);
        assert!(!tracker.is_exhausted(&key));
    }

    #[test]
    fn test_retry_tracker_window_reset() {
        let mut tracker = RetryTracker::new(1, Duration::from_secs(10));
        let start = Instant::now();

        assert!(!tracker.record_failure_at(&1u32, start));
        assert!(tracker.record_failure_at(&1u32, start + Duration::from_secs(1)));
        // Outside the window the count starts over
        assert!(!tracker.record_failure_at(&1u32, start + Duration::from_secs(30)));
    }

    #[test]
    fn test_order_for_disruption() {
        let items = vec![
            ("c", DisruptionPriority::Underutilized, 1.0),
            ("b", DisruptionPriority::Empty, 5.0),
            ("a", DisruptionPriority::Underutilized, 1.0),
            ("d", DisruptionPriority::Drifted, 0.5),
        ];

        let ordered = order_for_disruption(items, |(name, p, cost)| (*p, *cost, *name));
        let names: Vec<_> = ordered.iter().map(|(n, _, _)| *n).collect();
        assert_eq!(names, vec!["b", "d", "a", "c"]);
    }
}
