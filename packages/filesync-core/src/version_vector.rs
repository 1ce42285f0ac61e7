//! Per-file version vectors.
//!
//! A version vector maps client ids to monotonically increasing counters and
//! is the sole input to conflict detection: an edit built on top of
//! everything the server has seen *dominates* the server's vector; two edits
//! neither of which saw the other are *concurrent*.
//!
//! The embedded wall-clock timestamp is advisory only (display, debugging)
//! and never participates in comparison; equality and dominance are defined
//! purely over the counters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved pseudo-client id used by the server when it merges vectors
/// during conflict resolution, forcing a strict successor.
pub const SERVER_CLIENT_ID: &str = "server";

/// A per-file causal clock.
///
/// Wire form is a stable JSON object:
/// `{"vectors": {"<client_id>": <counter>, ...}, "timestamp": "<ISO-8601>"}`.
/// A missing `timestamp` is tolerated on deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionVector {
    /// client id → counter. BTreeMap keeps the serialized form stable.
    #[serde(rename = "vectors")]
    counters: BTreeMap<String, u64>,

    /// Advisory wall-clock stamp of the last mutation.
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

impl Default for VersionVector {
    fn default() -> Self {
        Self::new()
    }
}

/// Equality is defined over the counters only; the advisory timestamp is
/// ignored. An absent key compares equal to a zero counter.
impl PartialEq for VersionVector {
    fn eq(&self, other: &Self) -> bool {
        self.dominates(other) && other.dominates(self)
    }
}

impl Eq for VersionVector {}

impl VersionVector {
    /// Create an empty (zero) vector.
    pub fn new() -> Self {
        Self {
            counters: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create a vector with a single counter already incremented, the shape
    /// the server assigns to a freshly created file.
    pub fn initial(client_id: &str) -> Self {
        let mut vector = Self::new();
        vector.increment(client_id);
        vector
    }

    /// Bump the counter for one client.
    pub fn increment(&mut self, client_id: &str) {
        *self.counters.entry(client_id.to_string()).or_insert(0) += 1;
        self.timestamp = Utc::now();
    }

    /// Read a counter; absent keys read as 0.
    pub fn get(&self, client_id: &str) -> u64 {
        self.counters.get(client_id).copied().unwrap_or(0)
    }

    /// True iff every component of `self` is ≥ the corresponding component
    /// of `other`. Every vector dominates the empty vector and itself.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other
            .counters
            .iter()
            .all(|(client, counter)| self.get(client) >= *counter)
    }

    /// True iff neither vector dominates the other.
    pub fn concurrent_with(&self, other: &VersionVector) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Pointwise maximum, as a new vector.
    pub fn merge(&self, other: &VersionVector) -> VersionVector {
        let mut merged = self.counters.clone();
        for (client, counter) in &other.counters {
            let entry = merged.entry(client.clone()).or_insert(0);
            *entry = (*entry).max(*counter);
        }
        VersionVector {
            counters: merged,
            timestamp: Utc::now(),
        }
    }

    /// True iff no counter has ever been incremented.
    pub fn is_empty(&self) -> bool {
        self.counters.values().all(|c| *c == 0)
    }

    /// The advisory timestamp of the last mutation.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Iterate over `(client_id, counter)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counters.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl std::fmt::Display for VersionVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (client, counter)) in self.counters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", client, counter)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(entries: &[(&str, u64)]) -> VersionVector {
        let mut v = VersionVector::new();
        for (client, counter) in entries {
            for _ in 0..*counter {
                v.increment(client);
            }
        }
        v
    }

    #[test]
    fn test_increment_and_get() {
        let mut v = VersionVector::new();
        assert_eq!(v.get("a"), 0);

        v.increment("a");
        v.increment("a");
        v.increment("b");

        assert_eq!(v.get("a"), 2);
        assert_eq!(v.get("b"), 1);
        assert_eq!(v.get("missing"), 0);
    }

    #[test]
    fn test_dominance_is_reflexive() {
        let v = vector(&[("a", 2), ("b", 1)]);
        assert!(v.dominates(&v));
        assert!(!v.concurrent_with(&v));
    }

    #[test]
    fn test_everything_dominates_empty() {
        let empty = VersionVector::new();
        let v = vector(&[("a", 1)]);

        assert!(v.dominates(&empty));
        assert!(empty.dominates(&empty));
        assert!(!empty.dominates(&v));
    }

    #[test]
    fn test_strict_dominance() {
        let older = vector(&[("a", 1)]);
        let newer = vector(&[("a", 2)]);

        assert!(newer.dominates(&older));
        assert!(!older.dominates(&newer));
        assert!(!newer.concurrent_with(&older));
    }

    #[test]
    fn test_concurrent_vectors() {
        let left = vector(&[("a", 2), ("b", 1)]);
        let right = vector(&[("a", 1), ("b", 2)]);

        assert!(left.concurrent_with(&right));
        assert!(right.concurrent_with(&left));
        assert!(!left.dominates(&right));
        assert!(!right.dominates(&left));
    }

    #[test]
    fn test_exactly_one_relation_holds() {
        // For any pair, exactly one of: a>b, b>a, a==b, concurrent.
        let cases = vec![
            (vector(&[("a", 2)]), vector(&[("a", 1)])),
            (vector(&[("a", 1)]), vector(&[("a", 1)])),
            (vector(&[("a", 1), ("b", 2)]), vector(&[("a", 2), ("b", 1)])),
            (vector(&[]), vector(&[("a", 1)])),
        ];

        for (a, b) in cases {
            let strictly_a = a.dominates(&b) && !b.dominates(&a);
            let strictly_b = b.dominates(&a) && !a.dominates(&b);
            let equal = a == b;
            let concurrent = a.concurrent_with(&b);

            let holds = [strictly_a, strictly_b, equal, concurrent]
                .iter()
                .filter(|x| **x)
                .count();
            assert_eq!(holds, 1, "a={} b={}", a, b);
        }
    }

    #[test]
    fn test_merge_is_an_upper_bound() {
        let left = vector(&[("a", 3), ("b", 1)]);
        let right = vector(&[("a", 1), ("b", 2), ("c", 5)]);

        let merged = left.merge(&right);

        assert!(merged.dominates(&left));
        assert!(merged.dominates(&right));
        assert_eq!(merged.get("a"), 3);
        assert_eq!(merged.get("b"), 2);
        assert_eq!(merged.get("c"), 5);
    }

    #[test]
    fn test_merge_then_increment_is_strict_successor() {
        let server = vector(&[("a", 2)]);
        let client = vector(&[("a", 1), ("b", 1)]);

        let mut merged = server.merge(&client);
        merged.increment(SERVER_CLIENT_ID);

        assert!(merged.dominates(&server) && !server.dominates(&merged));
        assert!(merged.dominates(&client) && !client.dominates(&merged));
    }

    #[test]
    fn test_equality_ignores_timestamp() {
        let a = vector(&[("a", 1)]);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = vector(&[("a", 1)]);

        assert_eq!(a, b);
    }

    #[test]
    fn test_serialization_round_trip() {
        let v = vector(&[("client-a", 2), ("client-b", 7)]);
        let json = serde_json::to_string(&v).unwrap();

        assert!(json.contains("\"vectors\""));
        assert!(json.contains("\"timestamp\""));

        let parsed: VersionVector = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, v);
    }

    #[test]
    fn test_deserialization_tolerates_missing_timestamp() {
        let parsed: VersionVector =
            serde_json::from_str(r#"{"vectors":{"a":3}}"#).unwrap();
        assert_eq!(parsed.get("a"), 3);
    }

    #[test]
    fn test_display() {
        let v = vector(&[("a", 1), ("b", 2)]);
        assert_eq!(v.to_string(), "{a:1, b:2}");
    }
}
