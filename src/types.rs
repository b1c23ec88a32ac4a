//! Core value types shared by the store and the snapshot codec.

use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

/// A stored value. The snapshot codec dispatches on the variant tag; adding a
/// variant is a format change and must bump the on-disk version.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Binary-safe string.
    Str(Bytes),

    /// Signed 64-bit integer.
    Int(i64),

    /// Ordered sequence of byte strings.
    List(Vec<Bytes>),

    /// Set of byte strings.
    Set(BTreeSet<Bytes>),

    /// Field to value mapping.
    Hash(BTreeMap<Bytes, Bytes>),

    /// Member to score mapping.
    SortedSet(BTreeMap<Bytes, f64>),
}

impl Value {
    /// Short type name, matching what the command layer reports for TYPE.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) | Value::Int(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Hash(_) => "hash",
            Value::SortedSet(_) => "zset",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

/// A single key in a point-in-time snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    /// Entry key.
    pub key: Bytes,

    /// Entry value.
    pub value: Value,

    /// Absolute expiry in milliseconds since the Unix epoch, if any.
    pub expires_at_ms: Option<i64>,
}

impl SnapshotEntry {
    /// Create an entry without expiry.
    pub fn new(key: impl Into<Bytes>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            expires_at_ms: None,
        }
    }

    /// Create an entry with an absolute expiry.
    pub fn with_expiry(key: impl Into<Bytes>, value: Value, expires_at_ms: i64) -> Self {
        Self {
            key: key.into(),
            value,
            expires_at_ms: Some(expires_at_ms),
        }
    }

    /// Whether the entry is expired at `now_ms`.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        matches!(self.expires_at_ms, Some(at) if at <= now_ms)
    }
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Current wall clock in whole seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
