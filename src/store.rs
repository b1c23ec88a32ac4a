//! In-memory key-value store.
//!
//! The persistence core only relies on three things from the store: a
//! point-in-time [`snapshot`](Store::snapshot), an atomic
//! [`restore`](Store::restore), and the shared change counter bumped by every
//! mutation. The rest of the API is the minimal surface the command layer
//! needs to exercise those paths.

use crate::types::{now_ms, SnapshotEntry, Value};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Stored {
    value: Value,
    expires_at_ms: Option<i64>,
}

impl Stored {
    fn is_expired_at(&self, now: i64) -> bool {
        matches!(self.expires_at_ms, Some(at) if at <= now)
    }
}

/// Shared in-memory store with lazy expiry on read.
pub struct Store {
    entries: RwLock<HashMap<Bytes, Stored>>,

    /// Mutations since the last successful save. Shared with the
    /// persistence manager, which subtracts on save completion.
    changes: Arc<AtomicU64>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            changes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handle to the change counter, shared with the persistence manager.
    pub fn change_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.changes)
    }

    fn mark_dirty(&self) {
        self.changes.fetch_add(1, Ordering::Relaxed);
    }

    /// Insert or replace a key without expiry.
    pub fn set(&self, key: impl Into<Bytes>, value: Value) {
        self.entries.write().insert(
            key.into(),
            Stored {
                value,
                expires_at_ms: None,
            },
        );
        self.mark_dirty();
    }

    /// Insert or replace a key with an absolute expiry in Unix milliseconds.
    pub fn set_with_expiry(&self, key: impl Into<Bytes>, value: Value, expires_at_ms: i64) {
        self.entries.write().insert(
            key.into(),
            Stored {
                value,
                expires_at_ms: Some(expires_at_ms),
            },
        );
        self.mark_dirty();
    }

    /// Look up a key, removing it if it has expired.
    pub fn get(&self, key: &[u8]) -> Option<Value> {
        let now = now_ms();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(stored) if !stored.is_expired_at(now) => return Some(stored.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: upgrade to a write lock and evict.
        let mut entries = self.entries.write();
        if let Some(stored) = entries.get(key) {
            if stored.is_expired_at(now) {
                entries.remove(key);
            } else {
                return Some(stored.value.clone());
            }
        }
        None
    }

    /// Remove a key. Returns true if it existed and was live.
    pub fn delete(&self, key: &[u8]) -> bool {
        let now = now_ms();
        let removed = match self.entries.write().remove(key) {
            Some(stored) => !stored.is_expired_at(now),
            None => return false,
        };
        self.mark_dirty();
        removed
    }

    /// Set an absolute expiry on an existing live key.
    pub fn expire_at(&self, key: &[u8], expires_at_ms: i64) -> bool {
        let now = now_ms();
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(stored) if !stored.is_expired_at(now) => {
                stored.expires_at_ms = Some(expires_at_ms);
                drop(entries);
                self.mark_dirty();
                true
            }
            _ => false,
        }
    }

    /// Remove all keys.
    pub fn clear(&self) {
        self.entries.write().clear();
        self.mark_dirty();
    }

    /// Number of keys, counting expired-but-unevicted ones.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Capture a point-in-time view of all live entries.
    ///
    /// Holds the read lock only for the duration of the clone; the returned
    /// vector is the consistent cut the snapshotter serializes. Keys already
    /// expired at capture time are skipped.
    pub fn snapshot(&self) -> Vec<SnapshotEntry> {
        let now = now_ms();
        self.entries
            .read()
            .iter()
            .filter(|(_, stored)| !stored.is_expired_at(now))
            .map(|(key, stored)| SnapshotEntry {
                key: key.clone(),
                value: stored.value.clone(),
                expires_at_ms: stored.expires_at_ms,
            })
            .collect()
    }

    /// Atomically replace the entire contents with the given entries.
    pub fn restore(&self, entries: Vec<SnapshotEntry>) {
        let mut map = HashMap::with_capacity(entries.len());
        for entry in entries {
            map.insert(
                entry.key,
                Stored {
                    value: entry.value,
                    expires_at_ms: entry.expires_at_ms,
                },
            );
        }
        *self.entries.write() = map;
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("len", &self.len())
            .field("pending_changes", &self.changes.load(Ordering::Relaxed))
            .finish()
    }
}
