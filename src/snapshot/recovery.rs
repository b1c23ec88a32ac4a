//! Startup recovery from a snapshot file.

use crate::snapshot::codec;
use crate::snapshot::format::DecodeError;
use crate::store::Store;
use crate::types::now_ms;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Result of a recovery attempt. Never an error: the caller decides policy.
#[derive(Debug)]
pub enum RecoveryOutcome {
    /// No snapshot file on disk; the store is left empty.
    NoFile,

    /// Snapshot restored; holds the number of live keys loaded.
    Restored(usize),

    /// The file exists but could not be decoded; the store is left empty.
    Corrupted(DecodeError),
}

/// Loads a snapshot file back into the store.
#[derive(Debug, Clone)]
pub struct RecoveryLoader {
    path: PathBuf,
}

impl RecoveryLoader {
    /// Create a loader for the given snapshot path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot path this loader reads from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate the snapshot file and restore it into `store`.
    ///
    /// Entries already expired at restore time are dropped. Corruption is
    /// handled locally: it is logged, the store stays empty, and the server
    /// keeps running. The restore is all-or-nothing.
    pub fn recover(&self, store: &Store) -> RecoveryOutcome {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No snapshot file found, starting empty");
                return RecoveryOutcome::NoFile;
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to read snapshot file");
                return RecoveryOutcome::Corrupted(DecodeError::Malformed(
                    "snapshot file unreadable",
                ));
            }
        };

        let entries = match codec::decode(&bytes) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Corrupt snapshot, starting empty");
                return RecoveryOutcome::Corrupted(e);
            }
        };

        let now = now_ms();
        let total = entries.len();
        let live: Vec<_> = entries
            .into_iter()
            .filter(|entry| !entry.is_expired_at(now))
            .collect();
        let kept = live.len();

        store.restore(live);

        info!(
            path = %self.path.display(),
            total,
            kept,
            expired = total - kept,
            "Snapshot restored"
        );
        RecoveryOutcome::Restored(kept)
    }
}
