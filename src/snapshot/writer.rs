//! Snapshot writer with crash-safe install semantics.
//!
//! A save follows the write-fsync-rename pattern:
//! 1. Encode the point-in-time view to bytes.
//! 2. Write them to a sibling temp file (`<target>.tmp.<pid>.<nonce>`).
//! 3. `fsync` the temp file.
//! 4. Atomically rename over the target path.
//! 5. `fsync` the parent directory.
//!
//! Readers therefore only ever observe the previous snapshot or the complete
//! new one, never a partial file.

use crate::snapshot::codec::{self, EncodeError, EncodeOptions};
use crate::types::SnapshotEntry;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Distinguishes temp files of concurrent or crashed processes.
static TEMP_NONCE: AtomicU64 = AtomicU64::new(0);

/// Errors surfaced by a save attempt.
#[derive(Debug, Error)]
pub enum SaveError {
    /// Serialization failed; not transient.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// File I/O failed; the prior snapshot is untouched.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a completed save.
#[derive(Debug, Clone)]
pub struct SaveReport {
    /// Number of entries written.
    pub entries: u64,

    /// Final file size in bytes.
    pub file_size: u64,

    /// Wall time the save took.
    pub duration: Duration,
}

/// Writes snapshots of a point-in-time view to a fixed target path.
#[derive(Debug, Clone)]
pub struct Snapshotter {
    target: PathBuf,
    options: EncodeOptions,
}

impl Snapshotter {
    /// Create a snapshotter for the given target path.
    pub fn new(target: impl Into<PathBuf>, options: EncodeOptions) -> Self {
        Self {
            target: target.into(),
            options,
        }
    }

    /// Target path this snapshotter installs to.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Encode `entries` and durably install them at the target path.
    ///
    /// On any failure the temp file is removed best-effort and the previous
    /// snapshot, if one exists, remains intact.
    pub fn save(&self, entries: &[SnapshotEntry]) -> Result<SaveReport, SaveError> {
        let started = Instant::now();
        let bytes = codec::encode(entries, &self.options)?;

        let temp_path = self.temp_path();
        debug!(path = %temp_path.display(), bytes = bytes.len(), "Writing snapshot temp file");

        if let Err(e) = self.install(&temp_path, &bytes) {
            if let Err(cleanup) = std::fs::remove_file(&temp_path) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %temp_path.display(), error = %cleanup, "Failed to remove temp file");
                }
            }
            return Err(SaveError::Io(e));
        }

        Ok(SaveReport {
            entries: entries.len() as u64,
            file_size: bytes.len() as u64,
            duration: started.elapsed(),
        })
    }

    fn install(&self, temp_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(temp_path, &self.target)?;

        // Rename alone does not guarantee the directory entry is durable.
        if let Some(dir) = self.target.parent() {
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let nonce = TEMP_NONCE.fetch_add(1, Ordering::Relaxed);
        let file_name = self
            .target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".to_string());
        self.target.with_file_name(format!(
            "{}.tmp.{}.{}",
            file_name,
            std::process::id(),
            nonce
        ))
    }
}
