//! Snapshot persistence: codec, writer, recovery, and the policy manager.
//!
//! This module turns the live dataset into durable point-in-time snapshot
//! files and back. Key properties:
//!
//! - Explicit per-variant binary encoding with gzip compression and a CRC32
//!   integrity trailer
//! - Crash-safe installs via write-fsync-rename, so the snapshot path never
//!   holds a partial file
//! - A non-blocking background save worker, at most one at a time
//! - Rule-based automatic saves driven by a mutation counter
//! - All-or-nothing recovery that drops expired keys and tolerates corrupt
//!   files by starting empty
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PersistenceManager                       │
//! │  ┌───────────────┐  ┌────────────────┐  ┌───────────────┐   │
//! │  │  Snapshotter  │  │ RecoveryLoader │  │  policy loop  │   │
//! │  │ (save/install)│  │   (startup)    │  │  (triggers)   │   │
//! │  └───────┬───────┘  └───────┬────────┘  └───────────────┘   │
//! │          │                  │                               │
//! │          ▼                  ▼                               │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                     File Format                     │    │
//! │  │  "REDIS" + version/flags + payload (gzip) + CRC32   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod format;
pub mod manager;
pub mod recovery;
pub mod writer;

pub use codec::{Checksum, Compression, EncodeError, EncodeOptions};
pub use format::{DecodeError, SnapshotHeader, FLAG_CHECKSUMED, FLAG_COMPRESSED, HEADER_SIZE, MAGIC};
pub use manager::{Lifecycle, PersistenceManager, SnapshotFileInfo, BGSAVE_STARTED};
pub use recovery::{RecoveryLoader, RecoveryOutcome};
pub use writer::{SaveError, SaveReport, Snapshotter};
