//! Snapshot persistence core for a Redis-compatible in-memory key-value
//! server.
//!
//! This crate provides the durability layer such a server builds on:
//!
//! - **Codec**: explicit binary serialization of the dataset with gzip
//!   compression and a CRC32 integrity trailer
//! - **Snapshotter**: crash-safe snapshot writes (write-fsync-rename, so the
//!   snapshot path never holds a partial file)
//! - **RecoveryLoader**: all-or-nothing startup restore that filters expired
//!   keys and survives corrupt files by starting empty
//! - **PersistenceManager**: mutation accounting, rule-based automatic
//!   background saves, and the SAVE / BGSAVE / LASTSAVE command surface
//!
//! The network listener, RESP codec, and command dispatch are external
//! collaborators; they talk to this crate through [`PersistenceManager`] and
//! the [`Store`] snapshot/restore interface.
//!
//! # Example
//!
//! ```rust,no_run
//! use redsnap::{PersistenceConfig, PersistenceManager, Store, Value};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> redsnap::Result<()> {
//!     let store = Arc::new(Store::new());
//!     let config = PersistenceConfig::new("./data");
//!     let manager = Arc::new(PersistenceManager::new(config, store.clone())?);
//!
//!     // Restore whatever the last run left behind, then start the
//!     // automatic-save policy loop.
//!     manager.recover();
//!     manager.start();
//!
//!     store.set("greeting", Value::from("hello"));
//!     manager.save().await?;
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod snapshot;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use config::{PersistenceConfig, SaveRule};
pub use error::{Error, Result};
pub use snapshot::{
    DecodeError, EncodeError, EncodeOptions, Lifecycle, PersistenceManager, RecoveryLoader,
    RecoveryOutcome, SaveError, SaveReport, SnapshotFileInfo, Snapshotter, BGSAVE_STARTED,
};
pub use store::Store;
pub use types::{SnapshotEntry, Value};
