//! Error types for the persistence core.

use crate::snapshot::format::DecodeError;
use crate::snapshot::writer::SaveError;
use thiserror::Error;

/// Result type alias for persistence operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type surfaced to the command layer.
#[derive(Error, Debug)]
pub enum Error {
    /// A synchronous or background save failed.
    #[error("save error: {0}")]
    Save(#[from] SaveError),

    /// The snapshot file could not be decoded.
    #[error("corrupted snapshot: {0}")]
    Corrupted(#[from] DecodeError),

    /// A background save is already running.
    #[error("background save already in progress")]
    AlreadyInProgress,

    /// The manager is draining or stopped and no longer accepts commands.
    #[error("persistence manager is not running")]
    NotRunning,

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// I/O outside the save path, e.g. creating the data directory.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
