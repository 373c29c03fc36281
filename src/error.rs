//! Error types for the backup store

use thiserror::Error;

/// Main error type for backup store operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid name: {name:?}")]
    InvalidName { name: String },

    #[error("Invalid locator {locator:?}: {reason}")]
    InvalidLocator { locator: String, reason: String },

    #[error("Invalid extent at offset {offset}: not aligned to the block size")]
    InvalidExtent { offset: u64 },

    #[error("Volume not found: {volume}")]
    VolumeNotFound { volume: String },

    #[error("Backup not found: {backup} in volume {volume}")]
    BackupNotFound { volume: String, backup: String },

    #[error("Block not found: {checksum}")]
    BlockNotFound { checksum: String },

    #[error("Not found: {path}")]
    NotFound { path: String },

    #[error("Corrupt record at {path}: {reason}")]
    CorruptRecord { path: String, reason: String },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Already exists: {path}")]
    AlreadyExists { path: String },

    #[error("Driver error at {path}: {reason}")]
    Driver { path: String, reason: String },
}

impl Error {
    /// True for any of the not-found variants, at whichever level.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::VolumeNotFound { .. }
                | Error::BackupNotFound { .. }
                | Error::BlockNotFound { .. }
                | Error::NotFound { .. }
        )
    }

    /// Transient driver failures are the only errors eligible for retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Driver { .. })
    }
}

/// Result type alias for backup store operations
pub type Result<T> = std::result::Result<T, Error>;
