//! # backupstore
//!
//! Deduplicating, content-addressed backup store for block-addressable
//! volumes.
//!
//! A volume manager hands the engine a set of changed `(offset, data)`
//! extents; the engine splits them into fixed-size blocks, stores each
//! distinct block exactly once on a pluggable storage backend, and publishes
//! an immutable backup record mapping logical offsets to block checksums.
//! Restore replays any record into a byte-identical stream, zero-filling
//! unmapped ranges. Blocks are shared across backups and reclaimed by
//! reference-counted garbage collection once nothing maps to them.
//!
//! ## Features
//!
//! - **Content addressing**: blocks keyed by BLAKE3 checksum, written once
//! - **Incremental backups**: each record merges the prior mapping and is
//!   self-sufficient at restore time
//! - **Pluggable backends**: one [`BackupStoreDriver`] trait, any backend
//! - **Integrity**: every fetched block is re-checksummed before use
//! - **Garbage collection**: reference-counted, deferred, check-then-delete
//!
//! ## Quick start
//!
//! ```rust
//! use backupstore::{BackupEngine, BackupExtent, BackupSpec, BackupStoreConfig, MemoryDriver};
//! use chrono::Utc;
//!
//! # fn main() -> backupstore::Result<()> {
//! let driver = MemoryDriver::new();
//! let engine = BackupEngine::new(BackupStoreConfig::default());
//!
//! let spec = BackupSpec {
//!     volume: "vol1".to_string(),
//!     backup_name: None,
//!     snapshot_name: "snap1".to_string(),
//!     snapshot_created_at: Utc::now(),
//!     volume_size: 16 * 1024 * 1024,
//!     labels: Default::default(),
//! };
//! let extents = vec![BackupExtent { offset: 0, data: vec![7; 4096] }];
//! let backup = engine.create_backup(&spec, extents, &driver)?;
//! println!("published {}", backup.name);
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod block;
pub mod config;
pub mod driver;
pub mod error;
pub mod locator;
pub mod metadata;
pub mod restore;
pub mod volume;

// Re-export commonly used types
pub use backup::{BackupEngine, BackupExtent, BackupSpec};
pub use block::{BlockChecksum, BlockStore, GcStats};
pub use config::{BackupStoreConfig, RetryConfig, DEFAULT_BASE, DEFAULT_BLOCK_SIZE};
pub use driver::{with_retries, BackupStoreDriver, MemoryDriver};
pub use error::{Error, Result};
pub use locator::{decode_backup_locator, encode_backup_locator, validate_name, MAX_NAME_LEN};
pub use metadata::{
    Backup, BackupContent, BackupFile, BackupIter, BackupSummary, BlockMapping, MetadataStore,
};
pub use restore::{RestoreEngine, RestoreSummary};
pub use volume::{Volume, VolumeRegistry};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
