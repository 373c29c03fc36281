//! Content-addressed block store with reference counting
//!
//! Blocks are fixed-size pieces of volume data keyed by the BLAKE3 checksum
//! of their content, stored under `{base}/blocks/` sharded by checksum
//! prefix. Each block carries a persisted reference count in a sidecar
//! object; blocks at zero are reclaimed by [`BlockStore::garbage_collect`].

use crate::config::{BackupStoreConfig, RetryConfig};
use crate::driver::{with_retries, BackupStoreDriver};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, info, warn};

const BLOCK_SUFFIX: &str = ".blk";
const REFCOUNT_SUFFIX: &str = ".ref";

/// A content-addressed block identified by its BLAKE3 checksum
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockChecksum(pub String);

impl BlockChecksum {
    /// Wrap an already-computed checksum string
    pub fn new(checksum: String) -> Self {
        Self(checksum)
    }

    /// Get the checksum as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checksum raw bytes with BLAKE3
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(blake3::hash(data).to_hex().to_string())
    }
}

impl std::fmt::Display for BlockChecksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of one garbage collection pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Blocks inspected
    pub scanned: usize,
    /// Blocks removed at zero reference count
    pub removed: usize,
    /// Blocks kept alive by at least one reference
    pub live: usize,
}

/// Content-addressed repository of fixed-size data blocks.
///
/// `put_block` is write-once-if-absent and therefore idempotent; reference
/// counts change only when a backup mapping is committed or deleted, never
/// on block write.
#[derive(Debug)]
pub struct BlockStore {
    base: String,
    retry: RetryConfig,
    // orders count updates in-process; multi-process deployments rely on the
    // backend's conditional-write guarantee
    refcount_lock: Mutex<()>,
    // a single collector at a time
    gc_lock: Mutex<()>,
}

impl BlockStore {
    pub fn new(config: &BackupStoreConfig) -> Self {
        Self {
            base: config.base.clone(),
            retry: config.retry.clone(),
            refcount_lock: Mutex::new(()),
            gc_lock: Mutex::new(()),
        }
    }

    fn blocks_root(&self) -> String {
        format!("{}/blocks", self.base)
    }

    // shard by the first two checksum characters to bound directory fan-out
    fn shard_path(&self, checksum: &BlockChecksum) -> String {
        format!("{}/{}", self.blocks_root(), &checksum.as_str()[..2])
    }

    pub(crate) fn block_path(&self, checksum: &BlockChecksum) -> String {
        format!("{}/{}{}", self.shard_path(checksum), checksum, BLOCK_SUFFIX)
    }

    fn refcount_path(&self, checksum: &BlockChecksum) -> String {
        format!("{}/{}{}", self.shard_path(checksum), checksum, REFCOUNT_SUFFIX)
    }

    /// Store a block, deduplicating against existing content.
    ///
    /// Returns the checksum and whether bytes were transferred. A dedup hit
    /// transfers nothing; a retried write after a crash never resets an
    /// existing reference count.
    pub fn put_block(
        &self,
        data: &[u8],
        driver: &dyn BackupStoreDriver,
    ) -> Result<(BlockChecksum, bool)> {
        let checksum = BlockChecksum::from_bytes(data);
        let block_path = self.block_path(&checksum);

        if driver.exists(&block_path) {
            debug!("dedup hit for block {}", checksum);
            return Ok((checksum, false));
        }

        // TODO: optional compression of block content before write
        with_retries(&self.retry, "block write", || driver.write(&block_path, data))?;

        let refcount_path = self.refcount_path(&checksum);
        if !driver.exists(&refcount_path) {
            with_retries(&self.retry, "refcount init", || {
                driver.write(&refcount_path, b"0")
            })?;
        }

        debug!("stored block {} ({} bytes)", checksum, data.len());
        Ok((checksum, true))
    }

    /// Fetch a block and verify its content against its name.
    pub fn get_block(
        &self,
        checksum: &BlockChecksum,
        driver: &dyn BackupStoreDriver,
    ) -> Result<Vec<u8>> {
        let path = self.block_path(checksum);
        let data = with_retries(&self.retry, "block read", || driver.read(&path)).map_err(|e| {
            if e.is_not_found() {
                Error::BlockNotFound {
                    checksum: checksum.to_string(),
                }
            } else {
                e
            }
        })?;

        let actual = BlockChecksum::from_bytes(&data);
        if actual != *checksum {
            return Err(Error::ChecksumMismatch {
                expected: checksum.to_string(),
                actual: actual.to_string(),
            });
        }

        Ok(data)
    }

    /// Check if a block exists in the store
    pub fn has_block(&self, checksum: &BlockChecksum, driver: &dyn BackupStoreDriver) -> bool {
        driver.exists(&self.block_path(checksum))
    }

    fn read_ref_count(
        &self,
        checksum: &BlockChecksum,
        driver: &dyn BackupStoreDriver,
    ) -> Result<u64> {
        let path = self.refcount_path(checksum);
        let data = match driver.read(&path) {
            Ok(data) => data,
            Err(e) if e.is_not_found() => return Ok(0),
            Err(e) => return Err(e),
        };
        let text = String::from_utf8_lossy(&data);
        text.trim().parse().map_err(|_| Error::CorruptRecord {
            path,
            reason: format!("unparseable reference count {:?}", text),
        })
    }

    fn write_ref_count(
        &self,
        checksum: &BlockChecksum,
        count: u64,
        driver: &dyn BackupStoreDriver,
    ) -> Result<()> {
        let path = self.refcount_path(checksum);
        with_retries(&self.retry, "refcount write", || {
            driver.write(&path, count.to_string().as_bytes())
        })
    }

    /// Current reference count; zero for blocks without a committed mapping.
    pub fn ref_count(
        &self,
        checksum: &BlockChecksum,
        driver: &dyn BackupStoreDriver,
    ) -> Result<u64> {
        self.read_ref_count(checksum, driver)
    }

    /// Record one more backup mapping to this block.
    pub fn increment_ref(
        &self,
        checksum: &BlockChecksum,
        driver: &dyn BackupStoreDriver,
    ) -> Result<u64> {
        let _guard = self.refcount_lock.lock().expect("refcount lock poisoned");
        if !self.has_block(checksum, driver) {
            return Err(Error::BlockNotFound {
                checksum: checksum.to_string(),
            });
        }
        let count = self.read_ref_count(checksum, driver)? + 1;
        self.write_ref_count(checksum, count, driver)?;
        Ok(count)
    }

    /// Release one backup mapping. Reaching zero marks the block collectible
    /// but does not delete it; reclamation is deferred to
    /// [`BlockStore::garbage_collect`].
    pub fn decrement_ref(
        &self,
        checksum: &BlockChecksum,
        driver: &dyn BackupStoreDriver,
    ) -> Result<u64> {
        let _guard = self.refcount_lock.lock().expect("refcount lock poisoned");
        let current = self.read_ref_count(checksum, driver)?;
        if current == 0 {
            warn!("reference count for block {} already zero", checksum);
            return Ok(0);
        }
        let count = current - 1;
        self.write_ref_count(checksum, count, driver)?;
        Ok(count)
    }

    /// Every block currently stored, sorted by checksum.
    pub fn list_blocks(&self, driver: &dyn BackupStoreDriver) -> Result<Vec<BlockChecksum>> {
        let root = self.blocks_root();
        if !driver.exists(&root) {
            return Ok(Vec::new());
        }

        let mut blocks = Vec::new();
        for shard in driver.list(&root)? {
            for entry in driver.list(&format!("{}/{}", root, shard))? {
                if let Some(checksum) = entry.strip_suffix(BLOCK_SUFFIX) {
                    blocks.push(BlockChecksum::new(checksum.to_string()));
                }
            }
        }
        blocks.sort();
        Ok(blocks)
    }

    /// Remove every block whose reference count is zero.
    ///
    /// A zero count found during the scan is re-read immediately before
    /// deletion, so a backup that commits a reference mid-pass keeps its
    /// block.
    pub fn garbage_collect(&self, driver: &dyn BackupStoreDriver) -> Result<GcStats> {
        let _collector = self.gc_lock.lock().expect("gc lock poisoned");

        let blocks = self.list_blocks(driver)?;
        let mut stats = GcStats {
            scanned: blocks.len(),
            ..GcStats::default()
        };

        for checksum in blocks {
            if self.read_ref_count(&checksum, driver)? > 0 {
                stats.live += 1;
                continue;
            }

            // check-then-delete under the refcount lock
            let _guard = self.refcount_lock.lock().expect("refcount lock poisoned");
            if self.read_ref_count(&checksum, driver)? > 0 {
                stats.live += 1;
                continue;
            }
            driver.remove(&self.block_path(&checksum))?;
            driver.remove(&self.refcount_path(&checksum))?;
            stats.removed += 1;
            debug!("collected block {}", checksum);
        }

        info!(
            "garbage collection done: {} scanned, {} removed, {} live",
            stats.scanned, stats.removed, stats.live
        );
        Ok(stats)
    }
}
