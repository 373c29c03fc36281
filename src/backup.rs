//! Backup creation and lifecycle orchestration
//!
//! [`BackupEngine`] turns a stream of changed extents into a published,
//! self-sufficient backup record: extents are split into fixed-size blocks,
//! deduplicated against the block store, merged over the prior backup's
//! mapping, and committed with reference counts before the record becomes
//! visible.

use crate::block::{BlockChecksum, BlockStore, GcStats};
use crate::config::BackupStoreConfig;
use crate::driver::{with_retries, BackupStoreDriver};
use crate::locator::validate_name;
use crate::metadata::{
    Backup, BackupContent, BackupFile, BackupSummary, BlockMapping, MetadataStore,
};
use crate::volume::{Volume, VolumeRegistry};
use crate::{Error, Result};
use chrono::Utc;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::{info, span, warn, Level};
use uuid::Uuid;

/// One changed range of the volume. The offset must be a multiple of the
/// configured block size; the data length is arbitrary.
#[derive(Debug, Clone)]
pub struct BackupExtent {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Caller-supplied identity and attributes for a new backup
#[derive(Debug, Clone)]
pub struct BackupSpec {
    pub volume: String,
    /// Generated (time-ordered, unique) when absent
    pub backup_name: Option<String>,
    pub snapshot_name: String,
    pub snapshot_created_at: chrono::DateTime<Utc>,
    /// Total logical size of the volume at snapshot time
    pub volume_size: u64,
    pub labels: HashMap<String, String>,
}

/// Orchestrates registry, block store and metadata store against one
/// configured namespace.
pub struct BackupEngine {
    config: BackupStoreConfig,
    registry: VolumeRegistry,
    blocks: BlockStore,
    metadata: MetadataStore,
    // serializes the record-publish and pointer-update step per engine
    publish_lock: Mutex<()>,
}

impl BackupEngine {
    pub fn new(config: BackupStoreConfig) -> Self {
        let registry = VolumeRegistry::new(&config);
        let blocks = BlockStore::new(&config);
        let metadata = MetadataStore::new(&config);
        Self {
            config,
            registry,
            blocks,
            metadata,
            publish_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &VolumeRegistry {
        &self.registry
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    /// Create a backup from a set of changed extents.
    ///
    /// The first backup of a volume receives the full-volume stream; later
    /// ones pass only the deltas since the prior snapshot. Either way the
    /// published mapping is complete: it is merged over the prior backup's
    /// mapping, so restore never needs another record.
    pub fn create_backup(
        &self,
        spec: &BackupSpec,
        extents: impl IntoIterator<Item = BackupExtent>,
        driver: &dyn BackupStoreDriver,
    ) -> Result<Backup> {
        if !validate_name(&spec.volume) {
            return Err(Error::InvalidName {
                name: spec.volume.clone(),
            });
        }
        let backup_name = match &spec.backup_name {
            Some(name) if validate_name(name) => name.clone(),
            Some(name) => {
                return Err(Error::InvalidName { name: name.clone() });
            }
            None => generate_backup_name(),
        };

        let op = span!(Level::INFO, "create_backup", volume = %spec.volume, backup = %backup_name);
        let _enter = op.enter();

        self.registry
            .add_volume(&Volume::new(spec.volume.clone(), spec.volume_size), driver)?;

        let mut mapping = self.prior_mapping(&spec.volume, driver)?;

        // split extents into fixed-size blocks
        let block_size = self.config.block_size;
        let mut pending: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut zeroed: Vec<u64> = Vec::new();
        for extent in extents {
            if extent.offset % block_size as u64 != 0 {
                return Err(Error::InvalidExtent {
                    offset: extent.offset,
                });
            }
            let mut offset = extent.offset;
            for piece in extent.data.chunks(block_size) {
                if piece.iter().all(|&b| b == 0) {
                    zeroed.push(offset);
                } else {
                    pending.push((offset, piece.to_vec()));
                }
                offset += piece.len() as u64;
            }
        }

        // dedup upload, parallel per block
        let uploaded: Vec<(u64, BlockChecksum, bool)> = pending
            .into_par_iter()
            .map(|(offset, data)| {
                self.blocks
                    .put_block(&data, driver)
                    .map(|(checksum, written)| (offset, checksum, written))
            })
            .collect::<Result<_>>()?;
        let new_blocks = uploaded.iter().filter(|(_, _, written)| *written).count();

        // zeroed ranges shadow any prior data at the same offset
        for offset in &zeroed {
            mapping.remove(offset);
        }
        for (offset, checksum, _) in &uploaded {
            mapping.insert(*offset, checksum.clone());
        }

        // commit one reference per entry of the final mapping
        for checksum in mapping.values() {
            self.blocks.increment_ref(checksum, driver)?;
        }

        let record = Backup {
            name: backup_name,
            volume_name: spec.volume.clone(),
            snapshot_name: spec.snapshot_name.clone(),
            snapshot_created_at: spec.snapshot_created_at,
            created_time: Utc::now(),
            size: spec.volume_size,
            labels: spec.labels.clone(),
            content: BackupContent::Blocks(
                mapping
                    .into_iter()
                    .map(|(offset, block_checksum)| BlockMapping {
                        offset,
                        block_checksum,
                    })
                    .collect(),
            ),
        };

        let block_count = record.block_mappings().len() as u64;
        {
            let _publish = self.publish_lock.lock().expect("publish lock poisoned");
            self.metadata.save_backup(&record, driver)?;
            self.registry.set_last_backup(
                &spec.volume,
                Some((&record.name, record.created_time)),
                block_count,
                Some(spec.volume_size),
                driver,
            )?;
        }

        info!(
            "published backup {} for volume {}: {} mapped blocks, {} newly stored",
            record.name, spec.volume, block_count, new_blocks
        );
        Ok(record)
    }

    /// Create a whole-object backup for a volume that is not
    /// block-addressable.
    pub fn create_single_file_backup(
        &self,
        spec: &BackupSpec,
        data: &[u8],
        driver: &dyn BackupStoreDriver,
    ) -> Result<Backup> {
        if !validate_name(&spec.volume) {
            return Err(Error::InvalidName {
                name: spec.volume.clone(),
            });
        }
        let backup_name = match &spec.backup_name {
            Some(name) if validate_name(name) => name.clone(),
            Some(name) => {
                return Err(Error::InvalidName { name: name.clone() });
            }
            None => generate_backup_name(),
        };

        let op = span!(Level::INFO, "create_single_file_backup", volume = %spec.volume, backup = %backup_name);
        let _enter = op.enter();

        self.registry
            .add_volume(&Volume::new(spec.volume.clone(), spec.volume_size), driver)?;

        let checksum = BlockChecksum::from_bytes(data);
        let object_path = self.metadata.backup_file_path(&spec.volume, &backup_name);
        with_retries(&self.config.retry, "backup object write", || {
            driver.write(&object_path, data)
        })?;

        let record = Backup {
            name: backup_name,
            volume_name: spec.volume.clone(),
            snapshot_name: spec.snapshot_name.clone(),
            snapshot_created_at: spec.snapshot_created_at,
            created_time: Utc::now(),
            size: data.len() as u64,
            labels: spec.labels.clone(),
            content: BackupContent::SingleFile(BackupFile {
                checksum,
                size: data.len() as u64,
            }),
        };

        {
            let _publish = self.publish_lock.lock().expect("publish lock poisoned");
            self.metadata.save_backup(&record, driver)?;
            self.registry.set_last_backup(
                &spec.volume,
                Some((&record.name, record.created_time)),
                0,
                Some(record.size),
                driver,
            )?;
        }

        info!(
            "published single-file backup {} for volume {} ({} bytes)",
            record.name, spec.volume, record.size
        );
        Ok(record)
    }

    /// Delete a backup record and release the references it holds.
    ///
    /// Freed blocks stay on the backend until the next
    /// [`BackupEngine::garbage_collect`] pass.
    pub fn delete_backup(
        &self,
        volume: &str,
        backup: &str,
        driver: &dyn BackupStoreDriver,
    ) -> Result<()> {
        if !validate_name(volume) {
            return Err(Error::InvalidName {
                name: volume.to_string(),
            });
        }
        if !validate_name(backup) {
            return Err(Error::InvalidName {
                name: backup.to_string(),
            });
        }

        let record = self.metadata.load_backup(volume, backup, driver)?;
        match &record.content {
            BackupContent::Blocks(mappings) => {
                for mapping in mappings {
                    self.blocks.decrement_ref(&mapping.block_checksum, driver)?;
                }
            }
            BackupContent::SingleFile(_) => {
                driver.remove(&self.metadata.backup_file_path(volume, backup))?;
            }
        }
        self.metadata.remove_record(volume, backup, driver)?;

        // repair the pointer if the newest backup was deleted
        let current = self.registry.load_volume(volume, driver)?;
        if current.last_backup_name.as_deref() == Some(backup) {
            let mut latest: Option<BackupSummary> = None;
            for summary in self.metadata.list_backups(volume, driver)? {
                latest = Some(summary?);
            }
            let _publish = self.publish_lock.lock().expect("publish lock poisoned");
            match latest {
                Some(summary) => self.registry.set_last_backup(
                    volume,
                    Some((&summary.name, summary.created_time)),
                    summary.block_count,
                    None,
                    driver,
                )?,
                None => self
                    .registry
                    .set_last_backup(volume, None, 0, None, driver)?,
            }
        }

        info!("deleted backup {} from volume {}", backup, volume);
        Ok(())
    }

    /// Delete a volume and everything it owns.
    ///
    /// Block checksums are global across volumes, so every backup is deleted
    /// through [`BackupEngine::delete_backup`] first. That releases all
    /// references this volume held; blocks that reach zero are reclaimed by
    /// the next garbage collection pass, while blocks still referenced by
    /// other volumes survive.
    pub fn delete_volume(&self, volume: &str, driver: &dyn BackupStoreDriver) -> Result<()> {
        if !validate_name(volume) {
            return Err(Error::InvalidName {
                name: volume.to_string(),
            });
        }
        if !self.registry.volume_exists(volume, driver) {
            return Err(Error::VolumeNotFound {
                volume: volume.to_string(),
            });
        }

        let names: Vec<String> = self
            .metadata
            .list_backups(volume, driver)?
            .map(|summary| summary.map(|s| s.name))
            .collect::<Result<_>>()?;
        for name in names {
            self.delete_backup(volume, &name, driver)?;
        }

        self.registry.remove_volume(volume, driver)
    }

    /// Remove every block no longer referenced by any backup.
    pub fn garbage_collect(&self, driver: &dyn BackupStoreDriver) -> Result<GcStats> {
        self.blocks.garbage_collect(driver)
    }

    fn prior_mapping(
        &self,
        volume: &str,
        driver: &dyn BackupStoreDriver,
    ) -> Result<BTreeMap<u64, BlockChecksum>> {
        let mut mapping = BTreeMap::new();
        let record = self.registry.load_volume(volume, driver)?;
        if let Some(prior) = &record.last_backup_name {
            match self.metadata.load_backup(volume, prior, driver) {
                Ok(prior_record) => {
                    for entry in prior_record.block_mappings() {
                        mapping.insert(entry.offset, entry.block_checksum.clone());
                    }
                }
                Err(e) if e.is_not_found() => {
                    warn!(
                        "last backup {} of volume {} is gone, treating as full backup",
                        prior, volume
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(mapping)
    }
}

fn generate_backup_name() -> String {
    let fragment = Uuid::new_v4().simple().to_string();
    format!("backup-{}-{}", Utc::now().timestamp(), &fragment[..8])
}
