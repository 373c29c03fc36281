//! Volume registry: one metadata record per volume under backup

use crate::config::BackupStoreConfig;
use crate::driver::BackupStoreDriver;
use crate::locator::validate_name;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// File name of the per-volume record inside its namespace subtree
pub const VOLUME_CONFIG_FILE: &str = "volume.cfg";

/// Per-volume metadata record.
///
/// Exists in the namespace iff at least one backup attempt has been
/// registered for the volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    /// Total logical size in bytes
    pub size: u64,
    pub created_time: DateTime<Utc>,
    /// Name of the most recent backup, absent until the first one completes
    pub last_backup_name: Option<String>,
    pub last_backup_at: Option<DateTime<Utc>>,
    /// Mapped block count of the most recent backup
    pub block_count: u64,
}

impl Volume {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            created_time: Utc::now(),
            last_backup_name: None,
            last_backup_at: None,
            block_count: 0,
        }
    }
}

/// Registry of volume records under `{base}/volumes/`.
#[derive(Debug, Clone)]
pub struct VolumeRegistry {
    base: String,
}

impl VolumeRegistry {
    pub fn new(config: &BackupStoreConfig) -> Self {
        Self {
            base: config.base.clone(),
        }
    }

    fn volumes_root(&self) -> String {
        format!("{}/volumes", self.base)
    }

    /// Namespace subtree owned by one volume.
    pub fn volume_path(&self, name: &str) -> String {
        format!("{}/{}", self.volumes_root(), name)
    }

    fn volume_config_path(&self, name: &str) -> String {
        format!("{}/{}", self.volume_path(name), VOLUME_CONFIG_FILE)
    }

    /// Register a volume. Success without any write if the record already
    /// exists.
    pub fn add_volume(&self, volume: &Volume, driver: &dyn BackupStoreDriver) -> Result<()> {
        if self.volume_exists(&volume.name, driver) {
            return Ok(());
        }
        if !validate_name(&volume.name) {
            return Err(Error::InvalidName {
                name: volume.name.clone(),
            });
        }

        self.save_volume(volume, driver)?;
        debug!("registered volume {}", volume.name);
        Ok(())
    }

    /// Delete the volume's entire namespace subtree, backups included.
    ///
    /// Metadata only: callers that share blocks across volumes must release
    /// block references first (see `BackupEngine::delete_volume`).
    pub fn remove_volume(&self, name: &str, driver: &dyn BackupStoreDriver) -> Result<()> {
        if !validate_name(name) {
            return Err(Error::InvalidName {
                name: name.to_string(),
            });
        }
        if !self.volume_exists(name, driver) {
            return Err(Error::VolumeNotFound {
                volume: name.to_string(),
            });
        }

        driver.remove(&self.volume_path(name))?;
        debug!("removed volume {}", name);
        Ok(())
    }

    pub fn load_volume(&self, name: &str, driver: &dyn BackupStoreDriver) -> Result<Volume> {
        let path = self.volume_config_path(name);
        let data = driver.read(&path).map_err(|e| {
            if e.is_not_found() {
                Error::VolumeNotFound {
                    volume: name.to_string(),
                }
            } else {
                e
            }
        })?;

        serde_json::from_slice(&data).map_err(|e| Error::CorruptRecord {
            path,
            reason: e.to_string(),
        })
    }

    /// Existence probe; never errors on absence.
    pub fn volume_exists(&self, name: &str, driver: &dyn BackupStoreDriver) -> bool {
        driver.exists(&self.volume_config_path(name))
    }

    pub fn save_volume(&self, volume: &Volume, driver: &dyn BackupStoreDriver) -> Result<()> {
        let data = serde_json::to_vec_pretty(volume)?;
        driver.write(&self.volume_config_path(&volume.name), &data)
    }

    /// Single-writer update of the volume's backup pointer. `size` is
    /// refreshed on publish and left untouched on deletion repair.
    pub fn set_last_backup(
        &self,
        volume_name: &str,
        last: Option<(&str, DateTime<Utc>)>,
        block_count: u64,
        size: Option<u64>,
        driver: &dyn BackupStoreDriver,
    ) -> Result<()> {
        let mut volume = self.load_volume(volume_name, driver)?;
        volume.last_backup_name = last.map(|(name, _)| name.to_string());
        volume.last_backup_at = last.map(|(_, at)| at);
        volume.block_count = block_count;
        if let Some(size) = size {
            volume.size = size;
        }
        self.save_volume(&volume, driver)
    }

    /// Names of every registered volume, sorted.
    pub fn list_volumes(&self, driver: &dyn BackupStoreDriver) -> Result<Vec<String>> {
        let root = self.volumes_root();
        if !driver.exists(&root) {
            return Ok(Vec::new());
        }
        let mut names = driver.list(&root)?;
        names.retain(|name| validate_name(name));
        names.sort();
        Ok(names)
    }
}
