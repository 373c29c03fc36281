//! Backup metadata records and their store
//!
//! One immutable record per completed backup, serialized as JSON under
//! `{base}/volumes/{volume}/backups/`.

use crate::block::BlockChecksum;
use crate::config::BackupStoreConfig;
use crate::driver::BackupStoreDriver;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const BACKUP_CONFIG_SUFFIX: &str = ".cfg";

/// One entry of a block-mapped backup: a logical offset and the checksum of
/// the block stored there
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMapping {
    pub offset: u64,
    pub block_checksum: BlockChecksum,
}

/// Descriptor of a whole-object backup for volumes that are not
/// block-addressable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    pub checksum: BlockChecksum,
    pub size: u64,
}

/// The content of a backup, exactly one of two shapes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupContent {
    /// Ordered offset-to-checksum mapping; unmapped ranges restore as zeros
    Blocks(Vec<BlockMapping>),
    /// Whole-object descriptor
    SingleFile(BackupFile),
}

/// Immutable record of one completed backup operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub name: String,
    pub volume_name: String,
    pub snapshot_name: String,
    pub snapshot_created_at: DateTime<Utc>,
    pub created_time: DateTime<Utc>,
    /// Total logical size of the volume at backup time
    pub size: u64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub content: BackupContent,
}

impl Backup {
    /// Block mappings of this backup; empty for single-file backups.
    pub fn block_mappings(&self) -> &[BlockMapping] {
        match &self.content {
            BackupContent::Blocks(mappings) => mappings,
            BackupContent::SingleFile(_) => &[],
        }
    }
}

/// Lightweight listing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSummary {
    pub name: String,
    pub snapshot_name: String,
    pub created_time: DateTime<Utc>,
    pub size: u64,
    pub block_count: u64,
}

impl From<&Backup> for BackupSummary {
    fn from(backup: &Backup) -> Self {
        Self {
            name: backup.name.clone(),
            snapshot_name: backup.snapshot_name.clone(),
            created_time: backup.created_time,
            size: backup.size,
            block_count: backup.block_mappings().len() as u64,
        }
    }
}

/// Store for backup records under the volume namespace.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    base: String,
}

impl MetadataStore {
    pub fn new(config: &BackupStoreConfig) -> Self {
        Self {
            base: config.base.clone(),
        }
    }

    fn backups_path(&self, volume: &str) -> String {
        format!("{}/volumes/{}/backups", self.base, volume)
    }

    pub(crate) fn backup_config_path(&self, volume: &str, backup: &str) -> String {
        format!(
            "{}/{}{}",
            self.backups_path(volume),
            backup,
            BACKUP_CONFIG_SUFFIX
        )
    }

    /// Backend path of a single-file backup's whole object.
    pub(crate) fn backup_file_path(&self, volume: &str, backup: &str) -> String {
        format!("{}/volumes/{}/files/{}.raw", self.base, volume, backup)
    }

    /// Publish a backup record. Records are immutable once visible, so an
    /// existing record fails with [`Error::AlreadyExists`].
    ///
    /// Atomicity of the publish itself comes from the driver `write`
    /// contract.
    pub fn save_backup(&self, backup: &Backup, driver: &dyn BackupStoreDriver) -> Result<()> {
        let path = self.backup_config_path(&backup.volume_name, &backup.name);
        if driver.exists(&path) {
            return Err(Error::AlreadyExists { path });
        }
        let data = serde_json::to_vec_pretty(backup)?;
        driver.write(&path, &data)
    }

    pub fn load_backup(
        &self,
        volume: &str,
        backup: &str,
        driver: &dyn BackupStoreDriver,
    ) -> Result<Backup> {
        let path = self.backup_config_path(volume, backup);
        let data = driver.read(&path).map_err(|e| {
            if e.is_not_found() {
                Error::BackupNotFound {
                    volume: volume.to_string(),
                    backup: backup.to_string(),
                }
            } else {
                e
            }
        })?;

        let record: Backup = serde_json::from_slice(&data).map_err(|e| Error::CorruptRecord {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        if record.name != backup || record.volume_name != volume {
            return Err(Error::CorruptRecord {
                path,
                reason: "record identity does not match its path".to_string(),
            });
        }
        Ok(record)
    }

    pub fn backup_exists(
        &self,
        volume: &str,
        backup: &str,
        driver: &dyn BackupStoreDriver,
    ) -> bool {
        driver.exists(&self.backup_config_path(volume, backup))
    }

    /// Lazy enumeration of a volume's backups, ordered by name.
    ///
    /// Names sort time-ordered by construction; each summary is loaded on
    /// demand, so a consumer can stop (or restart the listing) at any point.
    pub fn list_backups<'a>(
        &'a self,
        volume: &str,
        driver: &'a dyn BackupStoreDriver,
    ) -> Result<BackupIter<'a>> {
        let root = self.backups_path(volume);
        let mut names = Vec::new();
        if driver.exists(&root) {
            for entry in driver.list(&root)? {
                if let Some(name) = entry.strip_suffix(BACKUP_CONFIG_SUFFIX) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();

        Ok(BackupIter {
            store: self,
            driver,
            volume: volume.to_string(),
            names,
            next: 0,
        })
    }

    /// Remove a backup record. Reference bookkeeping for its blocks lives in
    /// the engine, which owns both stores.
    pub fn remove_record(
        &self,
        volume: &str,
        backup: &str,
        driver: &dyn BackupStoreDriver,
    ) -> Result<()> {
        let path = self.backup_config_path(volume, backup);
        if !driver.exists(&path) {
            return Err(Error::BackupNotFound {
                volume: volume.to_string(),
                backup: backup.to_string(),
            });
        }
        driver.remove(&path)
    }
}

/// Iterator over a volume's backup summaries, in name order.
pub struct BackupIter<'a> {
    store: &'a MetadataStore,
    driver: &'a dyn BackupStoreDriver,
    volume: String,
    names: Vec<String>,
    next: usize,
}

impl Iterator for BackupIter<'_> {
    type Item = Result<BackupSummary>;

    fn next(&mut self) -> Option<Self::Item> {
        let name = self.names.get(self.next)?.clone();
        self.next += 1;
        Some(
            self.store
                .load_backup(&self.volume, &name, self.driver)
                .map(|backup| BackupSummary::from(&backup)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use pretty_assertions::assert_eq;

    fn store() -> MetadataStore {
        MetadataStore::new(&BackupStoreConfig::default())
    }

    fn sample_backup(name: &str) -> Backup {
        Backup {
            name: name.to_string(),
            volume_name: "vol1".to_string(),
            snapshot_name: "snap1".to_string(),
            snapshot_created_at: Utc::now(),
            created_time: Utc::now(),
            size: 4096,
            labels: HashMap::from([("tier".to_string(), "gold".to_string())]),
            content: BackupContent::Blocks(vec![BlockMapping {
                offset: 0,
                block_checksum: BlockChecksum::from_bytes(b"data"),
            }]),
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let driver = MemoryDriver::new();
        let store = store();
        let backup = sample_backup("backup1");

        store.save_backup(&backup, &driver).unwrap();
        let loaded = store.load_backup("vol1", "backup1", &driver).unwrap();

        assert_eq!(loaded.name, "backup1");
        assert_eq!(loaded.volume_name, "vol1");
        assert_eq!(loaded.size, 4096);
        assert_eq!(loaded.labels.get("tier").map(String::as_str), Some("gold"));
        assert_eq!(loaded.block_mappings(), backup.block_mappings());
    }

    #[test]
    fn test_save_backup_is_write_once() {
        let driver = MemoryDriver::new();
        let store = store();
        let backup = sample_backup("backup1");

        store.save_backup(&backup, &driver).unwrap();
        let err = store.save_backup(&backup, &driver).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[test]
    fn test_load_backup_absent() {
        let driver = MemoryDriver::new();
        let store = store();

        let err = store.load_backup("vol1", "ghost", &driver).unwrap_err();
        assert!(matches!(err, Error::BackupNotFound { .. }));
    }

    #[test]
    fn test_load_backup_corrupt() {
        let driver = MemoryDriver::new();
        let store = store();

        driver
            .write("backupstore/volumes/vol1/backups/bad.cfg", b"{broken")
            .unwrap();
        let err = store.load_backup("vol1", "bad", &driver).unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { .. }));
    }

    #[test]
    fn test_load_backup_identity_check() {
        let driver = MemoryDriver::new();
        let store = store();

        let mut backup = sample_backup("backup1");
        backup.name = "other".to_string();
        let data = serde_json::to_vec(&backup).unwrap();
        driver
            .write(&store.backup_config_path("vol1", "backup1"), &data)
            .unwrap();

        let err = store.load_backup("vol1", "backup1", &driver).unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { .. }));
    }

    #[test]
    fn test_list_backups_ordered_and_lazy() {
        let driver = MemoryDriver::new();
        let store = store();

        for name in ["backup-003", "backup-001", "backup-002"] {
            store.save_backup(&sample_backup(name), &driver).unwrap();
        }

        let names: Vec<String> = store
            .list_backups("vol1", &driver)
            .unwrap()
            .map(|summary| summary.map(|s| s.name))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(names, vec!["backup-001", "backup-002", "backup-003"]);

        // a partial walk is fine and a fresh listing restarts from the top
        let mut iter = store.list_backups("vol1", &driver).unwrap();
        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.name, "backup-001");
        drop(iter);

        let mut iter = store.list_backups("vol1", &driver).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().name, "backup-001");
    }

    #[test]
    fn test_list_backups_empty_volume() {
        let driver = MemoryDriver::new();
        let store = store();

        let mut iter = store.list_backups("vol1", &driver).unwrap();
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_remove_record() {
        let driver = MemoryDriver::new();
        let store = store();

        store.save_backup(&sample_backup("backup1"), &driver).unwrap();
        store.remove_record("vol1", "backup1", &driver).unwrap();
        assert!(!store.backup_exists("vol1", "backup1", &driver));

        let err = store.remove_record("vol1", "backup1", &driver).unwrap_err();
        assert!(matches!(err, Error::BackupNotFound { .. }));
    }

    #[test]
    fn test_single_file_content_shape() {
        let driver = MemoryDriver::new();
        let store = store();

        let mut backup = sample_backup("backup1");
        backup.content = BackupContent::SingleFile(BackupFile {
            checksum: BlockChecksum::from_bytes(b"whole object"),
            size: 12,
        });
        store.save_backup(&backup, &driver).unwrap();

        let loaded = store.load_backup("vol1", "backup1", &driver).unwrap();
        assert!(loaded.block_mappings().is_empty());
        assert!(matches!(loaded.content, BackupContent::SingleFile(_)));
    }
}
