//! JSON file persistence
//!
//! Mirrors a `MemoryStorage` to a single JSON document. Saves go to a
//! temporary file first and are renamed into place; the previous document is
//! kept as a rotating backup.

use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use super::memory::{MemoryStorage, Snapshot};
use super::StorageError;

/// File store configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub wallet_file: String,
    pub pretty: bool,
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".spv_wallet_data"),
            wallet_file: "wallet.json".to_string(),
            pretty: false,
            backup_enabled: true,
            max_backups: 2,
        }
    }
}

impl StorageConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }
}

/// Location and format of the persisted document
pub(crate) struct JsonFile {
    config: StorageConfig,
}

impl JsonFile {
    fn new(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self { config })
    }

    fn path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.wallet_file)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.backup.{}", self.config.wallet_file, index))
    }

    pub(crate) fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }

        let reader = BufReader::new(fs::File::open(&path)?);
        let snapshot = serde_json::from_reader(reader)?;
        log::debug!("Loaded wallet storage from {}", path.display());
        Ok(Some(snapshot))
    }

    pub(crate) fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let path = self.path();

        if self.config.backup_enabled && self.config.max_backups > 0 && path.exists() {
            self.rotate_backups()?;
            fs::copy(&path, self.backup_path(0))?;
        }

        let temp_path = self.config.data_dir.join(format!("{}.tmp", self.config.wallet_file));
        let writer = BufWriter::new(fs::File::create(&temp_path)?);
        if self.config.pretty {
            serde_json::to_writer_pretty(writer, snapshot)?;
        } else {
            serde_json::to_writer(writer, snapshot)?;
        }

        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn rotate_backups(&self) -> Result<(), StorageError> {
        let oldest = self.backup_path(self.config.max_backups - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        for i in (0..self.config.max_backups - 1).rev() {
            let current = self.backup_path(i);
            if current.exists() {
                fs::rename(&current, self.backup_path(i + 1))?;
            }
        }

        Ok(())
    }
}

impl MemoryStorage {
    /// Open (or create) the JSON backed store described by `config`
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        Self::with_file(JsonFile::new(config)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::{Block, BlockHeader};
    use crate::storage::{PeerAddress, Storage};

    fn config(dir: &std::path::Path) -> StorageConfig {
        StorageConfig {
            max_backups: 1,
            ..StorageConfig::with_data_dir(dir)
        }
    }

    #[test]
    fn test_commit_persists_state() {
        let temp_dir = tempfile::tempdir().unwrap();

        let storage = MemoryStorage::open(config(temp_dir.path())).unwrap();
        let header = BlockHeader::new(1, [0u8; 32], [0u8; 32], 0, 0x207fffff, 0);
        storage.begin();
        storage.add_block(Block::new(header.clone(), 0));
        storage.commit().unwrap();

        let reopened = MemoryStorage::open(config(temp_dir.path())).unwrap();
        assert_eq!(reopened.block(&header.hash).unwrap().height, 0);
    }

    #[test]
    fn test_flush_and_backup() {
        let temp_dir = tempfile::tempdir().unwrap();

        let storage = MemoryStorage::open(config(temp_dir.path())).unwrap();
        storage.set_peer_addresses(vec![PeerAddress::new("10.0.0.1", 0)]);
        storage.flush().unwrap();
        storage.delete_peer_address("10.0.0.1");
        storage.flush().unwrap();

        assert!(temp_dir.path().join("wallet.json.backup.0").exists());
        let reopened = MemoryStorage::open(config(temp_dir.path())).unwrap();
        assert!(reopened.peer_addresses().is_empty());
    }

    #[test]
    fn test_rolled_back_writes_are_not_persisted() {
        let temp_dir = tempfile::tempdir().unwrap();

        let storage = MemoryStorage::open(config(temp_dir.path())).unwrap();
        storage.begin();
        storage.set_peer_addresses(vec![PeerAddress::new("10.0.0.9", 0)]);
        storage.rollback();
        storage.flush().unwrap();

        let reopened = MemoryStorage::open(config(temp_dir.path())).unwrap();
        assert!(reopened.peer_addresses().is_empty());
    }
}
