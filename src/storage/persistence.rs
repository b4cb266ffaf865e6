//! Observed contract event log
//!
//! A federator remembers which transfer events it has already seen and how
//! far it has scanned the chain, so a restart neither replays nor skips
//! anything. Events are unique on `(block, tx_index, log_index)`.

use crate::federation::batch::{TransferId, TransferStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub events_file: String,
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".federator_data"),
            events_file: "events.json".to_string(),
            backup_enabled: true,
            max_backups: 5,
        }
    }
}

/// One contract log entry the federator has processed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedEvent {
    pub block: u64,
    pub tx_index: u32,
    pub log_index: u32,
    pub transfer_id: TransferId,
    pub status: TransferStatus,
    pub observed_at: DateTime<Utc>,
}

impl ObservedEvent {
    pub fn new(
        block: u64,
        tx_index: u32,
        log_index: u32,
        transfer_id: TransferId,
        status: TransferStatus,
    ) -> Self {
        Self {
            block,
            tx_index,
            log_index,
            transfer_id,
            status,
            observed_at: Utc::now(),
        }
    }

    fn key(&self) -> (u64, u32, u32) {
        (self.block, self.tx_index, self.log_index)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLog {
    /// Highest block fully scanned
    pub last_block: u64,
    pub events: Vec<ObservedEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub file_size: u64,
    pub backup_count: usize,
    pub event_count: usize,
    pub last_block: u64,
    pub data_dir: PathBuf,
}

pub struct EventStore {
    config: StorageConfig,
    log: EventLog,
    seen: BTreeSet<(u64, u32, u32)>,
}

impl EventStore {
    /// Open the store, loading the saved log when there is one
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        let path = config.data_dir.join(&config.events_file);
        let log = if path.exists() {
            let log = read_log(&path)?;
            log::info!(
                "Loaded {} observed event(s) up to block {}",
                log.events.len(),
                log.last_block
            );
            log
        } else {
            EventLog::default()
        };
        Self::from_log(config, log)
    }

    fn from_log(config: StorageConfig, log: EventLog) -> Result<Self, StorageError> {
        let mut seen = BTreeSet::new();
        for event in &log.events {
            if !seen.insert(event.key()) {
                return Err(StorageError::InvalidData(format!(
                    "duplicate event at block {} tx {} log {}",
                    event.block, event.tx_index, event.log_index
                )));
            }
        }
        Ok(Self { config, log, seen })
    }

    fn events_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.events_file)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.backup.{}", self.config.events_file, index))
    }

    /// Record an event. Returns `false` if it was already known.
    pub fn record(&mut self, event: ObservedEvent) -> bool {
        if !self.seen.insert(event.key()) {
            return false;
        }
        self.log.events.push(event);
        true
    }

    /// Move the scan cursor forward; never moves it back
    pub fn advance_cursor(&mut self, block: u64) {
        self.log.last_block = self.log.last_block.max(block);
    }

    pub fn last_block(&self) -> u64 {
        self.log.last_block
    }

    pub fn events(&self) -> &[ObservedEvent] {
        &self.log.events
    }

    pub fn events_for(&self, id: &TransferId) -> Vec<&ObservedEvent> {
        self.log
            .events
            .iter()
            .filter(|e| e.transfer_id == *id)
            .collect()
    }

    /// Latest status observed for a transfer
    pub fn latest_status(&self, id: &TransferId) -> Option<TransferStatus> {
        self.log
            .events
            .iter()
            .filter(|e| e.transfer_id == *id)
            .max_by_key(|e| e.key())
            .map(|e| e.status)
    }

    /// Write the log, keeping the previous versions as backups
    pub fn save(&self) -> Result<(), StorageError> {
        let path = self.events_path();

        if self.config.backup_enabled && path.exists() && self.config.max_backups > 0 {
            self.rotate_backups()?;
            fs::copy(&path, self.backup_path(0))?;
        }

        let temp_path = self
            .config
            .data_dir
            .join(format!("{}.tmp", self.config.events_file));
        let writer = BufWriter::new(fs::File::create(&temp_path)?);
        serde_json::to_writer_pretty(writer, &self.log)?;
        fs::rename(&temp_path, &path)?;

        log::debug!("Saved {} event(s) to {}", self.log.events.len(), path.display());
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

    /// Replace the in-memory log with a backup
    pub fn restore_backup(&mut self, index: usize) -> Result<(), StorageError> {
        let path = self.backup_path(index);
        if !path.exists() {
            return Err(StorageError::InvalidData(format!("Backup {} not found", index)));
        }
        let restored = Self::from_log(self.config.clone(), read_log(&path)?)?;
        *self = restored;
        Ok(())
    }

    pub fn list_backups(&self) -> Vec<usize> {
        (0..self.config.max_backups)
            .filter(|i| self.backup_path(*i).exists())
            .collect()
    }

    pub fn stats(&self) -> Result<StorageStats, StorageError> {
        let path = self.events_path();
        let file_size = if path.exists() {
            fs::metadata(&path)?.len()
        } else {
            0
        };
        Ok(StorageStats {
            file_size,
            backup_count: self.list_backups().len(),
            event_count: self.log.events.len(),
            last_block: self.log.last_block,
            data_dir: self.config.data_dir.clone(),
        })
    }
}

fn read_log(path: &std::path::Path) -> Result<EventLog, StorageError> {
    let reader = BufReader::new(fs::File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}
