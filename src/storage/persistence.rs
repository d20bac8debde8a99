//! Write-Ahead Logging (WAL) and snapshot checkpoints for retentiondb

use super::memory::SequenceValues;
use crate::core::{DbError, Record, Result};
use crate::transaction::Change;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

const WAL_FILE: &str = "retentiondb.wal";
const SNAPSHOT_FILE: &str = "retentiondb.snapshot";
const SNAPSHOT_VERSION: u32 = 1;

// ============================================================================
// WAL Entry Types
// ============================================================================

/// Write-Ahead Log entry types.
///
/// Only committed work reaches the log, so a transaction is a single entry
/// and replay never has to discard anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalEntry {
    Commit { tx_id: u64, changes: Vec<Change> },
}

// ============================================================================
// Database Snapshot
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    pub version: u32,
    pub records: Vec<Record>,
    pub sequences: SequenceValues,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: i64,
    pub row_count: usize,
}

impl DatabaseSnapshot {
    pub fn new(records: Vec<Record>, sequences: SequenceValues) -> Self {
        let row_count = records.len();
        Self {
            version: SNAPSHOT_VERSION,
            records,
            sequences,
            metadata: SnapshotMetadata {
                created_at: chrono::Utc::now().timestamp_millis(),
                row_count,
            },
        }
    }
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// fsync after every commit.
    Sync,
    /// Flush to the OS after every commit.
    #[default]
    Async,
    /// Keep everything in memory.
    None,
}

impl FromStr for DurabilityMode {
    type Err = DbError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(DurabilityMode::Sync),
            "async" => Ok(DurabilityMode::Async),
            "none" | "memory" => Ok(DurabilityMode::None),
            other => Err(DbError::validation(format!(
                "durability must be sync, async or none, got '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// WAL Manager
// ============================================================================

pub struct WalManager {
    wal_path: PathBuf,
    wal_file: Option<BufWriter<File>>,
    durability_mode: DurabilityMode,
    entries_since_checkpoint: usize,
    checkpoint_threshold: usize,
}

impl WalManager {
    pub fn new<P: AsRef<Path>>(wal_path: P, durability_mode: DurabilityMode) -> Result<Self> {
        let wal_path = wal_path.as_ref().to_path_buf();
        if let Some(parent) = wal_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                DbError::storage(format!("Failed to create WAL directory: {}", e))
            })?;
        }

        let wal_file = if durability_mode != DurabilityMode::None {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&wal_path)
                .map_err(|e| DbError::storage(format!("Failed to open WAL file: {}", e)))?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(Self {
            wal_path,
            wal_file,
            durability_mode,
            entries_since_checkpoint: 0,
            checkpoint_threshold: 1000,
        })
    }

    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let file = self
            .wal_file
            .as_mut()
            .ok_or_else(|| DbError::storage("WAL file not initialized"))?;
        let serialized = rmp_serde::to_vec(entry)?;
        let len = serialized.len() as u32;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(&serialized)?;
        file.flush()?;
        if self.durability_mode == DurabilityMode::Sync {
            file.get_mut().sync_all()?;
        }
        self.entries_since_checkpoint += 1;
        Ok(())
    }

    /// Read every complete entry. A torn tail (crash mid-append) ends the
    /// log; the commit it belonged to was never acknowledged.
    pub fn read_all(&self) -> Result<Vec<WalEntry>> {
        if !self.wal_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.wal_path)?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut data = vec![0u8; len];
            if let Err(e) = reader.read_exact(&mut data) {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    warn!(path = %self.wal_path.display(), "ignoring truncated WAL tail");
                    break;
                }
                return Err(e.into());
            }
            entries.push(rmp_serde::from_slice(&data)?);
        }
        Ok(entries)
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.wal_file = None;
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.wal_path)
            .map_err(|e| DbError::storage(format!("Failed to truncate WAL: {}", e)))?;
        self.wal_file = Some(BufWriter::new(file));
        self.entries_since_checkpoint = 0;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.durability_mode != DurabilityMode::None
            && self.entries_since_checkpoint >= self.checkpoint_threshold
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.entries_since_checkpoint
    }

    pub fn set_checkpoint_threshold(&mut self, threshold: usize) {
        self.checkpoint_threshold = threshold.max(1);
    }
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    /// Write through a temp file and rename, so a crash leaves either the
    /// old or the new snapshot on disk.
    pub fn save(&self, snapshot: &DatabaseSnapshot) -> Result<()> {
        if let Some(parent) = self.snapshot_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = self.snapshot_path.with_extension("tmp");
        let temp_file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(temp_file);
        let serialized = rmp_serde::to_vec(snapshot)?;
        writer.write_all(&serialized)?;
        writer.flush()?;
        writer.get_mut().sync_all()?;
        fs::rename(&temp_path, &self.snapshot_path)?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<DatabaseSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let snapshot: DatabaseSnapshot = rmp_serde::from_slice(&data)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(DbError::storage(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }
}

// ============================================================================
// Persistence Manager
// ============================================================================

/// State rebuilt from disk at startup.
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub records: Vec<Record>,
    pub sequences: SequenceValues,
    pub commits: Vec<Vec<Change>>,
}

pub struct PersistenceManager {
    wal: WalManager,
    snapshot: SnapshotManager,
    durability_mode: DurabilityMode,
}

impl PersistenceManager {
    pub fn new<P: AsRef<Path>>(data_dir: P, durability_mode: DurabilityMode) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let wal = WalManager::new(data_dir.join(WAL_FILE), durability_mode)?;
        let snapshot = SnapshotManager::new(data_dir.join(SNAPSHOT_FILE));
        Ok(Self {
            wal,
            snapshot,
            durability_mode,
        })
    }

    pub fn log(&mut self, entry: &WalEntry) -> Result<()> {
        self.wal.append(entry)
    }

    pub fn checkpoint(&mut self, records: Vec<Record>, sequences: SequenceValues) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let snapshot = DatabaseSnapshot::new(records, sequences);
        let rows = snapshot.metadata.row_count;
        self.snapshot.save(&snapshot)?;
        let replayed = self.wal.entries_since_checkpoint();
        self.wal.clear()?;
        info!(rows, wal_entries = replayed, "checkpoint written");
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.wal.needs_checkpoint()
    }

    /// Load the last snapshot and the commits logged after it, oldest first.
    pub fn recover(&self) -> Result<Option<RecoveredState>> {
        let snapshot = self.snapshot.load()?;
        let wal_entries = self.wal.read_all()?;
        if snapshot.is_none() && wal_entries.is_empty() {
            return Ok(None);
        }

        let mut state = RecoveredState::default();
        if let Some(snapshot) = snapshot {
            debug!(rows = snapshot.metadata.row_count, "loaded snapshot");
            state.records = snapshot.records;
            state.sequences = snapshot.sequences;
        }
        state.commits = wal_entries
            .into_iter()
            .map(|entry| match entry {
                WalEntry::Commit { changes, .. } => changes,
            })
            .collect();
        Ok(Some(state))
    }

    pub fn wal(&self) -> &WalManager {
        &self.wal
    }

    pub fn wal_mut(&mut self) -> &mut WalManager {
        &mut self.wal
    }

    pub fn snapshot(&self) -> &SnapshotManager {
        &self.snapshot
    }

    pub fn durability_mode(&self) -> DurabilityMode {
        self.durability_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{HoldId, LegalHold, UserId};
    use chrono::Utc;
    use tempfile::TempDir;

    fn hold_record(id: i64) -> Record {
        Record::Hold(LegalHold {
            hold_id: HoldId(id),
            user_id: UserId(1),
            hold_reason: "litigation".into(),
            created_at: Utc::now(),
            released_at: None,
        })
    }

    #[test]
    fn test_wal_append_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let wal_path = temp_dir.path().join("test.wal");
        let mut wal = WalManager::new(&wal_path, DurabilityMode::Sync).unwrap();
        wal.append(&WalEntry::Commit {
            tx_id: 1,
            changes: vec![Change::Insert(hold_record(1))],
        })
        .unwrap();
        wal.append(&WalEntry::Commit {
            tx_id: 2,
            changes: vec![Change::Delete(hold_record(1))],
        })
        .unwrap();

        let entries = wal.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(&entries[1], WalEntry::Commit { tx_id: 2, changes } if changes[0].is_delete()));
    }

    #[test]
    fn test_truncated_tail_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let wal_path = temp_dir.path().join("test.wal");
        {
            let mut wal = WalManager::new(&wal_path, DurabilityMode::Sync).unwrap();
            wal.append(&WalEntry::Commit {
                tx_id: 1,
                changes: vec![Change::Insert(hold_record(1))],
            })
            .unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();

        let wal = WalManager::new(&wal_path, DurabilityMode::Sync).unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_snapshot_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let snapshot_mgr = SnapshotManager::new(temp_dir.path().join("test.snapshot"));
        let sequences = SequenceValues {
            hold: 2,
            ..Default::default()
        };
        snapshot_mgr
            .save(&DatabaseSnapshot::new(
                vec![hold_record(1), hold_record(2)],
                sequences,
            ))
            .unwrap();

        assert!(snapshot_mgr.exists());
        let loaded = snapshot_mgr.load().unwrap().unwrap();
        assert_eq!(loaded.metadata.row_count, 2);
        assert_eq!(loaded.sequences.hold, 2);
    }

    #[test]
    fn test_checkpoint_clears_wal() {
        let temp_dir = TempDir::new().unwrap();
        let mut persistence =
            PersistenceManager::new(temp_dir.path(), DurabilityMode::Sync).unwrap();
        persistence
            .log(&WalEntry::Commit {
                tx_id: 1,
                changes: vec![Change::Insert(hold_record(1))],
            })
            .unwrap();
        assert_eq!(persistence.wal().entries_since_checkpoint(), 1);

        persistence
            .checkpoint(vec![hold_record(1)], SequenceValues::default())
            .unwrap();
        assert_eq!(persistence.wal().entries_since_checkpoint(), 0);
        assert!(persistence.wal().read_all().unwrap().is_empty());

        // The log keeps working after truncation.
        persistence
            .log(&WalEntry::Commit {
                tx_id: 2,
                changes: vec![Change::Insert(hold_record(2))],
            })
            .unwrap();
        let recovered = persistence.recover().unwrap().unwrap();
        assert_eq!(recovered.records.len(), 1);
        assert_eq!(recovered.commits.len(), 1);
    }

    #[test]
    fn test_recover_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = PersistenceManager::new(temp_dir.path(), DurabilityMode::Async).unwrap();
        assert!(persistence.recover().unwrap().is_none());
    }

    #[test]
    fn test_durability_mode_parsing() {
        assert_eq!("SYNC".parse::<DurabilityMode>().unwrap(), DurabilityMode::Sync);
        assert_eq!("none".parse::<DurabilityMode>().unwrap(), DurabilityMode::None);
        assert!("fast".parse::<DurabilityMode>().is_err());
    }
}
