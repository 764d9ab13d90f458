// ============================================================================
// KioskDb - Embedded Database (redb)
// ============================================================================
// Persistent local storage for the roster snapshot, the pending sync queue,
// the operating mode and the local scan log.
// Default path: ~/.kiosk/kiosk.redb (override via KIOSK_DB_PATH env var)
// ============================================================================

pub mod types;

pub use types::DbStats;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use redb::{Database, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::roster::RosterSnapshot;
use crate::types::{OperatingMode, QueuedScan, ScanAttempt};

// Table definitions
const ROSTER: TableDefinition<&str, &[u8]> = TableDefinition::new("roster");
const PENDING: TableDefinition<u64, &[u8]> = TableDefinition::new("pending");
const STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("state");
const SCANS: TableDefinition<&str, &[u8]> = TableDefinition::new("scans");

const ROSTER_KEY: &str = "roster:snapshot";
const MODE_KEY: &str = "state:mode";

/// Embedded database for one kiosk
pub struct KioskDb {
    db: Database,
    path: PathBuf,
}

impl KioskDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses KIOSK_DB_PATH env var or ~/.kiosk/kiosk.redb
    pub fn open(path: Option<&str>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var("KIOSK_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
            let kiosk_dir = home.join(".kiosk");
            std::fs::create_dir_all(&kiosk_dir)
                .map_err(|e| anyhow!("Failed to create .kiosk directory: {}", e))?;
            kiosk_dir.join("kiosk.redb")
        };

        info!("Opening database at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| anyhow!("Failed to open database: {}", e))?;

        // Ensure tables exist by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let _ = write_txn.open_table(ROSTER).map_err(|e| anyhow!("Failed to create roster table: {}", e))?;
            let _ = write_txn.open_table(PENDING).map_err(|e| anyhow!("Failed to create pending table: {}", e))?;
            let _ = write_txn.open_table(STATE).map_err(|e| anyhow!("Failed to create state table: {}", e))?;
            let _ = write_txn.open_table(SCANS).map_err(|e| anyhow!("Failed to create scans table: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        info!("Database ready");

        Ok(Self { db, path: db_path })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Roster Snapshot
    // ========================================================================

    pub fn store_roster(&self, snapshot: &RosterSnapshot) -> Result<()> {
        let value = encode(snapshot, "roster snapshot")?;

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(ROSTER)
                .map_err(|e| anyhow!("Failed to open roster table: {}", e))?;
            table.insert(ROSTER_KEY, value.as_slice())
                .map_err(|e| anyhow!("Failed to insert roster: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Stored roster snapshot ({} members)", snapshot.len());
        Ok(())
    }

    pub fn load_roster(&self) -> Result<Option<RosterSnapshot>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(ROSTER)
            .map_err(|e| anyhow!("Failed to open roster table: {}", e))?;

        match table.get(ROSTER_KEY).map_err(|e| anyhow!("Failed to get roster: {}", e))? {
            Some(value) => Ok(Some(decode(value.value(), "roster snapshot")?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Operating Mode
    // ========================================================================

    pub fn store_mode(&self, mode: OperatingMode) -> Result<()> {
        let value = encode(&mode, "operating mode")?;

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(STATE)
                .map_err(|e| anyhow!("Failed to open state table: {}", e))?;
            table.insert(MODE_KEY, value.as_slice())
                .map_err(|e| anyhow!("Failed to insert mode: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Stored operating mode: {}", mode);
        Ok(())
    }

    pub fn load_mode(&self) -> Result<Option<OperatingMode>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(STATE)
            .map_err(|e| anyhow!("Failed to open state table: {}", e))?;

        match table.get(MODE_KEY).map_err(|e| anyhow!("Failed to get mode: {}", e))? {
            Some(value) => Ok(Some(decode(value.value(), "operating mode")?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Pending Sync Queue
    // ========================================================================

    /// Insert or overwrite a queued scan
    pub fn put_pending(&self, queued: &QueuedScan) -> Result<()> {
        let value = encode(queued, "queued scan")?;

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(PENDING)
                .map_err(|e| anyhow!("Failed to open pending table: {}", e))?;
            table.insert(queued.id, value.as_slice())
                .map_err(|e| anyhow!("Failed to insert queued scan: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Stored queued scan: {}", queued.id);
        Ok(())
    }

    /// All queued scans in id order
    pub fn list_pending(&self) -> Result<Vec<QueuedScan>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(PENDING)
            .map_err(|e| anyhow!("Failed to open pending table: {}", e))?;

        let mut results = Vec::new();
        let iter = table.range::<u64>(..)
            .map_err(|e| anyhow!("Failed to iterate pending: {}", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push(decode(value.value(), "queued scan")?);
        }
        Ok(results)
    }

    pub fn delete_pending(&self, id: u64) -> Result<bool> {
        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let removed;
        {
            let mut table = write_txn.open_table(PENDING)
                .map_err(|e| anyhow!("Failed to open pending table: {}", e))?;
            removed = table.remove(id)
                .map_err(|e| anyhow!("Failed to remove queued scan: {}", e))?
                .is_some();
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit delete: {}", e))?;

        if removed {
            debug!("Deleted queued scan: {}", id);
        }
        Ok(removed)
    }

    // ========================================================================
    // Scan Log
    // ========================================================================

    pub fn append_scan(&self, attempt: &ScanAttempt) -> Result<()> {
        let key = scan_key(attempt);
        let value = encode(attempt, "scan attempt")?;

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(SCANS)
                .map_err(|e| anyhow!("Failed to open scans table: {}", e))?;
            table.insert(key.as_str(), value.as_slice())
                .map_err(|e| anyhow!("Failed to insert scan: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Logged scan {} ({})", attempt.id, attempt.decision);
        Ok(())
    }

    /// Scan log, newest first
    pub fn list_scans(&self, limit: Option<usize>) -> Result<Vec<ScanAttempt>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(SCANS)
            .map_err(|e| anyhow!("Failed to open scans table: {}", e))?;

        let mut results = Vec::new();
        let iter = table.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate scans: {}", e))?;
        for entry in iter.rev() {
            if limit.is_some_and(|max| results.len() >= max) {
                break;
            }
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push(decode(value.value(), "scan attempt")?);
        }
        Ok(results)
    }

    /// Logged scans observed before `cutoff`, oldest first
    pub fn scans_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScanAttempt>> {
        let upper = time_prefix(cutoff);

        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(SCANS)
            .map_err(|e| anyhow!("Failed to open scans table: {}", e))?;

        let mut results = Vec::new();
        let iter = table.range::<&str>(..upper.as_str())
            .map_err(|e| anyhow!("Failed to iterate scans: {}", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push(decode(value.value(), "scan attempt")?);
        }
        Ok(results)
    }

    /// Prune logged scans older than the given number of days.
    /// The pending queue is never touched here.
    /// Returns the number of scans deleted.
    pub fn prune_scans(&self, older_than_days: i64) -> Result<usize> {
        let cutoff = prune_cutoff(Utc::now(), older_than_days)?;
        let stale: Vec<String> = self
            .scans_before(cutoff)?
            .iter()
            .map(scan_key)
            .collect();

        if stale.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let mut deleted = 0;
        {
            let mut table = write_txn.open_table(SCANS)
                .map_err(|e| anyhow!("Failed to open scans table: {}", e))?;
            for key in &stale {
                if table.remove(key.as_str())
                    .map_err(|e| anyhow!("Failed to remove scan: {}", e))?
                    .is_some()
                {
                    deleted += 1;
                }
            }
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit prune: {}", e))?;

        if deleted > 0 {
            info!("Pruned {} logged scans older than {} days", deleted, older_than_days);
        }
        Ok(deleted)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<DbStats> {
        let roster = self.load_roster()?;
        let pending = self.list_pending()?;
        let scans = self.list_scans(None)?;

        let mut decision_counts = HashMap::new();
        for scan in &scans {
            *decision_counts.entry(scan.decision.to_string()).or_insert(0usize) += 1;
        }

        Ok(DbStats {
            roster_members: roster.as_ref().map(|r| r.len()).unwrap_or(0),
            roster_refreshed_at: roster.and_then(|r| r.refreshed_at),
            pending_scans: pending.len(),
            total_scans: scans.len(),
            decision_counts,
            mode: self.load_mode()?,
        })
    }
}

fn encode<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| anyhow!("Failed to serialize {}: {}", what, e))
}

fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| anyhow!("Failed to deserialize {}: {}", what, e))
}

/// `now` minus the given number of days. Errors instead of panicking when
/// the span does not fit a timestamp.
pub fn prune_cutoff(now: DateTime<Utc>, older_than_days: i64) -> Result<DateTime<Utc>> {
    if older_than_days < 0 {
        return Err(anyhow!("Retention must not be negative, got {} days", older_than_days));
    }
    chrono::Duration::try_days(older_than_days)
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| anyhow!("Retention of {} days is out of range", older_than_days))
}

/// Sortable key prefix; pre-epoch times clamp to zero
fn time_prefix(at: DateTime<Utc>) -> String {
    format!("{:020}", at.timestamp_millis().max(0))
}

fn scan_key(attempt: &ScanAttempt) -> String {
    format!("{}:{}", time_prefix(attempt.observed_at), attempt.id)
}
