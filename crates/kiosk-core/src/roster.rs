//! ============================================================================
//! Roster Cache - Latest known set of members with valid access
//! ============================================================================
//! Holds one immutable snapshot behind an `Arc`. A refresh builds the new
//! snapshot off-lock and swaps the pointer, so a lookup sees either the old
//! roster or the new one, never a blend.
//! ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::types::RosterEntry;

/// One coherent roster as received from the authority
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RosterSnapshot {
    pub entries: HashMap<String, RosterEntry>,
    /// When the refresh that produced this snapshot succeeded. `None` until
    /// the first successful refresh.
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl RosterSnapshot {
    /// Build a snapshot from a roster listing. A duplicated member id keeps
    /// the last row.
    pub fn from_entries(entries: Vec<RosterEntry>, refreshed_at: DateTime<Utc>) -> Self {
        let entries = entries
            .into_iter()
            .map(|entry| (entry.member_id.clone(), entry))
            .collect();
        Self {
            entries,
            refreshed_at: Some(refreshed_at),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Members whose access is currently valid
    pub fn valid_count(&self) -> usize {
        self.entries.values().filter(|e| e.access_valid).count()
    }

    pub fn get(&self, member_id: &str) -> Option<&RosterEntry> {
        self.entries.get(member_id)
    }

    /// Age at `now`, `Duration::MAX` if never refreshed
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        match self.refreshed_at {
            Some(at) => (now - at).to_std().unwrap_or(Duration::ZERO),
            None => Duration::MAX,
        }
    }
}

/// Atomically swapped roster snapshot
pub struct RosterCache {
    current: RwLock<Arc<RosterSnapshot>>,
    clock: Arc<dyn Clock>,
}

impl RosterCache {
    /// Empty cache. OFFLINE judgments against it fail closed.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            current: RwLock::new(Arc::new(RosterSnapshot::default())),
            clock,
        }
    }

    /// Replace the whole roster. Never merges with the previous snapshot.
    pub async fn refresh(&self, entries: Vec<RosterEntry>) -> Arc<RosterSnapshot> {
        let snapshot = Arc::new(RosterSnapshot::from_entries(entries, self.clock.now()));
        *self.current.write().await = Arc::clone(&snapshot);

        info!(
            "Roster refreshed: {} members ({} with valid access)",
            snapshot.len(),
            snapshot.valid_count()
        );
        snapshot
    }

    /// Install a previously persisted snapshot (startup only)
    pub async fn restore(&self, snapshot: RosterSnapshot) {
        debug!(
            "Restoring roster snapshot with {} members (refreshed at {:?})",
            snapshot.len(),
            snapshot.refreshed_at
        );
        *self.current.write().await = Arc::new(snapshot);
    }

    pub async fn lookup(&self, member_id: &str) -> Option<RosterEntry> {
        self.snapshot().await.entries.get(member_id).cloned()
    }

    /// The current snapshot; holding it pins that roster version
    pub async fn snapshot(&self) -> Arc<RosterSnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    /// Time since the last successful refresh, `Duration::MAX` if none ever
    /// succeeded
    pub async fn snapshot_age(&self) -> Duration {
        self.snapshot().await.age_at(self.clock.now())
    }

    pub async fn len(&self) -> usize {
        self.snapshot().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshot().await.is_empty()
    }
}
