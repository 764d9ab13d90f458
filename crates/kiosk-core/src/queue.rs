//! ============================================================================
//! Pending Scan Queue - Durable record of OFFLINE grants awaiting sync
//! ============================================================================
//! FIFO by `(observed_at, id)`. Every mutation holds one async mutex across
//! both the in-memory list and the redb write, so the scan path and the
//! reconciliation worker never interleave. Records leave the queue only via
//! `remove` (authority acknowledged) or the retry ceiling.
//! ============================================================================

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::db::KioskDb;
use crate::retry::{calculate_delay, RetryOutcome, RetryPolicy};
use crate::types::{PendingSyncRecord, QueuedScan};

struct QueueState {
    items: Vec<QueuedScan>,
    next_id: u64,
}

impl QueueState {
    fn position(&self, id: u64) -> Option<usize> {
        self.items.iter().position(|q| q.id == id)
    }

    fn insert_ordered(&mut self, queued: QueuedScan) {
        let key = (queued.record.observed_at, queued.id);
        let at = self
            .items
            .partition_point(|q| (q.record.observed_at, q.id) <= key);
        self.items.insert(at, queued);
    }
}

pub struct PendingScanQueue {
    state: Mutex<QueueState>,
    store: Option<Arc<KioskDb>>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl PendingScanQueue {
    /// Queue without persistence
    pub fn in_memory(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: Vec::new(),
                next_id: 1,
            }),
            store: None,
            policy,
            clock,
        }
    }

    /// Queue mirrored into the store, reloading whatever a previous run left
    pub fn open(store: Arc<KioskDb>, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Result<Self> {
        let persisted = store.list_pending()?;
        let next_id = persisted.iter().map(|q| q.id).max().unwrap_or(0) + 1;

        let mut state = QueueState {
            items: Vec::with_capacity(persisted.len()),
            next_id,
        };
        for queued in persisted {
            state.insert_ordered(queued);
        }

        if !state.items.is_empty() {
            info!("Restored {} pending scans awaiting reconciliation", state.items.len());
        }

        Ok(Self {
            state: Mutex::new(state),
            store: Some(store),
            policy,
            clock,
        })
    }

    /// Add an OFFLINE-decided scan. An exact duplicate (same token, kiosk and
    /// observation time) returns the id already queued.
    pub async fn enqueue(&self, record: PendingSyncRecord) -> Result<u64> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.items.iter().find(|q| q.record == record) {
            debug!("Scan already queued as {}", existing.id);
            return Ok(existing.id);
        }

        let queued = QueuedScan {
            id: state.next_id,
            next_attempt_at: record.observed_at,
            record,
            attempts: 0,
            last_error: None,
        };

        if let Some(store) = &self.store {
            store.put_pending(&queued)?;
        }

        let id = queued.id;
        state.next_id += 1;
        state.insert_ordered(queued);
        debug!("Queued scan {} ({} pending)", id, state.items.len());
        Ok(id)
    }

    /// Copies of the records whose backoff has elapsed, oldest first.
    /// Nothing is removed.
    pub async fn drain_due(&self) -> Vec<QueuedScan> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        state
            .items
            .iter()
            .filter(|q| q.next_attempt_at <= now)
            .cloned()
            .collect()
    }

    /// Drop a record the authority has acknowledged
    pub async fn remove(&self, id: u64) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(index) = state.position(id) else {
            return Ok(false);
        };

        if let Some(store) = &self.store {
            store.delete_pending(id)?;
        }
        state.items.remove(index);
        Ok(true)
    }

    /// Rejections recorded so far; 0 for unknown ids
    pub async fn retry_count(&self, id: u64) -> u32 {
        let state = self.state.lock().await;
        state
            .position(id)
            .map(|i| state.items[i].attempts)
            .unwrap_or(0)
    }

    /// Count one application-level rejection. Schedules a backoff, or drops
    /// the record once the policy is exhausted.
    pub async fn record_rejection(&self, id: u64, reason: &str) -> Result<RetryOutcome> {
        let mut state = self.state.lock().await;
        let Some(index) = state.position(id) else {
            return Ok(RetryOutcome::Missing);
        };

        let attempts = state.items[index].attempts + 1;

        if self.policy.exhausted(attempts) {
            if let Some(store) = &self.store {
                store.delete_pending(id)?;
            }
            let dropped = state.items.remove(index);
            error!(
                "Dropping queued scan {} from kiosk {} observed at {} after {} rejected replays: {}",
                id, dropped.record.kiosk_id, dropped.record.observed_at, attempts, reason
            );
            return Ok(RetryOutcome::Dropped { attempts });
        }

        let delay = calculate_delay(attempts, &self.policy);
        let mut updated = state.items[index].clone();
        updated.attempts = attempts;
        updated.last_error = Some(reason.to_string());
        updated.next_attempt_at = self.clock.now()
            + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());

        if let Some(store) = &self.store {
            store.put_pending(&updated)?;
        }
        state.items[index] = updated;

        warn!(
            "Replay of queued scan {} rejected ({}/{}), retrying in {:?}: {}",
            id, attempts, self.policy.max_attempts, delay, reason
        );
        Ok(RetryOutcome::Retry { attempts, delay })
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.items.is_empty()
    }

    /// Snapshot of the whole queue in FIFO order
    pub async fn list(&self) -> Vec<QueuedScan> {
        self.state.lock().await.items.clone()
    }
}
