//! ============================================================================
//! Connectivity Monitor - ONLINE / OFFLINE operating mode
//! ============================================================================
//! The mode follows the outcome of the most recent remote call:
//! - completed call (any verdict, including a rejection) -> unchanged or ONLINE
//! - transport failure (timeout, refused, no response)   -> OFFLINE
//!
//! Rejections are not reported here at all; only the two methods below move
//! the state. Transitions are published on a watch channel and persisted.
//! ============================================================================

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::db::KioskDb;
use crate::types::OperatingMode;

pub struct ConnectivityMonitor {
    mode: watch::Sender<OperatingMode>,
    store: Option<Arc<KioskDb>>,
}

impl ConnectivityMonitor {
    pub fn new(initial: OperatingMode) -> Self {
        let (mode, _) = watch::channel(initial);
        Self { mode, store: None }
    }

    /// Monitor that persists every transition to the store
    pub fn with_store(initial: OperatingMode, store: Arc<KioskDb>) -> Self {
        let (mode, _) = watch::channel(initial);
        Self {
            mode,
            store: Some(store),
        }
    }

    pub fn mode(&self) -> OperatingMode {
        *self.mode.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.mode() == OperatingMode::Online
    }

    pub fn subscribe(&self) -> watch::Receiver<OperatingMode> {
        self.mode.subscribe()
    }

    /// A remote call completed; the authority is reachable
    pub fn record_success(&self, source: &str) {
        if self.transition(OperatingMode::Online) {
            info!("Authority reachable again via {} - switching to ONLINE", source);
        }
    }

    /// A remote call failed below the application layer
    pub fn record_transport_failure(&self, source: &str, error: &str) {
        if self.transition(OperatingMode::Offline) {
            warn!(
                "Authority unreachable during {} ({}) - switching to OFFLINE",
                source, error
            );
        }
    }

    /// Returns true when the mode actually changed
    fn transition(&self, to: OperatingMode) -> bool {
        let changed = self.mode.send_if_modified(|current| {
            if *current == to {
                false
            } else {
                *current = to;
                true
            }
        });

        if changed {
            if let Some(store) = &self.store {
                if let Err(e) = store.store_mode(to) {
                    warn!("Failed to persist operating mode {}: {}", to, e);
                }
            }
        }
        changed
    }
}
