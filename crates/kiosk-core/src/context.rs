//! ============================================================================
//! Kiosk Context - Shared state handed to every engine component
//! ============================================================================
//! The connectivity mode and the roster snapshot are the only state shared
//! between the scan path and the background loops; both live here together
//! with the injected clock and transport.
//! ============================================================================

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

use crate::clock::Clock;
use crate::config::KioskConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::db::KioskDb;
use crate::queue::PendingScanQueue;
use crate::remote::RemoteAuthority;
use crate::roster::RosterCache;
use crate::types::OperatingMode;

#[derive(Clone)]
pub struct KioskContext {
    pub config: Arc<KioskConfig>,
    pub clock: Arc<dyn Clock>,
    pub remote: Arc<dyn RemoteAuthority>,
    pub roster: Arc<RosterCache>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub queue: Arc<PendingScanQueue>,
    pub store: Option<Arc<KioskDb>>,
    /// Wakes the roster refresher ahead of its next tick
    pub refresh_hint: Arc<Notify>,
}

impl KioskContext {
    /// Context without persistence, starting ONLINE with an empty roster
    pub fn in_memory(
        config: KioskConfig,
        remote: Arc<dyn RemoteAuthority>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue = PendingScanQueue::in_memory(config.retry_policy(), Arc::clone(&clock));
        Self {
            roster: Arc::new(RosterCache::new(Arc::clone(&clock))),
            connectivity: Arc::new(ConnectivityMonitor::new(OperatingMode::Online)),
            queue: Arc::new(queue),
            store: None,
            refresh_hint: Arc::new(Notify::new()),
            config: Arc::new(config),
            remote,
            clock,
        }
    }

    /// Context backed by the store: restores the roster snapshot, the pending
    /// queue and the last operating mode left by a previous run
    pub async fn open(
        config: KioskConfig,
        remote: Arc<dyn RemoteAuthority>,
        clock: Arc<dyn Clock>,
        store: Arc<KioskDb>,
    ) -> Result<Self> {
        let roster = RosterCache::new(Arc::clone(&clock));
        match store.load_roster()? {
            Some(snapshot) => roster.restore(snapshot).await,
            None => info!("No persisted roster; OFFLINE scans fail closed until the first refresh"),
        }

        let mode = store.load_mode()?.unwrap_or(OperatingMode::Online);
        info!("Starting in {} mode", mode);

        let queue = PendingScanQueue::open(
            Arc::clone(&store),
            config.retry_policy(),
            Arc::clone(&clock),
        )?;

        Ok(Self {
            roster: Arc::new(roster),
            connectivity: Arc::new(ConnectivityMonitor::with_store(mode, Arc::clone(&store))),
            queue: Arc::new(queue),
            store: Some(store),
            refresh_hint: Arc::new(Notify::new()),
            config: Arc::new(config),
            remote,
            clock,
        })
    }
}
