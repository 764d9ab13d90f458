//! Periodic roster pull. Also serves as the connectivity probe while the
//! kiosk is OFFLINE: the first successful pull flips it back ONLINE.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::context::KioskContext;
use crate::remote::RemoteError;
use crate::types::OperatingMode;

pub struct RosterRefresher {
    ctx: KioskContext,
}

impl RosterRefresher {
    pub fn new(ctx: KioskContext) -> Self {
        Self { ctx }
    }

    /// Pull the full roster once and install it. Returns the member count.
    pub async fn refresh_once(&self) -> Result<usize, RemoteError> {
        let timeout = self.ctx.config.request_timeout();
        let result = match tokio::time::timeout(timeout, self.ctx.remote.active_roster()).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Transport(format!(
                "active_roster timed out after {:?}",
                timeout
            ))),
        };

        let entries = match result {
            Ok(entries) => entries,
            Err(RemoteError::Transport(e)) => {
                self.ctx
                    .connectivity
                    .record_transport_failure("active_roster", &e);
                return Err(RemoteError::Transport(e));
            }
            Err(e) => {
                warn!("Roster refresh failed, keeping previous snapshot: {}", e);
                return Err(e);
            }
        };

        let snapshot = self.ctx.roster.refresh(entries).await;
        self.ctx.connectivity.record_success("active_roster");

        if let Some(store) = &self.ctx.store {
            if let Err(e) = store.store_roster(&snapshot) {
                error!("Failed to persist roster snapshot: {}", e);
            }
        }
        Ok(snapshot.len())
    }

    /// While OFFLINE, try one roster pull so a recovered authority is noticed
    /// before deciding. Returns the mode afterwards.
    pub async fn probe_if_offline(&self) -> OperatingMode {
        if self.ctx.connectivity.is_online() {
            return OperatingMode::Online;
        }
        if let Err(e) = self.refresh_once().await {
            debug!("Authority still unreachable: {}", e);
        }
        self.ctx.connectivity.mode()
    }

    /// Refresh on every interval tick or early refresh hint until `stop_rx`
    /// flips to true. The first tick fires immediately.
    pub async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let period = self.ctx.config.roster_refresh_interval();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let hint = Arc::clone(&self.ctx.refresh_hint);

        info!("Roster refresher started (every {:?})", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = hint.notified() => {
                    debug!("Early roster refresh requested");
                    ticker.reset();
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.refresh_once().await {
                debug!("Roster refresh attempt failed: {}", e);
            }
        }

        info!("Roster refresher stopped");
    }
}
