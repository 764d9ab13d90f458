//! ============================================================================
//! Kiosk Service - Scan path plus the two background loops
//! ============================================================================
//! `start` spawns the roster refresher and the reconciliation worker on the
//! current runtime. Both watch one stop channel; `shutdown` flips it and waits
//! for the loops to finish their current iteration.
//! ============================================================================

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::context::KioskContext;
use crate::engine::ScanDecisionEngine;
use crate::reconcile::ReconciliationWorker;
use crate::refresher::RosterRefresher;
use crate::types::{OperatingMode, ScanAttempt};

pub struct KioskService {
    engine: ScanDecisionEngine,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl KioskService {
    pub fn start(ctx: KioskContext) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);

        let refresher = RosterRefresher::new(ctx.clone());
        let worker = ReconciliationWorker::new(ctx.clone());
        let tasks = vec![
            tokio::spawn(refresher.run(stop_rx.clone())),
            tokio::spawn(worker.run(stop_rx)),
        ];

        info!(
            "Kiosk {} started in {} mode",
            ctx.config.kiosk_id,
            ctx.connectivity.mode()
        );

        Self {
            engine: ScanDecisionEngine::new(ctx),
            stop_tx,
            tasks,
        }
    }

    /// Decide a scan presented at this kiosk
    pub async fn scan(&self, token: &str) -> ScanAttempt {
        let kiosk_id = self.engine.context().config.kiosk_id.clone();
        self.engine.decide(token, &kiosk_id).await
    }

    /// Decide a scan on behalf of an explicit kiosk id
    pub async fn decide(&self, token: &str, kiosk_id: &str) -> ScanAttempt {
        self.engine.decide(token, kiosk_id).await
    }

    pub fn mode(&self) -> OperatingMode {
        self.engine.context().connectivity.mode()
    }

    pub fn context(&self) -> &KioskContext {
        self.engine.context()
    }

    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Kiosk service stopped");
    }
}
