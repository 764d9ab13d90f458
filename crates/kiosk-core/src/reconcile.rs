//! ============================================================================
//! Reconciliation Worker - Replays OFFLINE grants to the authority
//! ============================================================================
//! Runs only while ONLINE. Each cycle walks the due records oldest first:
//! - acknowledged (any verdict)  -> removed from the queue
//! - rejected / unreadable reply -> retry counted, backoff scheduled
//! - transport failure           -> go OFFLINE, stop the cycle, record untouched
//!
//! The replay carries the original token, kiosk and observation time so the
//! authority can tell it apart from a live scan.
//! ============================================================================

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::context::KioskContext;
use crate::remote::RemoteError;
use crate::retry::RetryOutcome;
use crate::types::{OperatingMode, QueuedScan, ScanDecision, VerifyScanRequest};

/// Outcome of one reconciliation cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Acknowledged and removed
    pub replayed: usize,
    /// Rejected and rescheduled
    pub rejected: usize,
    /// Gave up after the retry ceiling
    pub dropped: usize,
    /// Cycle cut short by a transport failure
    pub interrupted: bool,
}

impl ReconcileReport {
    pub fn is_idle(&self) -> bool {
        self.replayed == 0 && self.rejected == 0 && self.dropped == 0 && !self.interrupted
    }
}

pub struct ReconciliationWorker {
    ctx: KioskContext,
}

impl ReconciliationWorker {
    pub fn new(ctx: KioskContext) -> Self {
        Self { ctx }
    }

    /// One pass over the due records. Does nothing while OFFLINE.
    pub async fn run_cycle(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        if !self.ctx.connectivity.is_online() {
            debug!("Skipping reconciliation while OFFLINE");
            return report;
        }

        let due = self.ctx.queue.drain_due().await;
        if due.is_empty() {
            return report;
        }
        info!("Reconciling {} queued offline scans", due.len());

        for queued in due {
            match self.replay(&queued).await {
                Ok(status) => {
                    self.ctx.connectivity.record_success("reconcile");
                    if status != ScanDecision::Granted {
                        // The door already opened; the authority has the record now
                        warn!(
                            "Authority answered {} for offline grant {} observed at {}",
                            status, queued.id, queued.record.observed_at
                        );
                    }
                    match self.ctx.queue.remove(queued.id).await {
                        Ok(_) => report.replayed += 1,
                        Err(e) => error!("Failed to remove reconciled scan {}: {}", queued.id, e),
                    }
                }
                Err(RemoteError::Transport(e)) => {
                    self.ctx.connectivity.record_transport_failure("reconcile", &e);
                    report.interrupted = true;
                    break;
                }
                Err(e) => match self.ctx.queue.record_rejection(queued.id, &e.to_string()).await {
                    Ok(RetryOutcome::Retry { .. }) => report.rejected += 1,
                    Ok(RetryOutcome::Dropped { .. }) => report.dropped += 1,
                    Ok(RetryOutcome::Missing) => {}
                    Err(e) => error!("Failed to record rejection for scan {}: {}", queued.id, e),
                },
            }
        }

        info!(
            "Reconciliation cycle: {} replayed, {} rejected, {} dropped{}",
            report.replayed,
            report.rejected,
            report.dropped,
            if report.interrupted { " (interrupted)" } else { "" }
        );
        report
    }

    async fn replay(&self, queued: &QueuedScan) -> Result<ScanDecision, RemoteError> {
        let request = VerifyScanRequest::replay(&queued.record);
        let timeout = self.ctx.config.request_timeout();

        match tokio::time::timeout(timeout, self.ctx.remote.verify_scan(&request)).await {
            Ok(result) => result.map(|verdict| verdict.status),
            Err(_) => Err(RemoteError::Transport(format!(
                "replay timed out after {:?}",
                timeout
            ))),
        }
    }

    /// Cycle on every interval tick and on every transition back to ONLINE,
    /// until `stop_rx` flips to true
    pub async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let period = self.ctx.config.reconcile_interval();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut mode_rx = self.ctx.connectivity.subscribe();

        info!("Reconciliation worker started (every {:?})", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = mode_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *mode_rx.borrow_and_update() != OperatingMode::Online {
                        continue;
                    }
                    debug!("Back ONLINE; reconciling immediately");
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            self.run_cycle().await;
        }

        info!("Reconciliation worker stopped");
    }
}
