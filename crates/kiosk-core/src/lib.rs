//! ============================================================================
//! KIOSK-CORE: Gym Entry Access Verification
//! ============================================================================
//! This crate decides whether a scanned member token opens the door:
//! - ONLINE: the remote authority decides via reqwest
//! - OFFLINE: local judgment against a cached roster snapshot
//! - OFFLINE grants are queued in redb and replayed once reachable again
//! ============================================================================

pub mod clock;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod db;
pub mod engine;
pub mod queue;
pub mod reconcile;
pub mod refresher;
pub mod remote;
pub mod retry;
pub mod roster;
pub mod service;
pub mod token;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use types::*;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{KioskConfig, StalePolicy};
pub use connectivity::ConnectivityMonitor;
pub use context::KioskContext;
pub use db::KioskDb;
pub use engine::ScanDecisionEngine;
pub use queue::PendingScanQueue;
pub use reconcile::{ReconcileReport, ReconciliationWorker};
pub use refresher::RosterRefresher;
pub use remote::{HttpAuthority, RemoteAuthority, RemoteError};
pub use roster::{RosterCache, RosterSnapshot};
pub use service::KioskService;
pub use token::{Claims, DecodeError};
