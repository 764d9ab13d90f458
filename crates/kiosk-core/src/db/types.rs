//! ============================================================================
//! Database Types - Summary records for the kiosk store
//! ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::OperatingMode;

/// Store overview for the CLI and exports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStats {
    pub roster_members: usize,
    /// Last successful roster refresh, if any
    pub roster_refreshed_at: Option<DateTime<Utc>>,
    /// Offline scans still waiting for reconciliation
    pub pending_scans: usize,
    pub total_scans: usize,
    /// Logged scans keyed by decision name
    pub decision_counts: HashMap<String, usize>,
    /// Last persisted operating mode
    pub mode: Option<OperatingMode>,
}
