//! ============================================================================
//! Core Types for the Kiosk Engine
//! ============================================================================
//! Scan decisions, operating modes, roster entries and queued sync records.
//! The same structs travel over the authority API (JSON) and into the local
//! store (bincode), so none of them use skip-style serde attributes.
//! ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reason shown when a token cannot be decoded
pub const REASON_INVALID_TOKEN: &str = "Invalid QR Code";
/// Reason for an OFFLINE denial on an expired token
pub const REASON_OFFLINE_EXPIRED: &str = "Token Expired (Offline Check)";
/// Reason for an OFFLINE grant
pub const REASON_OFFLINE_GRANTED: &str = "Offline Access Granted";
/// Reason for an OFFLINE denial on a missing or lapsed membership
pub const REASON_OFFLINE_NO_SUBSCRIPTION: &str = "No Active Subscription (Offline Check)";
/// Reason for an OFFLINE denial when the roster is older than the stale threshold
pub const REASON_OFFLINE_STALE: &str = "Offline Roster Too Stale";
/// Display name used when the member is not in the cached roster
pub const UNKNOWN_MEMBER: &str = "Unknown User";

/// Terminal outcome of a scan attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanDecision {
    Granted,
    Denied,
    AlreadyScanned,
    Error,
}

impl ScanDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanDecision::Granted => "GRANTED",
            ScanDecision::Denied => "DENIED",
            ScanDecision::AlreadyScanned => "ALREADY_SCANNED",
            ScanDecision::Error => "ERROR",
        }
    }

    /// Default operator-facing reason when the authority supplies none
    pub fn default_reason(&self) -> &'static str {
        match self {
            ScanDecision::Granted => "Access Granted",
            ScanDecision::Denied => "Access Denied",
            ScanDecision::AlreadyScanned => "Already Scanned",
            ScanDecision::Error => REASON_INVALID_TOKEN,
        }
    }
}

impl std::fmt::Display for ScanDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the remote authority is currently reachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingMode {
    Online,
    Offline,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Online => "ONLINE",
            OperatingMode::Offline => "OFFLINE",
        }
    }
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One member row from the authority's active roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub member_id: String,
    pub display_name: String,
    pub access_valid: bool,
}

/// The record of one presented token and how it was decided.
/// Immutable once built by the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanAttempt {
    pub id: Uuid,
    pub token: String,
    pub kiosk_id: String,
    pub observed_at: DateTime<Utc>,
    pub decision: ScanDecision,
    pub mode_used: OperatingMode,
    pub reason: String,
    /// Subject from the token claims, when they could be decoded
    pub member_id: Option<String>,
    pub member_name: String,
}

impl ScanAttempt {
    pub fn is_granted(&self) -> bool {
        self.decision == ScanDecision::Granted
    }
}

/// A scan decided OFFLINE that still has to be reported to the authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSyncRecord {
    pub token: String,
    pub kiosk_id: String,
    pub observed_at: DateTime<Utc>,
}

/// Queue envelope around a [`PendingSyncRecord`] with its retry bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedScan {
    pub id: u64,
    pub record: PendingSyncRecord,
    /// Replays the authority has rejected so far
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Body of a `verify_scan` call, used both for live scans and replays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyScanRequest {
    pub token: String,
    pub kiosk_id: String,
    pub observed_at: DateTime<Utc>,
    /// True when reporting a scan that was already decided OFFLINE
    pub replay: bool,
}

impl VerifyScanRequest {
    pub fn live(token: &str, kiosk_id: &str, observed_at: DateTime<Utc>) -> Self {
        Self {
            token: token.to_string(),
            kiosk_id: kiosk_id.to_string(),
            observed_at,
            replay: false,
        }
    }

    pub fn replay(record: &PendingSyncRecord) -> Self {
        Self {
            token: record.token.clone(),
            kiosk_id: record.kiosk_id.clone(),
            observed_at: record.observed_at,
            replay: true,
        }
    }
}

/// Authoritative answer from `verify_scan`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVerdict {
    pub status: ScanDecision,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub member_name: Option<String>,
}
