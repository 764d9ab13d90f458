//! ============================================================================
//! Kiosk Configuration
//! ============================================================================
//! Defaults suit a single entrance kiosk; every field can be overridden from
//! the environment (a `.env` file is loaded by the binary before this runs).
//! ============================================================================

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::retry::RetryPolicy;

/// Bound on any single call to the authority
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Roster refresh / connectivity probe period
pub const DEFAULT_ROSTER_REFRESH_SECS: u64 = 60;

/// Pending queue drain period
pub const DEFAULT_RECONCILE_SECS: u64 = 30;

/// Rejected replays before a queued scan is dropped
pub const DEFAULT_MAX_RECONCILE_ATTEMPTS: u32 = 5;

/// Roster age beyond which OFFLINE grants fall under [`StalePolicy`] (24h)
pub const DEFAULT_STALE_AFTER_SECS: u64 = 24 * 60 * 60;

/// What an OFFLINE grant does when the roster snapshot is too old
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
    /// Deny the entry
    #[default]
    FailClosed,
    /// Grant anyway and log a warning
    WarnAndGrant,
}

impl FromStr for StalePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fail_closed" | "deny" => Ok(StalePolicy::FailClosed),
            "warn_and_grant" | "warn" | "grant" => Ok(StalePolicy::WarnAndGrant),
            _ => Err(anyhow!(
                "Unknown stale policy '{}'. Valid values: fail-closed, warn-and-grant",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KioskConfig {
    /// Identifier this kiosk reports to the authority
    pub kiosk_id: String,
    /// Base URL of the authority API
    pub api_base_url: String,
    /// Bearer key for the authority API
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub roster_refresh_secs: u64,
    pub reconcile_secs: u64,
    pub max_reconcile_attempts: u32,
    pub stale_after_secs: u64,
    pub stale_policy: StalePolicy,
    /// Store location; `None` falls back to KIOSK_DB_PATH or ~/.kiosk
    pub db_path: Option<String>,
}

impl Default for KioskConfig {
    fn default() -> Self {
        Self {
            kiosk_id: "kiosk-1".to_string(),
            api_base_url: "http://localhost:8080/api".to_string(),
            api_key: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            roster_refresh_secs: DEFAULT_ROSTER_REFRESH_SECS,
            reconcile_secs: DEFAULT_RECONCILE_SECS,
            max_reconcile_attempts: DEFAULT_MAX_RECONCILE_ATTEMPTS,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            stale_policy: StalePolicy::default(),
            db_path: None,
        }
    }
}

impl KioskConfig {
    /// Defaults overridden by KIOSK_* environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unparseable numbers are
    /// logged and ignored; a bad URL or stale policy is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(id) = lookup("KIOSK_ID") {
            config.kiosk_id = id;
        }
        if let Some(url) = lookup("KIOSK_API_URL") {
            config.api_base_url = url;
        }
        if let Some(key) = lookup("KIOSK_API_KEY").filter(|k| !k.is_empty()) {
            config.api_key = Some(key);
        }
        if let Some(path) = lookup("KIOSK_DB_PATH") {
            config.db_path = Some(path);
        }
        if let Some(policy) = lookup("KIOSK_STALE_POLICY") {
            config.stale_policy = policy.parse()?;
        }

        override_number(&lookup, "KIOSK_REQUEST_TIMEOUT_SECS", &mut config.request_timeout_secs);
        override_number(&lookup, "KIOSK_ROSTER_REFRESH_SECS", &mut config.roster_refresh_secs);
        override_number(&lookup, "KIOSK_RECONCILE_SECS", &mut config.reconcile_secs);
        override_number(&lookup, "KIOSK_MAX_RECONCILE_ATTEMPTS", &mut config.max_reconcile_attempts);
        override_number(&lookup, "KIOSK_STALE_AFTER_SECS", &mut config.stale_after_secs);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kiosk_id.trim().is_empty() {
            return Err(anyhow!("kiosk_id must not be empty"));
        }

        let url = url::Url::parse(&self.api_base_url)
            .map_err(|e| anyhow!("Invalid authority URL '{}': {}", self.api_base_url, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!("Authority URL must be http or https, got '{}'", url.scheme()));
        }

        for (name, secs) in [
            ("request_timeout_secs", self.request_timeout_secs),
            ("roster_refresh_secs", self.roster_refresh_secs),
            ("reconcile_secs", self.reconcile_secs),
        ] {
            if secs == 0 {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        if self.max_reconcile_attempts == 0 {
            return Err(anyhow!("max_reconcile_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn roster_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.roster_refresh_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    /// Backoff schedule for rejected replays
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_reconcile_attempts,
            ..RetryPolicy::default()
        }
    }
}

fn override_number<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!("Ignoring {}={:?}: not a valid number", key, raw),
        }
    }
}
