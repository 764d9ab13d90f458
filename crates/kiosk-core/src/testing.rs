//! Scriptable authority and fixtures shared by the unit tests.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::ManualClock;
use crate::config::KioskConfig;
use crate::context::KioskContext;
use crate::remote::{RemoteAuthority, RemoteError};
use crate::types::{RemoteVerdict, RosterEntry, ScanDecision, VerifyScanRequest};

/// Token from the reference scenario: subject `m1`, expiry 9999999999
pub const M1_TOKEN: &str = "hdr.eyJzdWJfaWQiOiJtMSIsImV4cCI6OTk5OTk5OTk5OX0.sig";

/// Clock start used by the fixtures (2023-11-14)
pub const NOW: i64 = 1_700_000_000;

#[derive(Debug, Clone)]
pub enum Reply {
    Verdict(RemoteVerdict),
    Fail(RemoteError),
    /// Never answers; the caller's timeout has to fire
    Hang,
}

impl Reply {
    pub fn status(status: ScanDecision, name: Option<&str>) -> Self {
        Reply::Verdict(RemoteVerdict {
            status,
            reason: None,
            member_name: name.map(str::to_string),
        })
    }

    pub fn transport() -> Self {
        Reply::Fail(RemoteError::Transport("connection refused".into()))
    }

    pub fn rejected(reason: &str) -> Self {
        Reply::Fail(RemoteError::Rejected {
            status: 403,
            reason: reason.to_string(),
        })
    }
}

pub struct FakeAuthority {
    verify_default: Mutex<Reply>,
    verify_script: Mutex<VecDeque<Reply>>,
    roster: Mutex<Reply>,
    roster_entries: Mutex<Vec<RosterEntry>>,
    verify_calls: Mutex<Vec<VerifyScanRequest>>,
    roster_calls: AtomicUsize,
}

impl FakeAuthority {
    pub fn new() -> Self {
        Self {
            verify_default: Mutex::new(Reply::status(ScanDecision::Granted, Some("Member One"))),
            verify_script: Mutex::new(VecDeque::new()),
            roster: Mutex::new(Reply::status(ScanDecision::Granted, None)),
            roster_entries: Mutex::new(Vec::new()),
            verify_calls: Mutex::new(Vec::new()),
            roster_calls: AtomicUsize::new(0),
        }
    }

    /// Reply used once the script is exhausted
    pub fn set_verify(&self, reply: Reply) {
        *self.verify_default.lock().unwrap() = reply;
    }

    /// Replies consumed in order before falling back to the default
    pub fn script_verify(&self, replies: Vec<Reply>) {
        self.verify_script.lock().unwrap().extend(replies);
    }

    /// Any `Verdict` reply serves the configured entries
    pub fn set_roster(&self, reply: Reply, entries: Vec<RosterEntry>) {
        *self.roster.lock().unwrap() = reply;
        *self.roster_entries.lock().unwrap() = entries;
    }

    pub fn verify_calls(&self) -> Vec<VerifyScanRequest> {
        self.verify_calls.lock().unwrap().clone()
    }

    pub fn roster_calls(&self) -> usize {
        self.roster_calls.load(Ordering::SeqCst)
    }

    async fn play(reply: Reply) -> Result<RemoteVerdict, RemoteError> {
        match reply {
            Reply::Verdict(v) => Ok(v),
            Reply::Fail(e) => Err(e),
            Reply::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl RemoteAuthority for FakeAuthority {
    async fn verify_scan(&self, request: &VerifyScanRequest) -> Result<RemoteVerdict, RemoteError> {
        self.verify_calls.lock().unwrap().push(request.clone());
        let reply = self
            .verify_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.verify_default.lock().unwrap().clone());
        Self::play(reply).await
    }

    async fn active_roster(&self) -> Result<Vec<RosterEntry>, RemoteError> {
        self.roster_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.roster.lock().unwrap().clone();
        Self::play(reply).await?;
        Ok(self.roster_entries.lock().unwrap().clone())
    }
}

pub fn entry(id: &str, valid: bool) -> RosterEntry {
    RosterEntry {
        member_id: id.to_string(),
        display_name: format!("Member {}", id),
        access_valid: valid,
    }
}

/// Unsigned token carrying the given JSON payload
pub fn token_with(payload: &str) -> String {
    format!("hdr.{}.sig", URL_SAFE_NO_PAD.encode(payload))
}

pub struct Harness {
    pub ctx: KioskContext,
    pub remote: Arc<FakeAuthority>,
    pub clock: Arc<ManualClock>,
}

pub fn harness() -> Harness {
    harness_with(KioskConfig {
        kiosk_id: "front-door".into(),
        ..KioskConfig::default()
    })
}

pub fn harness_with(config: KioskConfig) -> Harness {
    let remote = Arc::new(FakeAuthority::new());
    let clock = Arc::new(ManualClock::at_timestamp(NOW));
    let ctx = KioskContext::in_memory(config, remote.clone(), clock.clone());
    Harness { ctx, remote, clock }
}
