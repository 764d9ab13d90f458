//! ============================================================================
//! Scan Decision Engine - One presented token in, one ScanAttempt out
//! ============================================================================
//! 1. Decode the token. Malformed tokens end here as ERROR in any mode and
//!    never reach the network.
//! 2. ONLINE: ask the authority (bounded by the request timeout).
//!    A verdict or a rejection is final. A transport failure flips the
//!    monitor OFFLINE and the same call continues with step 3.
//! 3. OFFLINE: judge from the claims and the cached roster. Grants are
//!    provisional and queued for reconciliation; denials are not queued.
//!
//! Every outcome is a value. Nothing here returns an error to the caller.
//! ============================================================================

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::StalePolicy;
use crate::context::KioskContext;
use crate::remote::RemoteError;
use crate::roster::RosterSnapshot;
use crate::token::{self, Claims};
use crate::types::{
    OperatingMode, PendingSyncRecord, RemoteVerdict, ScanAttempt, ScanDecision,
    VerifyScanRequest, REASON_INVALID_TOKEN, REASON_OFFLINE_EXPIRED, REASON_OFFLINE_GRANTED,
    REASON_OFFLINE_NO_SUBSCRIPTION, REASON_OFFLINE_STALE, UNKNOWN_MEMBER,
};

/// Fields shared by every attempt built during one `decide` call
struct ScanInput<'a> {
    token: &'a str,
    kiosk_id: &'a str,
    observed_at: DateTime<Utc>,
}

impl ScanInput<'_> {
    fn attempt(
        &self,
        decision: ScanDecision,
        mode_used: OperatingMode,
        reason: impl Into<String>,
        member_id: Option<&str>,
        member_name: impl Into<String>,
    ) -> ScanAttempt {
        ScanAttempt {
            id: Uuid::new_v4(),
            token: self.token.to_string(),
            kiosk_id: self.kiosk_id.to_string(),
            observed_at: self.observed_at,
            decision,
            mode_used,
            reason: reason.into(),
            member_id: member_id.map(str::to_string),
            member_name: member_name.into(),
        }
    }
}

pub struct ScanDecisionEngine {
    ctx: KioskContext,
}

impl ScanDecisionEngine {
    pub fn new(ctx: KioskContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &KioskContext {
        &self.ctx
    }

    /// Decide one presented token. Always yields exactly one attempt.
    pub async fn decide(&self, token: &str, kiosk_id: &str) -> ScanAttempt {
        let input = ScanInput {
            token: token.trim(),
            kiosk_id,
            observed_at: self.ctx.clock.now(),
        };

        let claims = match token::decode(input.token) {
            Ok(claims) => claims,
            Err(e) => {
                warn!("Rejecting unreadable token at kiosk {}: {}", kiosk_id, e);
                let attempt = input.attempt(
                    ScanDecision::Error,
                    self.ctx.connectivity.mode(),
                    REASON_INVALID_TOKEN,
                    None,
                    UNKNOWN_MEMBER,
                );
                return self.finish(attempt);
            }
        };

        if self.ctx.connectivity.is_online() {
            if let Some(attempt) = self.decide_online(&input, &claims).await {
                return self.finish(attempt);
            }
        }

        let attempt = self.decide_offline(&input, &claims).await;
        self.finish(attempt)
    }

    /// `None` means the authority gave no usable answer and the caller must
    /// fall back to OFFLINE judgment
    async fn decide_online(&self, input: &ScanInput<'_>, claims: &Claims) -> Option<ScanAttempt> {
        let request = VerifyScanRequest::live(input.token, input.kiosk_id, input.observed_at);
        let timeout = self.ctx.config.request_timeout();

        let result = match tokio::time::timeout(timeout, self.ctx.remote.verify_scan(&request)).await
        {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Transport(format!(
                "verify_scan timed out after {:?}",
                timeout
            ))),
        };

        match result {
            Ok(verdict) => {
                self.ctx.connectivity.record_success("verify_scan");
                self.hint_refresh_if_stale().await;
                Some(self.online_attempt(input, claims, verdict).await)
            }
            Err(RemoteError::Rejected { status, reason }) => {
                info!(
                    "Authority rejected scan for {} ({}): {}",
                    claims.subject_id, status, reason
                );
                let name = self.cached_name(&claims.subject_id).await;
                Some(input.attempt(
                    ScanDecision::Denied,
                    OperatingMode::Online,
                    reason,
                    Some(&claims.subject_id),
                    name,
                ))
            }
            Err(RemoteError::Transport(e)) => {
                self.ctx.connectivity.record_transport_failure("verify_scan", &e);
                None
            }
            Err(RemoteError::Protocol(e)) => {
                warn!("Unreadable verify_scan response, judging offline: {}", e);
                None
            }
        }
    }

    async fn online_attempt(
        &self,
        input: &ScanInput<'_>,
        claims: &Claims,
        verdict: RemoteVerdict,
    ) -> ScanAttempt {
        let name = match verdict.member_name {
            Some(name) if !name.is_empty() => name,
            _ => self.cached_name(&claims.subject_id).await,
        };
        let reason = verdict
            .reason
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| verdict.status.default_reason().to_string());

        input.attempt(
            verdict.status,
            OperatingMode::Online,
            reason,
            Some(&claims.subject_id),
            name,
        )
    }

    async fn decide_offline(&self, input: &ScanInput<'_>, claims: &Claims) -> ScanAttempt {
        // One snapshot for the whole judgment, even if a refresh lands meanwhile
        let roster = self.ctx.roster.snapshot().await;
        self.judge_offline(input, claims, &roster).await
    }

    async fn judge_offline(
        &self,
        input: &ScanInput<'_>,
        claims: &Claims,
        roster: &RosterSnapshot,
    ) -> ScanAttempt {
        let entry = roster.get(&claims.subject_id);
        let name = entry
            .map(|e| e.display_name.clone())
            .unwrap_or_else(|| UNKNOWN_MEMBER.to_string());
        let subject = Some(claims.subject_id.as_str());

        if claims.is_expired_at(input.observed_at.timestamp()) {
            return input.attempt(
                ScanDecision::Denied,
                OperatingMode::Offline,
                REASON_OFFLINE_EXPIRED,
                subject,
                name,
            );
        }

        match entry {
            Some(entry) if entry.access_valid => {
                let age = roster.age_at(input.observed_at);
                if let Some(denied) = self.stale_denial(input, claims, &name, age) {
                    return denied;
                }
                self.enqueue_for_sync(input).await;
                input.attempt(
                    ScanDecision::Granted,
                    OperatingMode::Offline,
                    REASON_OFFLINE_GRANTED,
                    subject,
                    name,
                )
            }
            _ => {
                if roster.is_empty() {
                    warn!("Offline scan against an empty roster; failing closed");
                }
                input.attempt(
                    ScanDecision::Denied,
                    OperatingMode::Offline,
                    REASON_OFFLINE_NO_SUBSCRIPTION,
                    subject,
                    name,
                )
            }
        }
    }

    /// Applies the stale-roster policy to a would-be OFFLINE grant
    fn stale_denial(
        &self,
        input: &ScanInput<'_>,
        claims: &Claims,
        name: &str,
        age: Duration,
    ) -> Option<ScanAttempt> {
        let limit = self.ctx.config.stale_after();
        if age <= limit {
            return None;
        }

        match self.ctx.config.stale_policy {
            StalePolicy::FailClosed => {
                warn!(
                    "Roster is {}s old (limit {}s); denying offline grant for {}",
                    age.as_secs(),
                    limit.as_secs(),
                    claims.subject_id
                );
                Some(input.attempt(
                    ScanDecision::Denied,
                    OperatingMode::Offline,
                    REASON_OFFLINE_STALE,
                    Some(&claims.subject_id),
                    name,
                ))
            }
            StalePolicy::WarnAndGrant => {
                warn!(
                    "Roster is {}s old (limit {}s); granting {} offline anyway",
                    age.as_secs(),
                    limit.as_secs(),
                    claims.subject_id
                );
                None
            }
        }
    }

    async fn enqueue_for_sync(&self, input: &ScanInput<'_>) {
        let record = PendingSyncRecord {
            token: input.token.to_string(),
            kiosk_id: input.kiosk_id.to_string(),
            observed_at: input.observed_at,
        };
        if let Err(e) = self.ctx.queue.enqueue(record).await {
            // The door decision stands; only the audit trail is at risk
            error!("Failed to queue offline grant for reconciliation: {}", e);
        }
    }

    async fn cached_name(&self, member_id: &str) -> String {
        self.ctx
            .roster
            .lookup(member_id)
            .await
            .map(|e| e.display_name)
            .unwrap_or_else(|| UNKNOWN_MEMBER.to_string())
    }

    /// Ask the refresher for an early run when the snapshot is older than
    /// one refresh period
    async fn hint_refresh_if_stale(&self) {
        if self.ctx.roster.snapshot_age().await > self.ctx.config.roster_refresh_interval() {
            debug!("Roster older than refresh interval; requesting early refresh");
            self.ctx.refresh_hint.notify_one();
        }
    }

    fn finish(&self, attempt: ScanAttempt) -> ScanAttempt {
        info!(
            "Scan at {}: {} via {} for {} - {}",
            attempt.kiosk_id,
            attempt.decision,
            attempt.mode_used,
            attempt.member_id.as_deref().unwrap_or("-"),
            attempt.reason
        );

        if let Some(store) = &self.ctx.store {
            if let Err(e) = store.append_scan(&attempt) {
                warn!("Failed to log scan {}: {}", attempt.id, e);
            }
        }
        attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::KioskConfig;
    use crate::testing::{entry, harness, harness_with, token_with, Reply, M1_TOKEN, NOW};

    async fn go_offline(h: &crate::testing::Harness) {
        h.ctx.connectivity.record_transport_failure("test", "unplugged");
    }

    #[tokio::test]
    async fn test_offline_grant_for_valid_member_enqueues_once() {
        let h = harness();
        go_offline(&h).await;
        h.ctx.roster.refresh(vec![entry("m1", true)]).await;
        let engine = ScanDecisionEngine::new(h.ctx.clone());

        let before = h.ctx.queue.len().await;
        let attempt = engine.decide(M1_TOKEN, "front-door").await;

        assert_eq!(attempt.decision, ScanDecision::Granted);
        assert_eq!(attempt.mode_used, OperatingMode::Offline);
        assert_eq!(attempt.reason, REASON_OFFLINE_GRANTED);
        assert_eq!(attempt.member_name, "Member m1");
        assert_eq!(h.ctx.queue.len().await, before + 1);

        let queued = h.ctx.queue.list().await;
        assert_eq!(queued[0].record.token, M1_TOKEN);
        assert_eq!(queued[0].record.kiosk_id, "front-door");
        assert_eq!(queued[0].record.observed_at, attempt.observed_at);
        assert!(h.remote.verify_calls().is_empty());
    }

    #[tokio::test]
    async fn test_offline_denial_for_lapsed_member() {
        let h = harness();
        go_offline(&h).await;
        h.ctx.roster.refresh(vec![entry("m1", false)]).await;
        let engine = ScanDecisionEngine::new(h.ctx.clone());

        let attempt = engine.decide(M1_TOKEN, "front-door").await;

        assert_eq!(attempt.decision, ScanDecision::Denied);
        assert!(attempt.reason.contains("No Active Subscription"));
        assert_eq!(attempt.member_name, "Member m1");
        assert!(h.ctx.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_offline_unknown_member_is_denied() {
        let h = harness();
        go_offline(&h).await;
        h.ctx.roster.refresh(vec![entry("someone-else", true)]).await;
        let engine = ScanDecisionEngine::new(h.ctx.clone());

        let attempt = engine.decide(M1_TOKEN, "front-door").await;
        assert_eq!(attempt.decision, ScanDecision::Denied);
        assert_eq!(attempt.member_name, UNKNOWN_MEMBER);
        assert!(h.ctx.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_empty_roster_fails_closed() {
        let h = harness();
        go_offline(&h).await;
        let engine = ScanDecisionEngine::new(h.ctx.clone());

        for token in [
            M1_TOKEN.to_string(),
            token_with(r#"{"subject_id":"m2"}"#),
            token_with(r#"{"subject_id":"m3","expires_at":4102444800}"#),
        ] {
            let attempt = engine.decide(&token, "front-door").await;
            assert_eq!(attempt.decision, ScanDecision::Denied, "token {}", token);
        }
        assert!(h.ctx.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_expired_token_denied_offline_regardless_of_roster() {
        let h = harness();
        go_offline(&h).await;
        h.ctx.roster.refresh(vec![entry("m1", true)]).await;
        let engine = ScanDecisionEngine::new(h.ctx.clone());

        let expired = token_with(&format!(r#"{{"sub_id":"m1","exp":{}}}"#, NOW - 1));
        let attempt = engine.decide(&expired, "front-door").await;

        assert_eq!(attempt.decision, ScanDecision::Denied);
        assert_eq!(attempt.reason, REASON_OFFLINE_EXPIRED);
        assert!(h.ctx.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_expiry_still_checks_roster() {
        let h = harness();
        go_offline(&h).await;
        h.ctx.roster.refresh(vec![entry("m1", true), entry("m2", false)]).await;
        let engine = ScanDecisionEngine::new(h.ctx.clone());

        let open_valid = engine.decide(&token_with(r#"{"subject_id":"m1"}"#), "k").await;
        let open_lapsed = engine.decide(&token_with(r#"{"subject_id":"m2"}"#), "k").await;

        assert_eq!(open_valid.decision, ScanDecision::Granted);
        assert_eq!(open_lapsed.decision, ScanDecision::Denied);
    }

    #[tokio::test]
    async fn test_malformed_tokens_error_in_both_modes_without_network() {
        let h = harness();
        let engine = ScanDecisionEngine::new(h.ctx.clone());
        let no_subject = token_with(r#"{"exp":1}"#);
        let bad = ["garbage", "a.b", "hdr.bm90IGpzb24.sig", no_subject.as_str()];

        for token in bad {
            let online = engine.decide(token, "k").await;
            assert_eq!(online.decision, ScanDecision::Error);
            assert_eq!(online.reason, REASON_INVALID_TOKEN);
        }

        go_offline(&h).await;
        for token in bad {
            let offline = engine.decide(token, "k").await;
            assert_eq!(offline.decision, ScanDecision::Error);
            assert_eq!(offline.mode_used, OperatingMode::Offline);
        }

        assert!(h.remote.verify_calls().is_empty());
        assert!(h.ctx.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_online_verdict_is_authoritative() {
        let h = harness();
        h.remote.set_verify(Reply::status(ScanDecision::AlreadyScanned, Some("Dana")));
        let engine = ScanDecisionEngine::new(h.ctx.clone());

        let attempt = engine.decide(M1_TOKEN, "front-door").await;

        assert_eq!(attempt.decision, ScanDecision::AlreadyScanned);
        assert_eq!(attempt.mode_used, OperatingMode::Online);
        assert_eq!(attempt.member_name, "Dana");
        assert_eq!(attempt.reason, "Already Scanned");
        assert!(h.ctx.queue.is_empty().await);

        let calls = h.remote.verify_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].token, M1_TOKEN);
        assert_eq!(calls[0].kiosk_id, "front-door");
        assert!(!calls[0].replay);
    }

    #[tokio::test]
    async fn test_online_rejection_is_denied_and_stays_online() {
        let h = harness();
        h.remote.set_verify(Reply::rejected("Unknown kiosk"));
        let engine = ScanDecisionEngine::new(h.ctx.clone());

        let attempt = engine.decide(M1_TOKEN, "front-door").await;

        assert_eq!(attempt.decision, ScanDecision::Denied);
        assert_eq!(attempt.mode_used, OperatingMode::Online);
        assert_eq!(attempt.reason, "Unknown kiosk");
        assert!(h.ctx.connectivity.is_online());
        assert!(h.ctx.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_transport_failure_falls_through_within_one_call() {
        let h = harness();
        h.remote.set_verify(Reply::transport());
        h.ctx.roster.refresh(vec![entry("m1", true)]).await;
        let engine = ScanDecisionEngine::new(h.ctx.clone());

        let attempt = engine.decide(M1_TOKEN, "front-door").await;

        assert_eq!(attempt.decision, ScanDecision::Granted);
        assert_eq!(attempt.mode_used, OperatingMode::Offline);
        assert_eq!(h.ctx.connectivity.mode(), OperatingMode::Offline);
        assert_eq!(h.ctx.queue.len().await, 1);
        assert_eq!(h.remote.verify_calls().len(), 1);

        // While OFFLINE the authority is not consulted at all
        engine.decide(M1_TOKEN, "front-door").await;
        assert_eq!(h.remote.verify_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_authority_times_out_into_offline_path() {
        let h = harness();
        h.remote.set_verify(Reply::Hang);
        h.ctx.roster.refresh(vec![entry("m1", true)]).await;
        let engine = ScanDecisionEngine::new(h.ctx.clone());

        let started = tokio::time::Instant::now();
        let attempt = engine.decide(M1_TOKEN, "front-door").await;

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(attempt.decision, ScanDecision::Granted);
        assert_eq!(attempt.mode_used, OperatingMode::Offline);
        assert_eq!(h.ctx.connectivity.mode(), OperatingMode::Offline);
        assert_eq!(h.ctx.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_protocol_error_judges_offline_without_flipping() {
        let h = harness();
        h.remote
            .set_verify(Reply::Fail(RemoteError::Protocol("html error page".into())));
        h.ctx.roster.refresh(vec![entry("m1", true)]).await;
        let engine = ScanDecisionEngine::new(h.ctx.clone());

        let attempt = engine.decide(M1_TOKEN, "front-door").await;

        assert_eq!(attempt.mode_used, OperatingMode::Offline);
        assert_eq!(attempt.decision, ScanDecision::Granted);
        assert!(h.ctx.connectivity.is_online());
        assert_eq!(h.ctx.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_stale_roster_fails_closed_by_default() {
        let h = harness();
        go_offline(&h).await;
        h.ctx.roster.refresh(vec![entry("m1", true)]).await;
        h.clock.advance(chrono::Duration::hours(25));
        let engine = ScanDecisionEngine::new(h.ctx.clone());

        let attempt = engine.decide(M1_TOKEN, "front-door").await;

        assert_eq!(attempt.decision, ScanDecision::Denied);
        assert_eq!(attempt.reason, REASON_OFFLINE_STALE);
        assert!(h.ctx.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_stale_roster_can_be_configured_to_grant() {
        let h = harness_with(KioskConfig {
            stale_policy: StalePolicy::WarnAndGrant,
            ..KioskConfig::default()
        });
        go_offline(&h).await;
        h.ctx.roster.refresh(vec![entry("m1", true)]).await;
        h.clock.advance(chrono::Duration::hours(25));
        let engine = ScanDecisionEngine::new(h.ctx.clone());

        let attempt = engine.decide(M1_TOKEN, "front-door").await;

        assert_eq!(attempt.decision, ScanDecision::Granted);
        assert_eq!(h.ctx.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_offline_judgment_uses_one_roster_snapshot() {
        let h = harness();
        go_offline(&h).await;
        let engine = ScanDecisionEngine::new(h.ctx.clone());
        let claims = token::decode(M1_TOKEN).unwrap();

        let held = h.ctx.roster.refresh(vec![entry("m1", true)]).await;
        h.clock.advance(chrono::Duration::hours(25));
        h.ctx.roster.refresh(vec![entry("m1", true)]).await;

        // The live roster is fresh, but the held one decides both entry and age
        let input = ScanInput {
            token: M1_TOKEN,
            kiosk_id: "front-door",
            observed_at: h.clock.now(),
        };
        let attempt = engine.judge_offline(&input, &claims, &held).await;
        assert_eq!(attempt.decision, ScanDecision::Denied);
        assert_eq!(attempt.reason, REASON_OFFLINE_STALE);

        let fresh = h.ctx.roster.snapshot().await;
        h.ctx.roster.refresh(vec![]).await;
        let attempt = engine.judge_offline(&input, &claims, &fresh).await;
        assert_eq!(attempt.decision, ScanDecision::Granted);
        assert_eq!(attempt.member_name, "Member m1");
    }

    #[tokio::test]
    async fn test_repeat_offline_scans_are_distinct_events() {
        let h = harness();
        go_offline(&h).await;
        h.ctx.roster.refresh(vec![entry("m1", true)]).await;
        let engine = ScanDecisionEngine::new(h.ctx.clone());

        engine.decide(M1_TOKEN, "front-door").await;
        h.clock.advance(chrono::Duration::seconds(30));
        engine.decide(M1_TOKEN, "front-door").await;

        assert_eq!(h.ctx.queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_online_success_with_old_roster_hints_refresh() {
        let h = harness();
        let engine = ScanDecisionEngine::new(h.ctx.clone());
        let hint = h.ctx.refresh_hint.clone();

        // Never refreshed: age is unbounded, so a hint is left for the refresher
        engine.decide(M1_TOKEN, "front-door").await;
        tokio::time::timeout(Duration::from_millis(100), hint.notified())
            .await
            .expect("refresh hint should be pending");
    }

    #[tokio::test]
    async fn test_scans_are_logged_when_store_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiosk.redb");
        let store =
            std::sync::Arc::new(crate::db::KioskDb::open(Some(path.to_str().unwrap())).unwrap());
        let h = harness();
        let ctx = KioskContext::open(
            KioskConfig::default(),
            h.remote.clone(),
            h.clock.clone(),
            store.clone(),
        )
        .await
        .unwrap();
        let engine = ScanDecisionEngine::new(ctx);

        let attempt = engine.decide("not-a-token", "front-door").await;
        let logged = store.list_scans(None).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].id, attempt.id);
        assert_eq!(logged[0].decision, ScanDecision::Error);
    }
}
