//! ============================================================================
//! Remote Authority - Backend verification and roster endpoints
//! ============================================================================
//! `RemoteAuthority` is the seam the engine talks through; `HttpAuthority` is
//! the production implementation over reqwest.
//!
//! Errors are split by what they say about connectivity:
//! - `Transport`: no usable answer (timeout, refused, 5xx) -> go OFFLINE
//! - `Rejected`:  the authority answered and said no (4xx) -> stay put
//! - `Protocol`:  2xx with a body we cannot read            -> stay put
//! ============================================================================

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::types::{RemoteVerdict, RosterEntry, VerifyScanRequest};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Rejected by authority ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Unreadable authority response: {0}")]
    Protocol(String),
}

impl RemoteError {
    pub fn is_transport(&self) -> bool {
        matches!(self, RemoteError::Transport(_))
    }
}

#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Authoritative decision for a live scan, or the replay of an OFFLINE one
    async fn verify_scan(&self, request: &VerifyScanRequest) -> Result<RemoteVerdict, RemoteError>;

    /// Full roster snapshot
    async fn active_roster(&self) -> Result<Vec<RosterEntry>, RemoteError>;
}

/// Error payload shapes seen from authority deployments
#[derive(Debug, Deserialize)]
struct ErrorBody {
    reason: Option<String>,
    error: Option<String>,
    message: Option<String>,
    detail: Option<String>,
}

impl ErrorBody {
    /// First non-blank field in `reason`, `error`, `message`, `detail` order
    fn into_reason(self) -> Option<String> {
        [self.reason, self.error, self.message, self.detail]
            .into_iter()
            .flatten()
            .find(|r| !r.trim().is_empty())
    }
}

/// Authority reachable over HTTP(S)
pub struct HttpAuthority {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpAuthority {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    async fn read_body(response: reqwest::Response) -> Result<String, RemoteError> {
        let status = response.status();
        let body = response.text().await.map_err(classify_reqwest)?;

        if status.is_success() {
            return Ok(body);
        }
        Err(classify_status(status, &body))
    }
}

#[async_trait]
impl RemoteAuthority for HttpAuthority {
    async fn verify_scan(&self, request: &VerifyScanRequest) -> Result<RemoteVerdict, RemoteError> {
        debug!(
            "POST verify-scan for kiosk {} (replay: {})",
            request.kiosk_id, request.replay
        );

        let response = self
            .authorize(self.client.post(format!("{}/verify-scan", self.base_url)))
            .json(request)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let body = Self::read_body(response).await?;
        serde_json::from_str(&body)
            .map_err(|e| RemoteError::Protocol(format!("verify-scan: {} - body: {}", e, body)))
    }

    async fn active_roster(&self) -> Result<Vec<RosterEntry>, RemoteError> {
        debug!("GET active-roster");

        let response = self
            .authorize(self.client.get(format!("{}/active-roster", self.base_url)))
            .send()
            .await
            .map_err(classify_reqwest)?;

        let body = Self::read_body(response).await?;
        serde_json::from_str(&body)
            .map_err(|e| RemoteError::Protocol(format!("active-roster: {}", e)))
    }
}

/// Failures raised by reqwest itself never carry an authority verdict
fn classify_reqwest(error: reqwest::Error) -> RemoteError {
    if error.is_decode() {
        return RemoteError::Protocol(error.to_string());
    }
    RemoteError::Transport(error.to_string())
}

/// Map a non-success HTTP status to the error taxonomy
pub fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    if status.is_server_error() {
        return RemoteError::Transport(format!("HTTP {}", status.as_u16()));
    }

    let reason = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(ErrorBody::into_reason)
        .unwrap_or_else(|| {
            let text = body.trim();
            if text.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("Request rejected")
                    .to_string()
            } else {
                text.chars().take(200).collect()
            }
        });

    RemoteError::Rejected {
        status: status.as_u16(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_transport() {
        for code in [500u16, 502, 503, 504] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(classify_status(status, "").is_transport(), "{} should be transport", code);
        }
    }

    #[test]
    fn test_client_errors_are_rejections_with_reason() {
        let err = classify_status(
            StatusCode::FORBIDDEN,
            r#"{"error":"No active subscription"}"#,
        );
        assert_eq!(
            err,
            RemoteError::Rejected {
                status: 403,
                reason: "No active subscription".into()
            }
        );

        let err = classify_status(StatusCode::NOT_FOUND, r#"{"reason":"Unknown kiosk"}"#);
        assert!(matches!(err, RemoteError::Rejected { ref reason, .. } if reason == "Unknown kiosk"));
    }

    #[test]
    fn test_rejection_reason_from_mixed_error_shapes() {
        let err = classify_status(StatusCode::FORBIDDEN, r#"{"error":"E","message":"M"}"#);
        assert!(matches!(err, RemoteError::Rejected { ref reason, .. } if reason == "E"));

        let err = classify_status(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"detail":"Token revoked"}"#,
        );
        assert!(matches!(err, RemoteError::Rejected { ref reason, .. } if reason == "Token revoked"));

        let err = classify_status(StatusCode::FORBIDDEN, r#"{"reason":"  ","message":"Lapsed"}"#);
        assert!(matches!(err, RemoteError::Rejected { ref reason, .. } if reason == "Lapsed"));
    }

    #[test]
    fn test_rejection_falls_back_to_text_or_status() {
        let err = classify_status(StatusCode::BAD_REQUEST, "bad token format");
        assert!(matches!(err, RemoteError::Rejected { ref reason, .. } if reason == "bad token format"));

        let err = classify_status(StatusCode::UNAUTHORIZED, "");
        assert!(matches!(err, RemoteError::Rejected { ref reason, .. } if reason == "Unauthorized"));
    }

    #[test]
    fn test_base_url_is_normalized() {
        let authority =
            HttpAuthority::new("http://localhost:8080/api/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(authority.base_url, "http://localhost:8080/api");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport() {
        // Port 9 (discard) on loopback is closed in test environments
        let authority =
            HttpAuthority::new("http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
        let err = authority.active_roster().await.unwrap_err();
        assert!(err.is_transport(), "got {:?}", err);
    }
}
