//! ============================================================================
//! Token Codec - Offline claim extraction for presented access tokens
//! ============================================================================
//! Tokens are JWT-shaped: `header.payload.signature`, payload base64url JSON.
//!
//! ## Known limitation
//! The signature segment is NOT verified. The kiosk holds no issuer key, so
//! OFFLINE judgment trusts the payload claims as presented: a well-formed
//! forged token naming a real member would pass the offline check. ONLINE
//! decisions are unaffected since the authority validates the token itself.
//! ============================================================================

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use serde_json::{Map, Value};

/// base64url that accepts both padded and unpadded segments
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Claim keys that may carry the member id, in priority order
const SUBJECT_KEYS: [&str; 3] = ["subject_id", "sub_id", "sub"];

/// Claim keys that may carry the expiry (Unix seconds), in priority order
const EXPIRY_KEYS: [&str; 2] = ["expires_at", "exp"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed token: expected 3 non-empty segments, found {segments}")]
    MalformedToken { segments: usize },

    #[error("Invalid token payload: {0}")]
    InvalidPayload(String),
}

/// Claims the kiosk relies on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub subject_id: String,
    pub expires_at: Option<i64>,
}

impl Claims {
    /// A token without an expiry claim never counts as expired
    pub fn is_expired_at(&self, now_ts: i64) -> bool {
        matches!(self.expires_at, Some(exp) if exp < now_ts)
    }
}

/// Decode a presented token into its claims without any network access
pub fn decode(token: &str) -> Result<Claims, DecodeError> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    if segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
        return Err(DecodeError::MalformedToken {
            segments: segments.len(),
        });
    }

    let raw = URL_SAFE_LENIENT
        .decode(segments[1])
        .map_err(|e| DecodeError::InvalidPayload(format!("payload is not base64url: {}", e)))?;

    let payload: Value = serde_json::from_slice(&raw)
        .map_err(|e| DecodeError::InvalidPayload(format!("payload is not JSON: {}", e)))?;

    let object = payload
        .as_object()
        .ok_or_else(|| DecodeError::InvalidPayload("payload is not a JSON object".into()))?;

    Ok(Claims {
        subject_id: subject_claim(object)?,
        expires_at: expiry_claim(object)?,
    })
}

fn subject_claim(object: &Map<String, Value>) -> Result<String, DecodeError> {
    let value = SUBJECT_KEYS
        .iter()
        .find_map(|key| object.get(*key))
        .ok_or_else(|| DecodeError::InvalidPayload("missing subject_id".into()))?;

    match value.as_str() {
        Some(subject) if !subject.is_empty() => Ok(subject.to_string()),
        Some(_) => Err(DecodeError::InvalidPayload("empty subject_id".into())),
        None => Err(DecodeError::InvalidPayload("subject_id is not a string".into())),
    }
}

fn expiry_claim(object: &Map<String, Value>) -> Result<Option<i64>, DecodeError> {
    let Some(value) = EXPIRY_KEYS.iter().find_map(|key| object.get(*key)) else {
        return Ok(None);
    };

    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| DecodeError::InvalidPayload("expiry out of range".into())),
        _ => Err(DecodeError::InvalidPayload("expiry is not a number".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn token_with(payload: &str) -> String {
        format!("hdr.{}.sig", URL_SAFE_NO_PAD.encode(payload))
    }

    #[test]
    fn test_decode_reference_token() {
        let claims = decode("hdr.eyJzdWJfaWQiOiJtMSIsImV4cCI6OTk5OTk5OTk5OX0.sig").unwrap();
        assert_eq!(claims.subject_id, "m1");
        assert_eq!(claims.expires_at, Some(9_999_999_999));
    }

    #[test]
    fn test_decode_canonical_claim_names() {
        let claims = decode(&token_with(r#"{"subject_id":"m42","expires_at":1700000000}"#)).unwrap();
        assert_eq!(claims.subject_id, "m42");
        assert_eq!(claims.expires_at, Some(1_700_000_000));
    }

    #[test]
    fn test_decode_accepts_padded_payload_and_trailing_newline() {
        let padded = base64::engine::general_purpose::URL_SAFE.encode(r#"{"sub":"m77"}"#);
        let claims = decode(&format!("h.{}.s\n", padded)).unwrap();
        assert_eq!(claims.subject_id, "m77");
        assert!(padded.ends_with('='));
        assert_eq!(claims.expires_at, None);
    }

    #[test]
    fn test_wrong_segment_count_is_malformed() {
        for bad in ["", "only-one", "two.parts", "a.b.c.d", "a..c", ".b.c"] {
            assert!(
                matches!(decode(bad), Err(DecodeError::MalformedToken { .. })),
                "expected MalformedToken for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_payload_errors_are_invalid_payload() {
        let cases = [
            "hdr.!!!not-base64!!!.sig".to_string(),
            token_with("not json"),
            token_with(r#"["m1"]"#),
            token_with(r#"{"exp":9999999999}"#),
            token_with(r#"{"subject_id":42}"#),
            token_with(r#"{"subject_id":""}"#),
            token_with(r#"{"subject_id":"m1","exp":"tomorrow"}"#),
        ];
        for token in cases {
            assert!(
                matches!(decode(&token), Err(DecodeError::InvalidPayload(_))),
                "expected InvalidPayload for {}",
                token
            );
        }
    }

    #[test]
    fn test_signature_is_not_checked() {
        let forged = token_with(r#"{"subject_id":"m1"}"#).replace(".sig", ".forged");
        assert!(decode(&forged).is_ok());
    }

    #[test]
    fn test_expiry_check() {
        let claims = Claims {
            subject_id: "m1".into(),
            expires_at: Some(100),
        };
        assert!(claims.is_expired_at(101));
        assert!(!claims.is_expired_at(100));

        let open_ended = Claims {
            subject_id: "m1".into(),
            expires_at: None,
        };
        assert!(!open_ended.is_expired_at(i64::MAX));
    }

    #[test]
    fn test_float_expiry_is_truncated() {
        let claims = decode(&token_with(r#"{"sub_id":"m1","exp":1700000000.9}"#)).unwrap();
        assert_eq!(claims.expires_at, Some(1_700_000_000));
    }
}
