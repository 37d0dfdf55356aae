use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::common::{FaceLinkError, Result};

/// Access/refresh credential pair, stored as one serialized record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenPair {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// Parses the stored record. An empty slot is not an error.
    pub fn parse(raw: &str) -> Result<Option<Self>> {
        if raw.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| FaceLinkError::Validation(format!("stored tokens are not valid JSON: {}", e)))
    }

    pub fn to_json(&self) -> String {
        // Serializing two strings cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn is_complete(&self) -> bool {
        !self.access_token.is_empty() && !self.refresh_token.is_empty()
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<f64>,
}

/// Reads the `exp` claim (seconds since epoch) without verifying the signature.
pub fn token_expiry(token: &str) -> Option<i64> {
    let mut parts = token.split('.');
    let (_header, payload) = (parts.next()?, parts.next()?);
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    claims.exp.map(|exp| exp as i64)
}

/// A token is usable only while `exp` is strictly in the future.
pub fn is_token_valid_at(token: &str, now_secs: i64) -> bool {
    token_expiry(token).map(|exp| exp > now_secs).unwrap_or(false)
}

pub fn is_token_valid(token: &str) -> bool {
    is_token_valid_at(token, chrono::Utc::now().timestamp())
}

/// Short SHA-256 prefix used in logs instead of the token itself.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

/// Builds an unsigned JWT-shaped token with the given expiry.
#[cfg(test)]
pub(crate) fn test_token(subject: &str, exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"{}","exp":{}}}"#, subject, exp));
    format!("{}.{}.", header, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_read_from_payload() {
        let token = test_token("a", 1_700_000_000);
        assert_eq!(token_expiry(&token), Some(1_700_000_000));
    }

    #[test]
    fn expiring_exactly_now_is_expired() {
        let token = test_token("a", 1_000);
        assert!(is_token_valid_at(&token, 999));
        assert!(!is_token_valid_at(&token, 1_000));
        assert!(!is_token_valid_at(&token, 1_001));
    }

    #[test]
    fn garbage_tokens_are_never_valid() {
        assert_eq!(token_expiry(""), None);
        assert_eq!(token_expiry("not-a-jwt"), None);
        assert_eq!(token_expiry("a.%%%.c"), None);
        let no_exp = format!("x.{}.y", URL_SAFE_NO_PAD.encode(br#"{"sub":"a"}"#));
        assert!(!is_token_valid_at(&no_exp, 0));
    }

    #[test]
    fn stored_record_parsing() {
        assert_eq!(TokenPair::parse("").unwrap(), None);
        let pair = TokenPair::parse(r#"{"access_token":"a","refresh_token":"r"}"#).unwrap().unwrap();
        assert_eq!(pair, TokenPair::new("a", "r"));
        assert!(matches!(TokenPair::parse("{broken"), Err(FaceLinkError::Validation(_))));
    }

    #[test]
    fn record_uses_wire_field_names() {
        let json = TokenPair::new("a", "r").to_json();
        assert_eq!(json, r#"{"access_token":"a","refresh_token":"r"}"#);
    }

    #[test]
    fn fingerprint_hides_token() {
        let fp = fingerprint("secret-token");
        assert_eq!(fp.len(), 8);
        assert!(!fp.contains("secret"));
    }
}
