//! Opt-out token issuance and verification
//!
//! A small HMAC-signed, base64url-encoded token: `b64url(json payload).b64url(hmac)`.
//! Not a general JWT — just the two pieces this system needs, signature
//! verified in constant time via `subtle`-free byte comparison over the
//! whole signature (HMAC output is fixed-length, so this is safe).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Deterministic fallback secret used only when no real secret is configured.
pub const DEV_OPTOUT_SECRET: &[u8] = b"dev-only-optout-secret-change-me";

/// Read the opt-out signing secret from the environment, falling back to
/// [`DEV_OPTOUT_SECRET`].
pub fn get_opt_out_secret() -> Vec<u8> {
    std::env::var("WATERMARK_OPTOUT_SECRET")
        .map(|s| s.into_bytes())
        .unwrap_or_else(|_| DEV_OPTOUT_SECRET.to_vec())
}

/// Build an opt-out token from an arbitrary JSON object payload, stamping
/// `iat`/`exp` if the caller didn't already set them.
pub fn make_opt_out_token(payload: Map<String, Value>, secret: &[u8], ttl_seconds: i64, now_unix: i64) -> String {
    let mut body = payload;
    body.entry("iat".to_string()).or_insert(Value::from(now_unix));
    body.entry("exp".to_string()).or_insert(Value::from(now_unix + ttl_seconds));

    // serde_json's Map is already sorted (BTreeMap-backed) when the
    // `preserve_order` feature is off, giving canonical key order for free.
    let raw = serde_json::to_vec(&Value::Object(body)).expect("JSON object always serializes");

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&raw);
    let sig = mac.finalize().into_bytes();

    format!("{}.{}", URL_SAFE_NO_PAD.encode(&raw), URL_SAFE_NO_PAD.encode(sig))
}

/// Verify an opt-out token against `secret`, returning `(valid, reason)`.
///
/// `now_unix` is injected by the caller so verification stays a pure function.
pub fn verify_opt_out_token(token: Option<&str>, secret: &[u8], now_unix: i64) -> (bool, &'static str) {
    let Some(token) = token else {
        return (false, "missing opt_out_token");
    };

    let Some((enc_payload, enc_sig)) = token.split_once('.') else {
        return (false, "malformed token");
    };

    let (Ok(payload), Ok(sig)) = (URL_SAFE_NO_PAD.decode(enc_payload), URL_SAFE_NO_PAD.decode(enc_sig)) else {
        return (false, "malformed token");
    };

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&payload);
    if mac.verify_slice(&sig).is_err() {
        return (false, "invalid signature");
    }

    let Ok(parsed) = serde_json::from_slice::<Value>(&payload) else {
        return (false, "invalid JSON payload");
    };

    let exp = parsed.get("exp").and_then(Value::as_i64).unwrap_or(0);
    if exp < now_unix {
        return (false, "expired token");
    }

    (true, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_valid_token() {
        let secret = b"test-secret";
        let mut payload = Map::new();
        payload.insert("company_id".to_string(), Value::from("co-1"));
        let token = make_opt_out_token(payload, secret, 3600, 1_700_000_000);

        let (valid, reason) = verify_opt_out_token(Some(&token), secret, 1_700_000_100);
        assert!(valid);
        assert_eq!(reason, "ok");
    }

    #[test]
    fn expired_token_is_rejected() {
        let secret = b"test-secret";
        let token = make_opt_out_token(Map::new(), secret, 60, 1_700_000_000);
        let (valid, reason) = verify_opt_out_token(Some(&token), secret, 1_700_010_000);
        assert!(!valid);
        assert_eq!(reason, "expired token");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = make_opt_out_token(Map::new(), b"secret-a", 3600, 1_700_000_000);
        let (valid, reason) = verify_opt_out_token(Some(&token), b"secret-b", 1_700_000_100);
        assert!(!valid);
        assert_eq!(reason, "invalid signature");
    }

    #[test]
    fn missing_token_is_rejected() {
        let (valid, reason) = verify_opt_out_token(None, b"secret", 1_700_000_100);
        assert!(!valid);
        assert_eq!(reason, "missing opt_out_token");
    }

    #[test]
    fn malformed_token_is_rejected() {
        let (valid, reason) = verify_opt_out_token(Some("not-a-valid-token"), b"secret", 1_700_000_100);
        assert!(!valid);
        assert_eq!(reason, "malformed token");
    }
}
