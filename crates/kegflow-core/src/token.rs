//! # Authorization Token Codec
//!
//! Wire format and HMAC verification for single-use dispense tokens.
//!
//! ## Wire Format
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Authorization Token Anatomy                          │
//! │                                                                         │
//! │   base64(payload JSON) "." base64(hex(HMAC-SHA256(payload JSON)))      │
//! │                                                                         │
//! │   payload JSON keys:                                                   │
//! │     sale_id      - sale this pour settles (unique per sale)            │
//! │     beverage_id  - what is being poured                                │
//! │     volume_ml    - authorized volume, positive, capped by config       │
//! │     tap_id       - which tap the pour runs on                          │
//! │     issued_at    - unix seconds                                        │
//! │     expires_at   - unix seconds; validated with a tolerance            │
//! │     nonce        - unique string, consumed exactly once                │
//! │                                                                         │
//! │   The MAC is computed over the raw payload JSON bytes (before base64) │
//! │   with the shared secret, then hex-encoded, then base64-encoded.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The codec is pure: it splits, verifies, and parses. Replay protection
//! (the `nonce` ledger) needs the durable store and lives in the agent's
//! `TokenValidator`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::{TokenError, TokenResult};

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Token Payload
// =============================================================================

/// The signed parameters of one authorized dispense.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    /// Sale this pour settles. Unique per sale; enforced again at
    /// persistence time by the consumptions table.
    pub sale_id: String,

    /// Beverage being poured.
    pub beverage_id: String,

    /// Authorized volume in milliliters.
    pub volume_ml: i64,

    /// Tap the pour runs on.
    pub tap_id: i64,

    /// Issue time, unix seconds.
    pub issued_at: i64,

    /// Expiry time, unix seconds.
    pub expires_at: i64,

    /// Single-use nonce.
    pub nonce: String,
}

impl TokenPayload {
    /// Builds a fresh payload with a random nonce.
    ///
    /// Used by `TokenValidator::generate` for fixtures and the debug
    /// test-dispense path; production tokens are issued by the backend.
    pub fn new(
        sale_id: impl Into<String>,
        beverage_id: impl Into<String>,
        volume_ml: i64,
        tap_id: i64,
        ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> Self {
        TokenPayload {
            sale_id: sale_id.into(),
            beverage_id: beverage_id.into(),
            volume_ml,
            tap_id,
            issued_at: now.timestamp(),
            expires_at: now.timestamp() + ttl_secs,
            nonce: Uuid::new_v4().to_string(),
        }
    }

    /// Returns true if the token expired more than `tolerance_secs` ago.
    pub fn is_expired(&self, now: DateTime<Utc>, tolerance_secs: i64) -> bool {
        now.timestamp() > self.expires_at + tolerance_secs
    }

    /// Checks the authorized volume against the configured cap.
    pub fn check_volume(&self, max_volume_ml: i64) -> TokenResult<()> {
        if self.volume_ml <= 0 || self.volume_ml > max_volume_ml {
            return Err(TokenError::VolumeOutOfRange {
                requested: self.volume_ml,
                max: max_volume_ml,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Stateless encode/decode over the shared HMAC secret.
#[derive(Debug, Clone)]
pub struct TokenCodec {
    secret: Vec<u8>,
}

impl TokenCodec {
    /// Creates a codec for the given shared secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        TokenCodec {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Encodes and signs a payload into the wire format.
    pub fn encode(&self, payload: &TokenPayload) -> TokenResult<String> {
        let json = serde_json::to_vec(payload)
            .map_err(|e| TokenError::Malformed(format!("payload serialization: {e}")))?;

        let signature = hex::encode(self.mac(&json));

        Ok(format!(
            "{}.{}",
            BASE64.encode(&json),
            BASE64.encode(signature.as_bytes())
        ))
    }

    /// Decodes a wire token, verifying structure then signature.
    ///
    /// ## Check Order
    /// 1. `Malformed` - split / base64 / utf8 / hex / JSON failures
    /// 2. `BadSignature` - HMAC mismatch (constant-time comparison)
    ///
    /// Expiry and replay are NOT checked here; they need a clock and the
    /// durable store, and belong to the validator.
    pub fn decode(&self, token: &str) -> TokenResult<TokenPayload> {
        let (payload_b64, sig_b64) = token
            .split_once('.')
            .ok_or_else(|| TokenError::Malformed("missing '.' separator".into()))?;

        let payload_bytes = BASE64
            .decode(payload_b64)
            .map_err(|e| TokenError::Malformed(format!("payload base64: {e}")))?;

        let sig_hex = BASE64
            .decode(sig_b64)
            .map_err(|e| TokenError::Malformed(format!("signature base64: {e}")))?;
        let sig_hex = String::from_utf8(sig_hex)
            .map_err(|_| TokenError::Malformed("signature is not utf-8".into()))?;
        let sig_bytes = hex::decode(sig_hex.trim())
            .map_err(|e| TokenError::Malformed(format!("signature hex: {e}")))?;

        let payload: TokenPayload = serde_json::from_slice(&payload_bytes)
            .map_err(|e| TokenError::Malformed(format!("payload json: {e}")))?;

        let expected = self.mac(&payload_bytes);
        if expected.len() != sig_bytes.len() {
            return Err(TokenError::BadSignature);
        }
        if expected.ct_eq(sig_bytes.as_slice()).unwrap_u8() != 1 {
            return Err(TokenError::BadSignature);
        }

        Ok(payload)
    }

    fn mac(&self, message: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any length, so new_from_slice cannot fail.
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(message);
        mac.finalize().into_bytes().to_vec()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SECRET: &str = "test-secret-key";

    fn fixture_payload() -> TokenPayload {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        TokenPayload::new("sale-001", "bev-ipa", 300, 1, 120, now)
    }

    #[test]
    fn test_roundtrip() {
        let codec = TokenCodec::new(SECRET);
        let payload = fixture_payload();

        let token = codec.encode(&payload).unwrap();
        let decoded = codec.decode(&token).unwrap();

        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_wire_shape() {
        let codec = TokenCodec::new(SECRET);
        let token = codec.encode(&fixture_payload()).unwrap();

        let (payload_b64, sig_b64) = token.split_once('.').unwrap();

        // First part is base64 JSON with the expected keys
        let json = BASE64.decode(payload_b64).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        for key in [
            "sale_id",
            "beverage_id",
            "volume_ml",
            "tap_id",
            "issued_at",
            "expires_at",
            "nonce",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }

        // Second part is base64 over a 64-char hex string (SHA-256 digest)
        let sig_hex = String::from_utf8(BASE64.decode(sig_b64).unwrap()).unwrap();
        assert_eq!(sig_hex.len(), 64);
        assert!(sig_hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let codec = TokenCodec::new(SECRET);
        let mut payload = fixture_payload();
        let token = codec.encode(&payload).unwrap();

        // Re-encode a payload with a larger volume but keep the old signature
        payload.volume_ml = 9000;
        let forged_json = serde_json::to_vec(&payload).unwrap();
        let (_, sig) = token.split_once('.').unwrap();
        let forged = format!("{}.{}", BASE64.encode(&forged_json), sig);

        assert!(matches!(codec.decode(&forged), Err(TokenError::BadSignature)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let codec = TokenCodec::new(SECRET);
        let other = TokenCodec::new("different-secret");
        let token = codec.encode(&fixture_payload()).unwrap();

        assert!(matches!(other.decode(&token), Err(TokenError::BadSignature)));
    }

    #[test]
    fn test_malformed_variants() {
        let codec = TokenCodec::new(SECRET);

        // No separator
        assert!(matches!(
            codec.decode("no-dot-here"),
            Err(TokenError::Malformed(_))
        ));

        // Invalid base64 payload
        assert!(matches!(
            codec.decode("!!!.AAAA"),
            Err(TokenError::Malformed(_))
        ));

        // Valid base64, not JSON
        let not_json = format!("{}.{}", BASE64.encode(b"hello"), BASE64.encode(b"00"));
        assert!(matches!(
            codec.decode(&not_json),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn test_expiry_tolerance() {
        let payload = fixture_payload();
        let expires = Utc.timestamp_opt(payload.expires_at, 0).unwrap();

        // Just past expiry, inside tolerance: still acceptable
        assert!(!payload.is_expired(expires + chrono::Duration::seconds(20), 30));

        // Past expiry + tolerance: rejected
        assert!(payload.is_expired(expires + chrono::Duration::seconds(31), 30));
    }

    #[test]
    fn test_volume_bounds() {
        let mut payload = fixture_payload();
        assert!(payload.check_volume(1000).is_ok());

        payload.volume_ml = 0;
        assert!(matches!(
            payload.check_volume(1000),
            Err(TokenError::VolumeOutOfRange { .. })
        ));

        payload.volume_ml = 1500;
        assert!(matches!(
            payload.check_volume(1000),
            Err(TokenError::VolumeOutOfRange { max: 1000, .. })
        ));
    }

    #[test]
    fn test_nonces_unique() {
        let now = Utc::now();
        let a = TokenPayload::new("s1", "b1", 100, 1, 60, now);
        let b = TokenPayload::new("s1", "b1", 100, 1, 60, now);
        assert_ne!(a.nonce, b.nonce);
    }
}
