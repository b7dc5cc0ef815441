//! # Token Validator
//!
//! Full validation pipeline over the pure codec: structure, signature,
//! volume bounds, expiry with tolerance, and single-use enforcement
//! against the durable replay ledger.
//!
//! Single-use is committed at validation time, not dispense time: the
//! nonce claim is an atomic insert, so when two requests race with the
//! same token exactly one survives - the loser gets `AlreadyUsed` before
//! any hardware is touched.

use chrono::Utc;
use tracing::{debug, warn};

use kegflow_core::{TokenCodec, TokenError, TokenPayload};
use kegflow_db::UsedTokenRepository;

use crate::config::SecurityConfig;
use crate::error::AgentResult;

/// Validates authorization tokens and burns their nonces.
#[derive(Clone)]
pub struct TokenValidator {
    codec: TokenCodec,
    ledger: UsedTokenRepository,
    tolerance_secs: i64,
    used_ttl_secs: i64,
    max_volume_ml: i64,
}

impl TokenValidator {
    /// Creates a validator over the shared secret and replay ledger.
    pub fn new(security: &SecurityConfig, max_volume_ml: i64, ledger: UsedTokenRepository) -> Self {
        TokenValidator {
            codec: TokenCodec::new(&security.hmac_secret),
            ledger,
            tolerance_secs: security.token_expiry_tolerance_secs,
            used_ttl_secs: security.used_token_ttl_secs,
            max_volume_ml,
        }
    }

    /// Validates a wire token.
    ///
    /// ## Check Order
    /// 1. Malformed (split/base64/JSON)
    /// 2. BadSignature (constant-time HMAC compare)
    /// 3. VolumeOutOfRange (payload bounds)
    /// 4. Expired (`now > expires_at + tolerance`)
    /// 5. AlreadyUsed (replay ledger)
    ///
    /// ## Side Effect
    /// On success the nonce is recorded as used - immediately, so a
    /// concurrent validation of the same token cannot also succeed.
    pub async fn validate(&self, token: &str) -> AgentResult<TokenPayload> {
        let payload = self.codec.decode(token)?;

        payload.check_volume(self.max_volume_ml)?;

        if payload.is_expired(Utc::now(), self.tolerance_secs) {
            warn!(sale_id = %payload.sale_id, "Token expired");
            return Err(TokenError::Expired {
                expires_at: payload.expires_at,
                tolerance_secs: self.tolerance_secs,
            }
            .into());
        }

        // Fast-path read, then the authoritative atomic claim. Both
        // report the same rejection; the claim is what closes the race.
        if self.ledger.is_used(&payload.nonce).await? {
            warn!(sale_id = %payload.sale_id, "Token replay rejected");
            return Err(TokenError::AlreadyUsed {
                nonce: payload.nonce.clone(),
            }
            .into());
        }

        if !self.ledger.mark_used(&payload.nonce, self.used_ttl_secs).await? {
            warn!(sale_id = %payload.sale_id, "Token replay rejected (concurrent claim)");
            return Err(TokenError::AlreadyUsed {
                nonce: payload.nonce.clone(),
            }
            .into());
        }

        debug!(
            sale_id = %payload.sale_id,
            volume_ml = payload.volume_ml,
            tap_id = payload.tap_id,
            "Token validated"
        );

        Ok(payload)
    }

    /// Issues a signed token. Fixture/test-dispense use only - production
    /// tokens come from the backend, which holds the same secret.
    pub fn generate(
        &self,
        sale_id: &str,
        beverage_id: &str,
        volume_ml: i64,
        tap_id: i64,
        ttl_secs: i64,
    ) -> AgentResult<String> {
        let payload = TokenPayload::new(sale_id, beverage_id, volume_ml, tap_id, ttl_secs, Utc::now());
        Ok(self.codec.encode(&payload)?)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
