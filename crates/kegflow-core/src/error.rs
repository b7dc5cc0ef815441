//! # Error Types
//!
//! Typed rejection reasons for the authorization token path.
//!
//! ## Check Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Token Validation Pipeline                           │
//! │                                                                         │
//! │  raw token ──► Malformed? ──► BadSignature? ──► VolumeOutOfRange?      │
//! │                                                       │                 │
//! │                   Expired? ◄──────────────────────────┘                 │
//! │                      │                                                  │
//! │                      ▼                                                  │
//! │                 AlreadyUsed? ──► Ok(TokenPayload)                       │
//! │                                                                         │
//! │  Every reason is surfaced to the caller; none of them touches the      │
//! │  actuator.                                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Reasons an authorization token is rejected.
///
/// ## Design Principles
/// 1. Use `thiserror` for derive macros (not manual impl)
/// 2. Include context in error messages (nonce, limits)
/// 3. Errors are enum variants, never bare strings
#[derive(Debug, Error)]
pub enum TokenError {
    /// The wire value cannot be split, base64-decoded, or JSON-decoded.
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// The HMAC signature does not match the payload.
    ///
    /// Compared in constant time; the message deliberately carries no
    /// detail about which bytes differed.
    #[error("Invalid token signature")]
    BadSignature,

    /// The token expired more than the configured tolerance ago.
    #[error("Token expired at {expires_at} (tolerance {tolerance_secs}s)")]
    Expired {
        expires_at: i64,
        tolerance_secs: i64,
    },

    /// The token nonce was already consumed by an earlier authorization.
    #[error("Token already used: nonce {nonce}")]
    AlreadyUsed { nonce: String },

    /// The authorized volume is zero, negative, or above the configured cap.
    #[error("Authorized volume {requested}ml outside allowed range (max {max}ml)")]
    VolumeOutOfRange { requested: i64, max: i64 },
}

/// Convenience type alias for token validation results.
pub type TokenResult<T> = Result<T, TokenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = TokenError::Expired {
            expires_at: 1_700_000_000,
            tolerance_secs: 30,
        };
        assert_eq!(
            err.to_string(),
            "Token expired at 1700000000 (tolerance 30s)"
        );

        let err = TokenError::AlreadyUsed {
            nonce: "abc-123".to_string(),
        };
        assert!(err.to_string().contains("abc-123"));
    }

    #[test]
    fn test_bad_signature_carries_no_detail() {
        assert_eq!(TokenError::BadSignature.to_string(), "Invalid token signature");
    }
}
