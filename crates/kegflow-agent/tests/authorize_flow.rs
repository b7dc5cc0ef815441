//! Authorization flow through the full EdgeContext: token in, pour out,
//! record on disk. Uses a fast simulated flow so real-time pours stay
//! under a second.

use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use kegflow_agent::{AgentError, EdgeConfig, EdgeContext};
use kegflow_core::{DispenseStatus, OutcomeStatus, TokenCodec, TokenError, TokenPayload};

// =============================================================================
// Fixtures
// =============================================================================

const SECRET: &str = "integration-test-secret";

/// Fast pours: 500 ml/s simulated flow, 50 ms ticks, short grace.
fn config(dir: &TempDir) -> EdgeConfig {
    let mut config = EdgeConfig::default();
    config.hal.sim_flow_rate_ml_s = 500.0;
    config.dispense.poll_interval_ms = 50;
    config.dispense.status_grace_secs = 1;
    config.security.hmac_secret = SECRET.into();
    config.sync.machine_id = "machine-test".into();
    config.sync.api_key = "sk_test".into();
    // Closed port: health probes fail fast, and nothing here starts the loop
    config.sync.base_url = "http://127.0.0.1:9".into();
    config.database.path = dir.path().join("edge.db");
    config
}

/// Issues a token the way the backend would: same secret, same wire format.
fn issue_token(sale_id: &str, volume_ml: i64, ttl_secs: i64) -> String {
    let payload = TokenPayload::new(sale_id, "bev-ipa", volume_ml, 1, ttl_secs, Utc::now());
    TokenCodec::new(SECRET).encode(&payload).unwrap()
}

async fn wait_until_idle(ctx: &EdgeContext) {
    for _ in 0..100 {
        if ctx.status().await.dispenser.status == DispenseStatus::Idle {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("controller never returned to idle");
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_authorize_pours_and_records() {
    let dir = TempDir::new().unwrap();
    let ctx = EdgeContext::initialize(config(&dir)).await.unwrap();

    let outcome = ctx
        .authorize(&issue_token("sale-happy", 100, 120))
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert!(outcome.record_persisted);

    let status = ctx.status().await;
    assert_eq!(status.store.total, 1);
    assert_eq!(status.store.pending, 1);
    assert!(!status.sync.remote_reachable);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_expired_token_rejected() {
    let dir = TempDir::new().unwrap();
    let ctx = EdgeContext::initialize(config(&dir)).await.unwrap();

    // Expired 60s ago against a 30s tolerance
    let err = ctx
        .authorize(&issue_token("sale-expired", 100, -60))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AgentError::Token(TokenError::Expired { .. })
    ));

    // Rejections never touch the actuator or the audit trail
    let status = ctx.status().await;
    assert_eq!(status.dispenser.status, DispenseStatus::Idle);
    assert_eq!(status.store.total, 0);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_replayed_token_rejected() {
    let dir = TempDir::new().unwrap();
    let ctx = EdgeContext::initialize(config(&dir)).await.unwrap();

    let token = issue_token("sale-replay", 100, 120);
    ctx.authorize(&token).await.unwrap();

    let err = ctx.authorize(&token).await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::Token(TokenError::AlreadyUsed { .. })
    ));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_replay_rejected_across_restart() {
    let dir = TempDir::new().unwrap();
    let token = issue_token("sale-restart", 100, 300);

    // First process lifetime: token accepted and consumed
    {
        let ctx = EdgeContext::initialize(config(&dir)).await.unwrap();
        ctx.authorize(&token).await.unwrap();
        ctx.shutdown().await;
    }

    // Second process lifetime over the same store: the nonce survived
    {
        let ctx = EdgeContext::initialize(config(&dir)).await.unwrap();
        let err = ctx.authorize(&token).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Token(TokenError::AlreadyUsed { .. })
        ));

        // And the original record is still the only one
        assert_eq!(ctx.status().await.store.total, 1);
        ctx.shutdown().await;
    }
}

#[tokio::test]
async fn test_detached_authorize_acks_then_polls() {
    let dir = TempDir::new().unwrap();
    let ctx = EdgeContext::initialize(config(&dir)).await.unwrap();

    // A pour long enough to observe in flight (2000 ml at 500 ml/s = 4 s)
    let sale_id = ctx
        .authorize_detached(&issue_token("sale-detached", 2000, 120))
        .await
        .unwrap();
    assert_eq!(sale_id, "sale-detached");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = ctx.status().await;
    assert!(status.dispenser.is_dispensing);
    assert_eq!(
        status.dispenser.current_sale_id.as_deref(),
        Some("sale-detached")
    );
    assert!(status.dispenser.volume_dispensed_ml.is_some());

    // Concurrent request bounces as busy
    let err = ctx
        .authorize(&issue_token("sale-busy", 100, 120))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Busy));

    // Cancel lands on the next tick; the record carries the reason
    assert!(ctx.cancel());
    wait_until_idle(&ctx).await;

    let record = ctx
        .database()
        .consumptions()
        .get_by_sale("sale-detached")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, OutcomeStatus::Interrupted);
    assert_eq!(record.error_message.as_deref(), Some("Cancelled by user"));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_test_dispense_requires_opt_in() {
    let dir = TempDir::new().unwrap();

    // Disabled (default): rejected before any hardware is touched
    let ctx = EdgeContext::initialize(config(&dir)).await.unwrap();
    assert!(matches!(
        ctx.test_dispense(100, "bev-test").await.unwrap_err(),
        AgentError::Config(_)
    ));
    ctx.shutdown().await;

    // Enabled: pours a self-issued token
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir);
    cfg.security.test_dispense_enabled = true;
    let ctx = EdgeContext::initialize(cfg).await.unwrap();

    let outcome = ctx.test_dispense(100, "bev-test").await.unwrap();
    assert!(outcome.success);
    assert!(outcome.sale_id.starts_with("TEST-"));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_malformed_and_forged_tokens_rejected() {
    let dir = TempDir::new().unwrap();
    let ctx = EdgeContext::initialize(config(&dir)).await.unwrap();

    assert!(matches!(
        ctx.authorize("not-a-token").await.unwrap_err(),
        AgentError::Token(TokenError::Malformed(_))
    ));

    // Signed with the wrong secret
    let payload = TokenPayload::new("sale-forged", "bev-1", 100, 1, 120, Utc::now());
    let forged = TokenCodec::new("wrong-secret").encode(&payload).unwrap();
    assert!(matches!(
        ctx.authorize(&forged).await.unwrap_err(),
        AgentError::Token(TokenError::BadSignature)
    ));

    ctx.shutdown().await;
}
