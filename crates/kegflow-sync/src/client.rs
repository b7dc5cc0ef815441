//! # Remote Backend Client
//!
//! Thin reqwest wrapper over the two endpoints the edge consumes:
//!
//! - `GET  /api/v1/health` - reachability probe; any non-error response
//!   counts as reachable
//! - `POST /api/v1/consumptions` - one dispense record, API-key
//!   authenticated; HTTP 200/201 = accepted
//!
//! Network-level failures are data, not errors: they come back as
//! [`PushOutcome::Unreachable`] so the service can mark the row and move on.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

use kegflow_core::{ConsumptionRecord, OutcomeStatus};

use crate::error::{SyncError, SyncResult};

/// API key header, shared with the backend.
const API_KEY_HEADER: &str = "X-API-Key";

// =============================================================================
// Wire Types
// =============================================================================

/// Consumption status as the backend models it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteStatus {
    Ok,
    Partial,
    Error,
    /// Reserved by the backend; the edge reports user cancels as PARTIAL
    /// (an interrupted pour with a reason), matching the upstream contract.
    Cancelled,
}

impl From<OutcomeStatus> for RemoteStatus {
    fn from(status: OutcomeStatus) -> Self {
        match status {
            OutcomeStatus::Completed => RemoteStatus::Ok,
            OutcomeStatus::Interrupted => RemoteStatus::Partial,
            OutcomeStatus::Error => RemoteStatus::Error,
        }
    }
}

/// Request body for `POST /api/v1/consumptions`.
///
/// Timestamps serialize as RFC 3339 with a trailing `Z`, which is what the
/// backend validates.
#[derive(Debug, Serialize)]
struct ConsumptionUpload<'a> {
    machine_id: &'a str,
    sale_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_id: Option<&'a str>,
    ml_served: i64,
    ml_authorized: i64,
    status: RemoteStatus,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

/// Result of one push attempt.
#[derive(Debug, Clone)]
pub enum PushOutcome {
    /// HTTP 200/201.
    Accepted { code: u16, body: String },

    /// Any other HTTP status.
    Rejected { code: u16, body: String },

    /// Timeout or connection failure; nothing reached the backend.
    Unreachable { reason: String },
}

// =============================================================================
// Client
// =============================================================================

/// HTTP client for the remote backend.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    machine_id: String,
}

impl RemoteClient {
    /// Builds a client with the API key baked into default headers and a
    /// per-request timeout.
    pub fn new(
        base_url: impl Into<String>,
        api_key: &str,
        machine_id: impl Into<String>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            API_KEY_HEADER,
            HeaderValue::from_str(api_key)
                .map_err(|e| SyncError::InvalidConfig(format!("api key: {e}")))?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("http client: {e}")))?;

        let base_url: String = base_url.into();

        Ok(RemoteClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            machine_id: machine_id.into(),
        })
    }

    /// Probes backend reachability. Any non-error response counts.
    pub async fn health(&self) -> bool {
        let url = format!("{}/api/v1/health", self.base_url);

        match self.http.get(&url).send().await {
            Ok(response) => !response.status().is_client_error() && !response.status().is_server_error(),
            Err(_) => false,
        }
    }

    /// Pushes one consumption record.
    pub async fn push_consumption(&self, record: &ConsumptionRecord) -> PushOutcome {
        let url = format!("{}/api/v1/consumptions", self.base_url);

        let upload = ConsumptionUpload {
            machine_id: &self.machine_id,
            sale_id: &record.sale_id,
            token_id: record.token_id.as_deref(),
            ml_served: record.volume_dispensed_ml.round() as i64,
            ml_authorized: record.volume_authorized_ml,
            status: record.status.into(),
            started_at: record.started_at,
            finished_at: record.finished_at,
        };

        debug!(
            sale_id = %record.sale_id,
            ml_served = upload.ml_served,
            status = ?upload.status,
            "Pushing consumption"
        );

        let response = match self.http.post(&url).json(&upload).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return PushOutcome::Unreachable {
                    reason: "Connection timeout".to_string(),
                }
            }
            Err(e) if e.is_connect() => {
                return PushOutcome::Unreachable {
                    reason: "Connection error - backend unreachable".to_string(),
                }
            }
            Err(e) => {
                return PushOutcome::Unreachable {
                    reason: e.to_string(),
                }
            }
        };

        let code = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        if code == StatusCode::OK.as_u16() || code == StatusCode::CREATED.as_u16() {
            PushOutcome::Accepted { code, body }
        } else {
            PushOutcome::Rejected { code, body }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(RemoteStatus::from(OutcomeStatus::Completed), RemoteStatus::Ok);
        assert_eq!(
            RemoteStatus::from(OutcomeStatus::Interrupted),
            RemoteStatus::Partial
        );
        assert_eq!(RemoteStatus::from(OutcomeStatus::Error), RemoteStatus::Error);
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_string(&RemoteStatus::Ok).unwrap(), "\"OK\"");
        assert_eq!(
            serde_json::to_string(&RemoteStatus::Partial).unwrap(),
            "\"PARTIAL\""
        );
        assert_eq!(
            serde_json::to_string(&RemoteStatus::Cancelled).unwrap(),
            "\"CANCELLED\""
        );
    }

    #[test]
    fn test_upload_shape() {
        let now = Utc::now();
        let upload = ConsumptionUpload {
            machine_id: "machine-1",
            sale_id: "sale-1",
            token_id: None,
            ml_served: 300,
            ml_authorized: 300,
            status: RemoteStatus::Ok,
            started_at: now,
            finished_at: now,
        };

        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&upload).unwrap()).unwrap();

        // token_id omitted when None; timestamps end in Z
        assert!(value.get("token_id").is_none());
        assert!(value["started_at"].as_str().unwrap().ends_with('Z'));
        assert_eq!(value["status"], "OK");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = RemoteClient::new(
            "http://localhost:3001/",
            "sk_test",
            "machine-1",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.base_url, "http://localhost:3001");
    }
}
