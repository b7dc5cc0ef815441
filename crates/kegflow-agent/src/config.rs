//! # Edge Configuration
//!
//! The full configuration surface of the edge controller: one TOML file,
//! environment-variable overrides for the secrets and deployment identity,
//! defaults for everything else.
//!
//! ## Configuration File Format
//! ```toml
//! # /etc/kegflow/edge.toml
//! [hal]
//! binding = "gpio"            # "simulated" on development hosts
//! pump_pin = 17
//! flow_sensor_pin = 27
//! pulses_per_liter = 450.0    # YF-S201; YF-S401 is ~5880
//!
//! [dispense]
//! max_dispense_secs = 120     # safety cutoff
//! poll_interval_ms = 500
//! no_flow_window_secs = 3.0   # empty-keg detection
//! status_grace_secs = 3       # terminal status hold for pollers
//! max_volume_ml = 2000        # token volume cap
//!
//! [security]
//! hmac_secret = ""            # or KEGFLOW_HMAC_SECRET
//! token_expiry_tolerance_secs = 30
//! used_token_ttl_secs = 300
//!
//! [sync]
//! base_url = "https://backend.example.com"
//! machine_id = "7ef8ddb1-..."
//! interval_secs = 15
//! max_retries = 3
//!
//! [database]
//! path = "/var/lib/kegflow/edge.db"
//! max_offline_records = 100
//! ```
//!
//! ## Environment Overrides
//!
//! `KEGFLOW_HMAC_SECRET`, `KEGFLOW_API_KEY`, `KEGFLOW_MACHINE_ID`,
//! `KEGFLOW_REMOTE_URL`, `KEGFLOW_DB_PATH` - the values that differ per
//! deployment or must stay out of the config file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use kegflow_hal::HalConfig;
use kegflow_sync::SyncConfig;

use crate::error::{AgentError, AgentResult};

// =============================================================================
// Sections
// =============================================================================

/// Dispense controller limits and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispenseConfig {
    /// Safety cutoff: a pour never runs longer than this, seconds.
    pub max_dispense_secs: u64,

    /// Advisory minimum average flow rate (ml/s); a completed pour below
    /// this is logged as a possible line restriction.
    pub min_flow_rate_ml_s: f64,

    /// Metering loop tick interval, milliseconds. Bounds cancellation and
    /// timeout latency.
    pub poll_interval_ms: u64,

    /// Seconds without a new pulse before declaring an empty keg.
    pub no_flow_window_secs: f64,

    /// How long a terminal status is held for pollers before the
    /// controller rearms to idle, seconds.
    pub status_grace_secs: u64,

    /// Upper bound on the volume a token may authorize, milliliters.
    pub max_volume_ml: i64,
}

impl Default for DispenseConfig {
    fn default() -> Self {
        DispenseConfig {
            max_dispense_secs: 120,
            min_flow_rate_ml_s: 5.0,
            poll_interval_ms: 500,
            no_flow_window_secs: 3.0,
            status_grace_secs: 3,
            max_volume_ml: 2000,
        }
    }
}

/// Token security parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// HMAC secret shared with the token issuer. Required; usually
    /// supplied via `KEGFLOW_HMAC_SECRET`.
    pub hmac_secret: String,

    /// Accept tokens up to this many seconds past `expires_at`.
    pub token_expiry_tolerance_secs: i64,

    /// How long a consumed nonce stays in the replay ledger.
    pub used_token_ttl_secs: i64,

    /// Enables the self-issued test-dispense path. Never in production.
    pub test_dispense_enabled: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            hmac_secret: String::new(),
            token_expiry_tolerance_secs: 30,
            used_token_ttl_secs: 300,
            test_dispense_enabled: false,
        }
    }
}

/// Local store location and offline limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file path.
    pub path: PathBuf,

    /// Pending-record count that triggers an out-of-band sync pass.
    pub max_offline_records: i64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: PathBuf::from("kegflow_edge.db"),
            max_offline_records: 100,
        }
    }
}

// =============================================================================
// Root Config
// =============================================================================

/// Complete edge controller configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub hal: HalConfig,
    pub dispense: DispenseConfig,
    pub security: SecurityConfig,
    pub sync: SyncConfig,
    pub database: DatabaseConfig,
}

impl EdgeConfig {
    /// Loads configuration from a TOML file, then applies environment
    /// overrides and validates.
    pub fn load(path: impl AsRef<Path>) -> AgentResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AgentError::Config(format!("read {}: {e}", path.as_ref().display())))?;

        let mut config: EdgeConfig = toml::from_str(&raw)
            .map_err(|e| AgentError::Config(format!("parse {}: {e}", path.as_ref().display())))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides; for deployments that configure
    /// everything through the environment.
    pub fn from_env() -> AgentResult<Self> {
        let mut config = EdgeConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Applies the per-deployment environment variables over whatever is
    /// already set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var("KEGFLOW_HMAC_SECRET") {
            self.security.hmac_secret = secret;
        }
        if let Ok(key) = std::env::var("KEGFLOW_API_KEY") {
            self.sync.api_key = key;
        }
        if let Ok(machine) = std::env::var("KEGFLOW_MACHINE_ID") {
            self.sync.machine_id = machine;
        }
        if let Ok(url) = std::env::var("KEGFLOW_REMOTE_URL") {
            self.sync.base_url = url;
        }
        if let Ok(path) = std::env::var("KEGFLOW_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        debug!("Environment overrides applied");
    }

    /// Rejects configurations the controller cannot run safely with.
    pub fn validate(&self) -> AgentResult<()> {
        if self.security.hmac_secret.is_empty() {
            return Err(AgentError::Config(
                "security.hmac_secret is required (or KEGFLOW_HMAC_SECRET)".into(),
            ));
        }
        if self.dispense.max_volume_ml <= 0 {
            return Err(AgentError::Config("dispense.max_volume_ml must be > 0".into()));
        }
        if self.dispense.poll_interval_ms == 0 {
            return Err(AgentError::Config("dispense.poll_interval_ms must be > 0".into()));
        }
        if self.dispense.max_dispense_secs == 0 {
            return Err(AgentError::Config("dispense.max_dispense_secs must be > 0".into()));
        }
        if self.hal.pulses_per_liter <= 0.0 {
            return Err(AgentError::Config("hal.pulses_per_liter must be > 0".into()));
        }
        self.sync
            .validate()
            .map_err(|e| AgentError::Config(e.to_string()))?;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> EdgeConfig {
        let mut config = EdgeConfig::default();
        config.security.hmac_secret = "secret".into();
        config.sync.machine_id = "machine-1".into();
        config
    }

    #[test]
    fn test_defaults_match_field_hardware() {
        let config = EdgeConfig::default();
        assert_eq!(config.dispense.max_dispense_secs, 120);
        assert_eq!(config.dispense.poll_interval_ms, 500);
        assert!((config.dispense.no_flow_window_secs - 3.0).abs() < f64::EPSILON);
        assert_eq!(config.security.token_expiry_tolerance_secs, 30);
        assert_eq!(config.security.used_token_ttl_secs, 300);
        assert_eq!(config.sync.interval_secs, 15);
        assert_eq!(config.database.max_offline_records, 100);
    }

    #[test]
    fn test_validation_requires_secret() {
        let mut config = valid();
        assert!(config.validate().is_ok());

        config.security.hmac_secret.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_limits() {
        let mut config = valid();
        config.dispense.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.dispense.max_volume_ml = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.hal.pulses_per_liter = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: EdgeConfig = toml::from_str(
            r#"
            [security]
            hmac_secret = "from-file"

            [dispense]
            max_dispense_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.security.hmac_secret, "from-file");
        assert_eq!(config.dispense.max_dispense_secs, 60);
        // Untouched sections keep defaults
        assert_eq!(config.dispense.poll_interval_ms, 500);
        assert_eq!(config.sync.max_retries, 3);
    }
}
