//! # Edge Context
//!
//! The owned-instance replacement for process-wide singletons: one
//! `EdgeContext` is constructed at startup, holds every component, and is
//! passed by reference to the request-handling layer.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       EdgeContext Lifecycle                             │
//! │                                                                         │
//! │  initialize(config)                                                    │
//! │    ├── open store, run migrations                                      │
//! │    ├── build + initialize the configured meter binding                 │
//! │    ├── wire validator and controller                                   │
//! │    └── construct sync service (not yet running)                        │
//! │                                                                         │
//! │  start()      spawn the background sync loop                           │
//! │                                                                         │
//! │  authorize / authorize_detached / cancel / status  ← request layer     │
//! │                                                                         │
//! │  shutdown()                                                            │
//! │    ├── stop the sync loop                                              │
//! │    ├── release the actuator (pump off, pins freed)                     │
//! │    └── close the store                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use kegflow_core::{DispenseOutcome, StoreStats};
use kegflow_db::{Database, DbConfig};
use kegflow_hal::{build_flow_meter, FlowMeter, MeterStatus};
use kegflow_sync::{SyncService, SyncStatus};

use crate::config::EdgeConfig;
use crate::dispenser::{DispenseController, DispenserSnapshot};
use crate::error::AgentResult;
use crate::validator::TokenValidator;
use crate::AgentError;

// =============================================================================
// Aggregate Status
// =============================================================================

/// Everything a status poller wants in one snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EdgeStatus {
    pub dispenser: DispenserSnapshot,
    pub sync: SyncStatus,
    pub meter: MeterStatus,
    pub store: StoreStats,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Context
// =============================================================================

/// Owns every component of the edge controller for the process lifetime.
pub struct EdgeContext {
    config: EdgeConfig,
    db: Database,
    meter: Arc<dyn FlowMeter>,
    validator: TokenValidator,
    controller: DispenseController,
    sync: SyncService,
}

impl EdgeContext {
    /// Constructs and initializes all components. Nothing is running in
    /// the background yet; call [`start`](Self::start) for that.
    pub async fn initialize(config: EdgeConfig) -> AgentResult<Self> {
        config.validate()?;

        info!("Initializing edge context");

        let db = Database::new(DbConfig::new(&config.database.path)).await?;

        let meter = build_flow_meter(&config.hal)?;
        meter.initialize()?;

        let validator = TokenValidator::new(
            &config.security,
            config.dispense.max_volume_ml,
            db.used_tokens(),
        );

        let controller =
            DispenseController::new(meter.clone(), db.clone(), config.dispense.clone());

        let sync = SyncService::new(db.clone(), config.sync.clone())?;

        info!("Edge context ready");

        Ok(EdgeContext {
            config,
            db,
            meter,
            validator,
            controller,
            sync,
        })
    }

    /// Starts the background sync loop.
    pub async fn start(&self) {
        self.sync.start().await;
    }

    /// Stops background work and releases the hardware.
    pub async fn shutdown(&self) {
        info!("Shutting down edge context");

        self.sync.stop().await;

        if let Err(e) = self.meter.cleanup() {
            warn!(error = %e, "Meter cleanup failed");
        }

        self.db.close().await;

        info!("Edge context stopped");
    }

    // =========================================================================
    // Dispense Trigger Interface
    // =========================================================================

    /// Validates a token and runs the pour to completion (blocking shape).
    pub async fn authorize(&self, token: &str) -> AgentResult<DispenseOutcome> {
        let payload = self.validator.validate(token).await?;
        let outcome = self.controller.dispense(payload).await?;
        self.nudge_sync_if_backlogged().await;
        Ok(outcome)
    }

    /// Validates a token and starts the pour, returning the accepted
    /// sale id immediately (async shape). Follow progress via `status()`.
    pub async fn authorize_detached(&self, token: &str) -> AgentResult<String> {
        let payload = self.validator.validate(token).await?;
        let sale_id = payload.sale_id.clone();
        self.controller.dispense_detached(payload)?;
        Ok(sale_id)
    }

    /// Requests cancellation of the pour in progress.
    pub fn cancel(&self) -> bool {
        self.controller.cancel()
    }

    /// Aggregate status snapshot across all components.
    pub async fn status(&self) -> EdgeStatus {
        EdgeStatus {
            dispenser: self.controller.status(),
            sync: self.sync.status().await,
            meter: self.meter.status(),
            store: self.db.consumptions().stats().await.unwrap_or_default(),
            timestamp: Utc::now(),
        }
    }

    /// Self-issued pour without a backend sale (development only).
    ///
    /// Rejected unless `security.test_dispense_enabled` is set.
    pub async fn test_dispense(
        &self,
        volume_ml: i64,
        beverage_id: &str,
    ) -> AgentResult<DispenseOutcome> {
        if !self.config.security.test_dispense_enabled {
            return Err(AgentError::Config(
                "test dispense is disabled (security.test_dispense_enabled)".into(),
            ));
        }

        let sale_id = format!("TEST-{}", Utc::now().format("%Y%m%d%H%M%S%3f"));
        let token = self
            .validator
            .generate(&sale_id, beverage_id, volume_ml, 1, 60)?;

        self.authorize(&token).await
    }

    /// Direct access to the underlying components, for embedding callers.
    pub fn controller(&self) -> &DispenseController {
        &self.controller
    }

    pub fn sync_service(&self) -> &SyncService {
        &self.sync
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Kicks an out-of-band sync pass once the offline backlog crosses the
    /// configured threshold. Fire-and-forget: the dispense path never
    /// waits on the network.
    async fn nudge_sync_if_backlogged(&self) {
        let pending = match self.db.consumptions().stats().await {
            Ok(stats) => stats.pending,
            Err(e) => {
                error!(error = %e, "Stats read failed; skipping sync nudge");
                return;
            }
        };

        if pending >= self.config.database.max_offline_records {
            info!(pending, "Offline backlog threshold reached - forcing sync pass");
            let sync = self.sync.clone();
            tokio::spawn(async move {
                if let Err(e) = sync.force_sync().await {
                    warn!(error = %e, "Forced sync pass failed");
                }
            });
        }
    }
}
