//! # kegflow-agent: Dispense Orchestration for KegFlow
//!
//! Ties the workspace together: a validated token goes in, a metered pour
//! happens under safety limits, a durable record comes out, and the sync
//! service reconciles it upstream when connectivity allows.
//!
//! ## Modules
//!
//! - [`config`] - the full configuration surface (TOML + env overrides)
//! - [`validator`] - token validation with replay protection
//! - [`dispenser`] - the dispense state machine
//! - [`context`] - [`EdgeContext`]: owned instances, init/teardown lifecycle
//! - [`error`] - agent error types
//!
//! ## Lifecycle
//!
//! ```rust,ignore
//! let config = EdgeConfig::load("/etc/kegflow/edge.toml")?;
//! let ctx = EdgeContext::initialize(config).await?;
//! ctx.start().await;                     // background sync loop
//!
//! let outcome = ctx.authorize(&token).await?;   // blocking call shape
//! // ... or ctx.authorize_detached(&token) + ctx.status() polling
//!
//! ctx.shutdown().await;                  // stop sync, release hardware
//! ```
//!
//! There are deliberately no module-level singletons: the process owns one
//! `EdgeContext` and passes it where it is needed.

pub mod config;
pub mod context;
pub mod dispenser;
pub mod error;
pub mod validator;

pub use config::{DatabaseConfig, DispenseConfig, EdgeConfig, SecurityConfig};
pub use context::{EdgeContext, EdgeStatus};
pub use dispenser::{DispenseController, DispenserSnapshot, ProgressObserver};
pub use error::{AgentError, AgentResult};
pub use validator::TokenValidator;
