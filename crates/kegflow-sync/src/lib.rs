//! # kegflow-sync: Offline-First Reconciliation for KegFlow
//!
//! The dispense controller writes every attempt to the local store and
//! forgets about the network. This crate owns the other half of that
//! bargain: a background loop that pushes `pending` records to the remote
//! backend, retries `failed` ones within a bounded budget, and backs off
//! exponentially while the backend is unreachable.
//!
//! ## Module Organization
//!
//! - [`client`] - HTTP client for the remote consumption endpoint
//! - [`service`] - the reconciliation loop, reports, and status snapshot
//! - [`error`] - sync error types
//!
//! Sync errors never reach the dispensing path; they are recorded on the
//! affected rows and retried later.

pub mod client;
pub mod error;
pub mod service;

pub use client::{PushOutcome, RemoteClient, RemoteStatus};
pub use error::{SyncError, SyncResult};
pub use service::{ForceReport, RetryReport, SyncConfig, SyncReport, SyncService, SyncStatus};
