//! # kegflow-db: Local Durable Store for KegFlow
//!
//! SQLite-backed persistence for the edge controller: consumption records,
//! replay-protection entries, and the sync audit log. Everything here
//! survives a process restart - that is the point.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        KegFlow Data Flow                                │
//! │                                                                         │
//! │  DispenseController (persist outcome)      SyncService (reconcile)     │
//! │       │                                         │                       │
//! │       ▼                                         ▼                       │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     kegflow-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐   ┌────────────────────┐  ┌─────────────┐  │   │
//! │  │   │   Database    │   │    Repositories    │  │ Migrations  │  │   │
//! │  │   │   (pool.rs)   │   │  consumption.rs    │  │ (embedded)  │  │   │
//! │  │   │               │   │  token.rs          │  │             │  │   │
//! │  │   │ SqlitePool    │◄──│  sync_log.rs       │  │ 001_init... │  │   │
//! │  │   │ WAL + FK      │   │                    │  │             │  │   │
//! │  │   └───────────────┘   └────────────────────┘  └─────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file (e.g. /var/lib/kegflow/edge.db)                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations (consumption, token, log)

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::consumption::ConsumptionRepository;
pub use repository::sync_log::SyncLogRepository;
pub use repository::token::UsedTokenRepository;
