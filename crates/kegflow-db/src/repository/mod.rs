//! # Repository Implementations
//!
//! One repository per table, each a thin struct over a cloned `SqlitePool`:
//!
//! - [`consumption`] - the permanent dispense audit trail + sync bookkeeping
//! - [`token`] - replay-protection ledger (used nonces)
//! - [`sync_log`] - append-only log of remote sync attempts

pub mod consumption;
pub mod sync_log;
pub mod token;
