//! # kegflow-core: Pure Domain Logic for KegFlow
//!
//! This crate is the **heart** of the KegFlow edge controller. It contains
//! the dispense domain model and the authorization token codec as pure
//! functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        KegFlow Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Request-handling collaborator                   │   │
//! │  │        authorize(token) ──► cancel() ──► status()              │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    kegflow-agent                                │   │
//! │  │    TokenValidator, DispenseController, EdgeContext             │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ kegflow-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌──────────────────────────┐   │   │
//! │  │   │   token   │  │   types   │  │         error            │   │   │
//! │  │   │  codec +  │  │  records, │  │  typed token rejection   │   │   │
//! │  │   │  payload  │  │  statuses │  │        reasons           │   │   │
//! │  │   └───────────┘  └───────────┘  └──────────────────────────┘   │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`token`] - Authorization token payload and HMAC-signed wire codec
//! - [`types`] - Domain types (ConsumptionRecord, FlowReading, statuses)
//! - [`error`] - Typed token rejection reasons

pub mod error;
pub mod token;
pub mod types;

pub use error::{TokenError, TokenResult};
pub use token::{TokenCodec, TokenPayload};
pub use types::*;
