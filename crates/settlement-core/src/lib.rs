//! # Interledger Settlement Core
//!
//! Ledger-agnostic building blocks for implementing the Settlement
//! Architecture for the Interledger Protocol. The crate exposes an HTTP API
//! that is created by giving it an object which implements the
//! [`SettlementEngine`](crate::types::SettlementEngine) trait, along with the
//! store traits, scale arithmetic and retry policies that every concrete
//! engine needs regardless of the ledger it settles on.

pub mod api;
pub mod backoff;
pub mod error;
pub mod types;

pub use self::api::create_settlement_engine_filter;
pub use self::types::scale_with_precision_loss;
