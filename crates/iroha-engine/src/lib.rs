//! # Iroha Settlement Engine
//!
//! Settlement engine which bridges an Interledger connector with a
//! Hyperledger Iroha ledger. Outgoing settlement requests from the connector
//! become signed `TransferAsset` commands on the ledger, and committed
//! transfers towards this instance's Iroha account are reported back to the
//! connector as incoming settlements.

pub mod backends;
pub mod engine;
pub mod iroha;
pub mod run;
pub mod utils;

pub use engine::IrohaLedgerSettlementEngine;
