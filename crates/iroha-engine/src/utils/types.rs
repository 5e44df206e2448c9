use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Payload exchanged with the peer's settlement engine (through both
/// connectors) while setting up a settlement account. The same shape is used
/// for the request and the response; the field name is part of the wire
/// contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetailsMessage {
    pub iroha_account_id: String,
}

/// Store for the engine's Iroha-specific state: the settlement account to
/// peer Iroha account mapping (kept in both directions), the observer's
/// paging cursor and the processed / to-be-retried transaction sets.
///
/// Errors are logged by the implementation and surfaced as `()`, turning
/// into internal errors at the API boundary.
#[async_trait]
pub trait IrohaStore {
    /// Ties a settlement account to the peer's Iroha account, maintaining
    /// the reverse index as well. A settlement account can never be re-tied
    /// to a different Iroha account; delete and recreate it instead.
    async fn save_peer_account(
        &self,
        settlement_account_id: &str,
        peer_iroha_account_id: &str,
    ) -> Result<(), ()>;

    async fn load_peer_account(&self, settlement_account_id: &str) -> Result<Option<String>, ()>;

    /// Reverse lookup: which settlement account does a peer's Iroha account
    /// belong to? Used to classify incoming ledger transfers.
    async fn load_settlement_account(
        &self,
        peer_iroha_account_id: &str,
    ) -> Result<Option<String>, ()>;

    async fn exists_settlement_account(&self, settlement_account_id: &str) -> Result<bool, ()>;

    /// Removes the peer mapping (both directions) and any leftovers for the
    /// account. Idempotency records and the transaction sets are global to
    /// the engine instance and stay untouched.
    async fn delete_settlement_account(&self, settlement_account_id: &str) -> Result<(), ()>;

    /// The hash of the most recent ledger transaction the observer has
    /// advanced past; unset means "poll from the beginning".
    async fn load_last_checked_tx_hash(&self) -> Result<Option<String>, ()>;

    async fn save_last_checked_tx_hash(&self, tx_hash: &str) -> Result<(), ()>;

    async fn was_tx_checked(&self, tx_hash: &str) -> Result<bool, ()>;

    async fn save_checked_tx(&self, tx_hash: &str) -> Result<(), ()>;

    async fn save_unchecked_tx(&self, tx_hash: &str) -> Result<(), ()>;

    async fn remove_unchecked_tx(&self, tx_hash: &str) -> Result<(), ()>;

    async fn load_unchecked_tx_hashes(&self) -> Result<Vec<String>, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_details_round_trip_is_identity() {
        let message = PaymentDetailsMessage {
            iroha_account_id: "alice@test".to_string(),
        };
        let encoded = serde_json::to_vec(&message).unwrap();
        assert_eq!(
            String::from_utf8_lossy(&encoded),
            r#"{"iroha_account_id":"alice@test"}"#
        );
        let decoded: PaymentDetailsMessage = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, message);
    }
}
