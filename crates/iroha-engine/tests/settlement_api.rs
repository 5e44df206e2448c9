//! Drives the settlement engine through its HTTP API the way the connector
//! does, against an in-memory store and ledger.

use async_trait::async_trait;
use http::StatusCode;
use num_bigint::BigUint;
use num_traits::Zero;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ilp_settlement_core::{
    create_settlement_engine_filter,
    error::StoreError,
    types::{IdempotentStore, LeftoversStore, Quantity},
};
use ilp_settlement_iroha::engine::IrohaLedgerSettlementEngine;
use ilp_settlement_iroha::iroha::{IrohaClient, IrohaError, Transaction, TransferAsset};
use ilp_settlement_iroha::utils::types::{IrohaStore, PaymentDetailsMessage};

#[derive(Clone, Default)]
struct MockStore {
    peer_accounts: Arc<RwLock<HashMap<String, String>>>,
    settlement_accounts: Arc<RwLock<HashMap<String, String>>>,
    uncredited: Arc<RwLock<HashMap<String, (BigUint, u8)>>>,
    request_statuses: Arc<RwLock<HashMap<String, StatusCode>>>,
    last_checked_tx_hash: Arc<RwLock<Option<String>>>,
    checked_txs: Arc<RwLock<HashSet<String>>>,
    unchecked_txs: Arc<RwLock<Vec<String>>>,
}

#[async_trait]
impl IrohaStore for MockStore {
    async fn save_peer_account(
        &self,
        settlement_account_id: &str,
        peer_iroha_account_id: &str,
    ) -> Result<(), ()> {
        let mut peers = self.peer_accounts.write();
        if let Some(existing) = peers.get(settlement_account_id) {
            if existing != peer_iroha_account_id {
                return Err(());
            }
            return Ok(());
        }
        peers.insert(
            settlement_account_id.to_string(),
            peer_iroha_account_id.to_string(),
        );
        self.settlement_accounts.write().insert(
            peer_iroha_account_id.to_string(),
            settlement_account_id.to_string(),
        );
        Ok(())
    }

    async fn load_peer_account(&self, settlement_account_id: &str) -> Result<Option<String>, ()> {
        Ok(self.peer_accounts.read().get(settlement_account_id).cloned())
    }

    async fn load_settlement_account(
        &self,
        peer_iroha_account_id: &str,
    ) -> Result<Option<String>, ()> {
        Ok(self
            .settlement_accounts
            .read()
            .get(peer_iroha_account_id)
            .cloned())
    }

    async fn exists_settlement_account(&self, settlement_account_id: &str) -> Result<bool, ()> {
        Ok(self.peer_accounts.read().contains_key(settlement_account_id))
    }

    async fn delete_settlement_account(&self, settlement_account_id: &str) -> Result<(), ()> {
        if let Some(peer) = self.peer_accounts.write().remove(settlement_account_id) {
            self.settlement_accounts.write().remove(&peer);
        }
        self.uncredited.write().remove(settlement_account_id);
        Ok(())
    }

    async fn load_last_checked_tx_hash(&self) -> Result<Option<String>, ()> {
        Ok(self.last_checked_tx_hash.read().clone())
    }

    async fn save_last_checked_tx_hash(&self, tx_hash: &str) -> Result<(), ()> {
        *self.last_checked_tx_hash.write() = Some(tx_hash.to_string());
        Ok(())
    }

    async fn was_tx_checked(&self, tx_hash: &str) -> Result<bool, ()> {
        Ok(self.checked_txs.read().contains(tx_hash))
    }

    async fn save_checked_tx(&self, tx_hash: &str) -> Result<(), ()> {
        self.checked_txs.write().insert(tx_hash.to_string());
        Ok(())
    }

    async fn save_unchecked_tx(&self, tx_hash: &str) -> Result<(), ()> {
        let mut unchecked = self.unchecked_txs.write();
        if !unchecked.iter().any(|hash| hash == tx_hash) {
            unchecked.push(tx_hash.to_string());
        }
        Ok(())
    }

    async fn remove_unchecked_tx(&self, tx_hash: &str) -> Result<(), ()> {
        self.unchecked_txs.write().retain(|hash| hash != tx_hash);
        Ok(())
    }

    async fn load_unchecked_tx_hashes(&self) -> Result<Vec<String>, ()> {
        Ok(self.unchecked_txs.read().clone())
    }
}

#[async_trait]
impl IdempotentStore for MockStore {
    async fn load_request_status(
        &self,
        idempotency_key: String,
    ) -> Result<Option<StatusCode>, StoreError> {
        Ok(self.request_statuses.read().get(&idempotency_key).copied())
    }

    async fn save_request_status(
        &self,
        idempotency_key: String,
        status: StatusCode,
    ) -> Result<(), StoreError> {
        self.request_statuses.write().insert(idempotency_key, status);
        Ok(())
    }
}

#[async_trait]
impl LeftoversStore for MockStore {
    type AccountId = String;
    type AssetType = BigUint;

    async fn save_uncredited_settlement_amount(
        &self,
        account_id: Self::AccountId,
        uncredited_settlement_amount: (Self::AssetType, u8),
    ) -> Result<(), StoreError> {
        self.uncredited
            .write()
            .insert(account_id, uncredited_settlement_amount);
        Ok(())
    }

    async fn get_uncredited_settlement_amount(
        &self,
        account_id: Self::AccountId,
    ) -> Result<(Self::AssetType, u8), StoreError> {
        Ok(self
            .uncredited
            .read()
            .get(&account_id)
            .cloned()
            .unwrap_or((Zero::zero(), 1)))
    }

    async fn clear_uncredited_settlement_amount(
        &self,
        account_id: Self::AccountId,
    ) -> Result<(), StoreError> {
        self.uncredited.write().remove(&account_id);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct MockLedger {
    transfers: Arc<RwLock<Vec<TransferAsset>>>,
}

#[async_trait]
impl IrohaClient for MockLedger {
    fn account_id(&self) -> &str {
        "alice@test"
    }

    async fn get_account(&self, _account_id: &str) -> Result<(), IrohaError> {
        Ok(())
    }

    async fn transfer_asset(
        &self,
        dest_account_id: &str,
        asset_id: &str,
        description: &str,
        amount: &str,
    ) -> Result<(), IrohaError> {
        self.transfers.write().push(TransferAsset {
            src_account_id: "alice@test".to_string(),
            dest_account_id: dest_account_id.to_string(),
            asset_id: asset_id.to_string(),
            description: description.to_string(),
            amount: amount.to_string(),
        });
        Ok(())
    }

    async fn get_account_asset_transactions(
        &self,
        _account_id: &str,
        _asset_id: &str,
        _page_size: u32,
        _first_tx_hash: Option<String>,
    ) -> Result<Vec<Transaction>, IrohaError> {
        Ok(Vec::new())
    }

    async fn get_transactions(
        &self,
        _tx_hashes: &[String],
    ) -> Result<Vec<Transaction>, IrohaError> {
        Ok(Vec::new())
    }
}

fn test_api(
    store: MockStore,
    ledger: MockLedger,
) -> warp::filters::BoxedFilter<(impl warp::Reply,)> {
    let engine = IrohaLedgerSettlementEngine::new(
        store,
        ledger,
        "coin0#test".to_string(),
        2,
        "http://127.0.0.1:7771".parse().unwrap(),
    );
    create_settlement_engine_filter(engine)
}

#[tokio::test]
async fn inbound_handshake_and_settlement_flow() {
    let store = MockStore::default();
    let ledger = MockLedger::default();
    let api = test_api(store.clone(), ledger.clone());

    // the peer's engine ships its payment details through our connector
    let message = serde_json::to_vec(&PaymentDetailsMessage {
        iroha_account_id: "bob@test".to_string(),
    })
    .unwrap();
    let ret = warp::test::request()
        .method("POST")
        .path("/accounts/A/messages")
        .body(message)
        .reply(&api)
        .await;
    assert_eq!(ret.status(), StatusCode::CREATED);
    let response: PaymentDetailsMessage = serde_json::from_slice(ret.body()).unwrap();
    assert_eq!(response.iroha_account_id, "alice@test");
    assert_eq!(
        store.peer_accounts.read().get("A"),
        Some(&"bob@test".to_string())
    );

    // the connector requests an outgoing settlement of 0.500 at scale 3
    let ret = warp::test::request()
        .method("POST")
        .path("/accounts/A/settlements")
        .header("Idempotency-Key", "3b3a3f3e-8cc6-4a68-a16d-f4a9d6fce85b")
        .body(json!(Quantity::new(500u32, 3)).to_string())
        .reply(&api)
        .await;
    assert_eq!(ret.status(), StatusCode::CREATED);
    {
        let transfers = ledger.transfers.read();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].dest_account_id, "bob@test");
        assert_eq!(transfers[0].amount, "50");
        assert_eq!(transfers[0].description, "ILP Settlement");
    }

    // replaying the same idempotency key must not touch the ledger again
    let ret = warp::test::request()
        .method("POST")
        .path("/accounts/A/settlements")
        .header("Idempotency-Key", "3b3a3f3e-8cc6-4a68-a16d-f4a9d6fce85b")
        .body(json!(Quantity::new(500u32, 3)).to_string())
        .reply(&api)
        .await;
    assert_eq!(ret.status(), StatusCode::CREATED);
    assert_eq!(ledger.transfers.read().len(), 1);
}

#[tokio::test]
async fn settlement_without_idempotency_key_is_rejected() {
    let api = test_api(MockStore::default(), MockLedger::default());
    let ret = warp::test::request()
        .method("POST")
        .path("/accounts/A/settlements")
        .body(json!(Quantity::new(500u32, 3)).to_string())
        .reply(&api)
        .await;
    assert_eq!(ret.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn settlement_for_unknown_account_fails() {
    let ledger = MockLedger::default();
    let api = test_api(MockStore::default(), ledger.clone());
    let ret = warp::test::request()
        .method("POST")
        .path("/accounts/missing/settlements")
        .header("Idempotency-Key", "6ef6ac91-80e0-4fb7-b908-2c0b0324b0d5")
        .body(json!(Quantity::new(500u32, 3)).to_string())
        .reply(&api)
        .await;
    assert_eq!(ret.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(ledger.transfers.read().is_empty());
}

#[tokio::test]
async fn deleting_accounts_is_observable_over_http() {
    let store = MockStore::default();
    let api = test_api(store.clone(), MockLedger::default());

    store.save_peer_account("A", "bob@test").await.unwrap();

    let ret = warp::test::request()
        .method("DELETE")
        .path("/accounts/A")
        .reply(&api)
        .await;
    assert_eq!(ret.status(), StatusCode::NO_CONTENT);
    assert!(store.peer_accounts.read().is_empty());

    // a second delete is an error per the connector contract
    let ret = warp::test::request()
        .method("DELETE")
        .path("/accounts/A")
        .reply(&api)
        .await;
    assert_eq!(ret.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
