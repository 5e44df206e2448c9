use super::fixtures::ASSET;
use crate::engine::{IrohaLedgerSettlementEngine, SETTLEMENT_DESCRIPTION};
use crate::iroha::{Command, IrohaClient, IrohaError, Transaction, TransferAsset};
use crate::utils::types::IrohaStore;

use async_trait::async_trait;
use http::StatusCode;
use log::error;
use num_bigint::BigUint;
use num_traits::Zero;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ilp_settlement_core::{
    backoff,
    error::StoreError,
    types::{IdempotentStore, LeftoversStore},
};

// Test Store
#[derive(Clone)]
pub struct TestStore {
    pub peer_accounts: Arc<RwLock<HashMap<String, String>>>,
    pub settlement_accounts: Arc<RwLock<HashMap<String, String>>>,
    pub uncredited_settlement_amounts: Arc<RwLock<HashMap<String, (BigUint, u8)>>>,
    pub request_statuses: Arc<RwLock<HashMap<String, StatusCode>>>,
    pub last_checked_tx_hash: Arc<RwLock<Option<String>>>,
    pub checked_txs: Arc<RwLock<HashSet<String>>>,
    pub unchecked_txs: Arc<RwLock<Vec<String>>>,
}

pub fn test_store() -> TestStore {
    TestStore {
        peer_accounts: Arc::new(RwLock::new(HashMap::new())),
        settlement_accounts: Arc::new(RwLock::new(HashMap::new())),
        uncredited_settlement_amounts: Arc::new(RwLock::new(HashMap::new())),
        request_statuses: Arc::new(RwLock::new(HashMap::new())),
        last_checked_tx_hash: Arc::new(RwLock::new(None)),
        checked_txs: Arc::new(RwLock::new(HashSet::new())),
        unchecked_txs: Arc::new(RwLock::new(Vec::new())),
    }
}

#[async_trait]
impl IrohaStore for TestStore {
    async fn save_peer_account(
        &self,
        settlement_account_id: &str,
        peer_iroha_account_id: &str,
    ) -> Result<(), ()> {
        let mut peers = self.peer_accounts.write();
        if let Some(existing) = peers.get(settlement_account_id) {
            if existing != peer_iroha_account_id {
                error!(
                    "Settlement account {} is already tied to Iroha account {}",
                    settlement_account_id, existing
                );
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
        self.uncredited_settlement_amounts
            .write()
            .remove(settlement_account_id);
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
impl IdempotentStore for TestStore {
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
impl LeftoversStore for TestStore {
    type AccountId = String;
    type AssetType = BigUint;

    async fn save_uncredited_settlement_amount(
        &self,
        account_id: Self::AccountId,
        uncredited_settlement_amount: (Self::AssetType, u8),
    ) -> Result<(), StoreError> {
        self.uncredited_settlement_amounts
            .write()
            .insert(account_id, uncredited_settlement_amount);
        Ok(())
    }

    async fn get_uncredited_settlement_amount(
        &self,
        account_id: Self::AccountId,
    ) -> Result<(Self::AssetType, u8), StoreError> {
        Ok(self
            .uncredited_settlement_amounts
            .read()
            .get(&account_id)
            .cloned()
            .unwrap_or((Zero::zero(), 1)))
    }

    async fn clear_uncredited_settlement_amount(
        &self,
        account_id: Self::AccountId,
    ) -> Result<(), StoreError> {
        self.uncredited_settlement_amounts.write().remove(&account_id);
        Ok(())
    }
}

// Test ledger: records outgoing transfers and serves a canned transaction
// history in ledger order.
#[derive(Clone)]
pub struct TestLedger {
    pub account_id: String,
    pub transfers: Arc<RwLock<Vec<TransferAsset>>>,
    pub transfer_attempts: Arc<RwLock<u64>>,
    pub fail_transfers: Arc<RwLock<bool>>,
    pub transactions: Arc<RwLock<Vec<Transaction>>>,
}

impl TestLedger {
    pub fn new(account_id: &str) -> Self {
        TestLedger {
            account_id: account_id.to_string(),
            transfers: Arc::new(RwLock::new(Vec::new())),
            transfer_attempts: Arc::new(RwLock::new(0)),
            fail_transfers: Arc::new(RwLock::new(false)),
            transactions: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn push_transaction(&self, tx: Transaction) {
        self.transactions.write().push(tx);
    }
}

#[async_trait]
impl IrohaClient for TestLedger {
    fn account_id(&self) -> &str {
        &self.account_id
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
        *self.transfer_attempts.write() += 1;
        if *self.fail_transfers.read() {
            return Err(IrohaError::NotReceived);
        }
        self.transfers.write().push(TransferAsset {
            src_account_id: self.account_id.clone(),
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
        page_size: u32,
        first_tx_hash: Option<String>,
    ) -> Result<Vec<Transaction>, IrohaError> {
        let transactions = self.transactions.read();
        let start = match first_tx_hash {
            Some(hash) => transactions
                .iter()
                .position(|tx| tx.hash == hash)
                .map(|position| position + 1)
                .unwrap_or(0),
            None => 0,
        };
        Ok(transactions[start..]
            .iter()
            .take(page_size as usize)
            .cloned()
            .collect())
    }

    async fn get_transactions(&self, tx_hashes: &[String]) -> Result<Vec<Transaction>, IrohaError> {
        let transactions = self.transactions.read();
        Ok(transactions
            .iter()
            .filter(|tx| tx_hashes.contains(&tx.hash))
            .cloned()
            .collect())
    }
}

/// A committed settlement transfer as the observer would see it.
pub fn settlement_transfer(hash: &str, src: &str, dst: &str, amount: &str) -> Transaction {
    Transaction {
        hash: hash.to_string(),
        commands: vec![Command {
            transfer_asset: Some(TransferAsset {
                src_account_id: src.to_string(),
                dest_account_id: dst.to_string(),
                asset_id: ASSET.to_string(),
                description: SETTLEMENT_DESCRIPTION.to_string(),
                amount: amount.to_string(),
            }),
        }],
    }
}

/// Helper to create a new engine with retry delays suitable for tests.
pub fn test_engine(
    store: TestStore,
    ledger: TestLedger,
    connector_url: &str,
    asset_scale: u8,
) -> IrohaLedgerSettlementEngine<TestStore, TestLedger> {
    let mut engine = IrohaLedgerSettlementEngine::new(
        store,
        ledger,
        ASSET.to_string(),
        asset_scale,
        connector_url.parse().unwrap(),
    );
    engine.connector_backoff = backoff::ExponentialBackoff {
        initial_interval: Duration::from_millis(10),
        max_interval: Duration::from_millis(20),
        max_elapsed_time: Duration::from_millis(100),
        multiplier: 1.5,
        randomization_factor: 0.0,
    };
    engine
}
