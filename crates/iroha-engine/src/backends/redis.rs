use crate::utils::types::IrohaStore;

use async_trait::async_trait;
use futures::TryFutureExt;
use http::StatusCode;
use log::error;
use num_bigint::BigUint;
use num_traits::Zero;
use redis_crate::{
    self as redis, aio::MultiplexedConnection, cmd, AsyncCommands, ConnectionInfo,
};
use std::collections::HashMap;
use std::str::FromStr;

use ilp_settlement_core::error::StoreError;
use ilp_settlement_core::types::{IdempotentStore, LeftoversStore};

// Key for the observer's paging cursor. The data is stored in order to avoid
// double crediting transactions which have already been processed, and in
// order to resume watching from the last observed point.
static LAST_CHECKED_TX_KEY: &str = "last_checked_tx_hash";
static UNCHECKED_TRANSACTIONS_KEY: &str = "unchecked_transactions";
static IROHA_KEY: &str = "iroha";
static LEDGER_KEY: &str = "ledger";
static SETTLEMENT_KEY: &str = "settlement";
static ACCOUNTS_KEY: &str = "accounts";
static TRANSACTIONS_KEY: &str = "transactions";

fn settlement_account_key(settlement_account_id: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        IROHA_KEY, LEDGER_KEY, SETTLEMENT_KEY, settlement_account_id
    )
}

fn iroha_account_key(peer_iroha_account_id: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        IROHA_KEY, LEDGER_KEY, ACCOUNTS_KEY, peer_iroha_account_id
    )
}

fn transactions_key(tx_hash: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        IROHA_KEY, LEDGER_KEY, TRANSACTIONS_KEY, tx_hash
    )
}

fn uncredited_amount_key(settlement_account_id: &str) -> String {
    format!("uncredited-amount:{}", settlement_account_id)
}

fn request_status_key(idempotency_key: &str) -> String {
    format!("request-status:{}", idempotency_key)
}

pub struct IrohaLedgerRedisStoreBuilder {
    redis_url: ConnectionInfo,
}

impl IrohaLedgerRedisStoreBuilder {
    pub fn new(redis_url: ConnectionInfo) -> Self {
        IrohaLedgerRedisStoreBuilder { redis_url }
    }

    pub async fn connect(&self) -> Result<IrohaLedgerRedisStore, ()> {
        let client = redis::Client::open(self.redis_url.clone())
            .map_err(|err| error!("Error creating Redis client: {:?}", err))?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .map_err(|err| error!("Error connecting to Redis: {:?}", err))
            .await?;
        Ok(IrohaLedgerRedisStore { connection })
    }
}

/// An Iroha settlement engine store that uses Redis as its underlying
/// database.
#[derive(Clone)]
pub struct IrohaLedgerRedisStore {
    connection: MultiplexedConnection,
}

#[async_trait]
impl IrohaStore for IrohaLedgerRedisStore {
    async fn save_peer_account(
        &self,
        settlement_account_id: &str,
        peer_iroha_account_id: &str,
    ) -> Result<(), ()> {
        let mut connection = self.connection.clone();
        let existing: Option<String> = connection
            .get(settlement_account_key(settlement_account_id))
            .map_err(|err| error!("Error loading peer Iroha account id: {:?}", err))
            .await?;
        if let Some(existing) = existing {
            if existing != peer_iroha_account_id {
                error!(
                    "Settlement account {} is already tied to Iroha account {}; refusing to re-tie it to {}",
                    settlement_account_id, existing, peer_iroha_account_id
                );
                return Err(());
            }
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.set(
            settlement_account_key(settlement_account_id),
            peer_iroha_account_id,
        )
        .ignore();
        pipe.set(
            iroha_account_key(peer_iroha_account_id),
            settlement_account_id,
        )
        .ignore();
        pipe.query_async::<_, ()>(&mut connection)
            .map_err(|err| error!("Error saving peer Iroha account id: {:?}", err))
            .await
    }

    async fn load_peer_account(&self, settlement_account_id: &str) -> Result<Option<String>, ()> {
        let mut connection = self.connection.clone();
        connection
            .get(settlement_account_key(settlement_account_id))
            .map_err(|err| error!("Error loading peer Iroha account id: {:?}", err))
            .await
    }

    async fn load_settlement_account(
        &self,
        peer_iroha_account_id: &str,
    ) -> Result<Option<String>, ()> {
        let mut connection = self.connection.clone();
        connection
            .get(iroha_account_key(peer_iroha_account_id))
            .map_err(|err| error!("Error loading settlement account id: {:?}", err))
            .await
    }

    async fn exists_settlement_account(&self, settlement_account_id: &str) -> Result<bool, ()> {
        let mut connection = self.connection.clone();
        connection
            .exists(settlement_account_key(settlement_account_id))
            .map_err(|err| error!("Error checking settlement account: {:?}", err))
            .await
    }

    async fn delete_settlement_account(&self, settlement_account_id: &str) -> Result<(), ()> {
        let mut connection = self.connection.clone();
        let peer: Option<String> = connection
            .get(settlement_account_key(settlement_account_id))
            .map_err(|err| error!("Error loading peer Iroha account id: {:?}", err))
            .await?;
        let mut pipe = redis::pipe();
        pipe.del(settlement_account_key(settlement_account_id))
            .ignore();
        if let Some(peer) = peer {
            pipe.del(iroha_account_key(&peer)).ignore();
        }
        pipe.del(uncredited_amount_key(settlement_account_id))
            .ignore();
        pipe.query_async::<_, ()>(&mut connection)
            .map_err(|err| error!("Error deleting settlement account: {:?}", err))
            .await
    }

    async fn load_last_checked_tx_hash(&self) -> Result<Option<String>, ()> {
        let mut connection = self.connection.clone();
        connection
            .get(LAST_CHECKED_TX_KEY)
            .map_err(|err| error!("Error loading last checked transaction hash: {:?}", err))
            .await
    }

    async fn save_last_checked_tx_hash(&self, tx_hash: &str) -> Result<(), ()> {
        let mut connection = self.connection.clone();
        connection
            .set::<_, _, ()>(LAST_CHECKED_TX_KEY, tx_hash)
            .map_err(|err| error!("Error saving last checked transaction hash: {:?}", err))
            .await
    }

    async fn was_tx_checked(&self, tx_hash: &str) -> Result<bool, ()> {
        let mut connection = self.connection.clone();
        connection
            .exists(transactions_key(tx_hash))
            .map_err(|err| error!("Error querying store about transaction: {:?}", err))
            .await
    }

    async fn save_checked_tx(&self, tx_hash: &str) -> Result<(), ()> {
        let mut connection = self.connection.clone();
        let marked_successfully: bool = cmd("SETNX")
            .arg(transactions_key(tx_hash))
            .arg(true)
            .query_async(&mut connection)
            .map_err(|err| error!("Error marking transaction as checked: {:?}", err))
            .await?;
        if marked_successfully {
            Ok(())
        } else {
            Err(())
        }
    }

    async fn save_unchecked_tx(&self, tx_hash: &str) -> Result<(), ()> {
        let mut connection = self.connection.clone();
        connection
            .sadd::<_, _, ()>(UNCHECKED_TRANSACTIONS_KEY, tx_hash)
            .map_err(|err| error!("Error marking transaction as unchecked: {:?}", err))
            .await
    }

    async fn remove_unchecked_tx(&self, tx_hash: &str) -> Result<(), ()> {
        let mut connection = self.connection.clone();
        connection
            .srem::<_, _, ()>(UNCHECKED_TRANSACTIONS_KEY, tx_hash)
            .map_err(|err| error!("Error removing unchecked transaction: {:?}", err))
            .await
    }

    async fn load_unchecked_tx_hashes(&self) -> Result<Vec<String>, ()> {
        let mut connection = self.connection.clone();
        connection
            .smembers(UNCHECKED_TRANSACTIONS_KEY)
            .map_err(|err| error!("Error loading unchecked transactions: {:?}", err))
            .await
    }
}

#[async_trait]
impl IdempotentStore for IrohaLedgerRedisStore {
    async fn load_request_status(
        &self,
        idempotency_key: String,
    ) -> Result<Option<StatusCode>, StoreError> {
        let mut connection = self.connection.clone();
        let status: Option<u16> = connection
            .get(request_status_key(&idempotency_key))
            .map_err(|err| StoreError(format!("couldn't load request status: {:?}", err)))
            .await?;
        Ok(status.and_then(|status| StatusCode::from_u16(status).ok()))
    }

    async fn save_request_status(
        &self,
        idempotency_key: String,
        status: StatusCode,
    ) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        connection
            .set::<_, _, ()>(request_status_key(&idempotency_key), status.as_u16())
            .map_err(|err| StoreError(format!("couldn't save request status: {:?}", err)))
            .await
    }
}

#[async_trait]
impl LeftoversStore for IrohaLedgerRedisStore {
    type AccountId = String;
    type AssetType = BigUint;

    async fn save_uncredited_settlement_amount(
        &self,
        account_id: Self::AccountId,
        uncredited_settlement_amount: (Self::AssetType, u8),
    ) -> Result<(), StoreError> {
        let (amount, scale) = uncredited_settlement_amount;
        let mut connection = self.connection.clone();
        connection
            .hset_multiple::<_, _, _, ()>(
                uncredited_amount_key(&account_id),
                &[("amount", amount.to_string()), ("scale", scale.to_string())],
            )
            .map_err(|err| {
                StoreError(format!("couldn't save uncredited settlement amount: {:?}", err))
            })
            .await
    }

    async fn get_uncredited_settlement_amount(
        &self,
        account_id: Self::AccountId,
    ) -> Result<(Self::AssetType, u8), StoreError> {
        let mut connection = self.connection.clone();
        let leftovers: HashMap<String, String> = connection
            .hgetall(uncredited_amount_key(&account_id))
            .map_err(|err| {
                StoreError(format!("couldn't load uncredited settlement amount: {:?}", err))
            })
            .await?;
        if leftovers.is_empty() {
            return Ok((Zero::zero(), 1));
        }
        let amount = leftovers
            .get("amount")
            .and_then(|amount| BigUint::from_str(amount).ok())
            .ok_or_else(|| StoreError("malformed uncredited settlement amount".to_string()))?;
        let scale = leftovers
            .get("scale")
            .and_then(|scale| scale.parse::<u8>().ok())
            .ok_or_else(|| StoreError("malformed uncredited settlement scale".to_string()))?;
        Ok((amount, scale))
    }

    async fn clear_uncredited_settlement_amount(
        &self,
        account_id: Self::AccountId,
    ) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        connection
            .del::<_, ()>(uncredited_amount_key(&account_id))
            .map_err(|err| {
                StoreError(format!("couldn't clear uncredited settlement amount: {:?}", err))
            })
            .await
    }
}
