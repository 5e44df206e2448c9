use crate::iroha::{IrohaClient, Transaction};
use crate::utils::types::{IrohaStore, PaymentDetailsMessage};

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use log::{debug, error, info, trace};
use num_bigint::BigUint;
use num_traits::Zero;
use reqwest::{Client as RequestClient, Response as HttpResponse};
use std::cmp;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_retry::{strategy::ExponentialBackoff, Retry};
use url::Url;
use uuid::Uuid;

use ilp_settlement_core::{
    backoff,
    error::ApiError,
    scale_with_precision_loss,
    types::{
        merge_leftovers, ApiResponse, IdempotentStore, LeftoversStore, Quantity, SettlementEngine,
    },
};

/// Description attached to every settlement transfer on the ledger. Incoming
/// transfers are only treated as settlements when they carry it.
pub const SETTLEMENT_DESCRIPTION: &str = "ILP Settlement";

/// How many times a transfer is submitted to Iroha before the settlement
/// request fails as a whole.
const MAX_ATTEMPTS: usize = 10;

/// The number of transactions to be retrieved on each Iroha poll query.
const TRANSACTIONS_PAGE_SIZE: u32 = 10;

pub struct IrohaLedgerSettlementEngine<S, C> {
    pub store: S,
    pub iroha_client: Arc<C>,
    pub asset_id: String,
    pub asset_scale: u8,
    pub connector_url: Url,
    pub connector_backoff: backoff::ExponentialBackoff,
    settle_lock: Arc<Mutex<()>>,
}

impl<S: Clone, C> Clone for IrohaLedgerSettlementEngine<S, C> {
    fn clone(&self) -> Self {
        IrohaLedgerSettlementEngine {
            store: self.store.clone(),
            iroha_client: self.iroha_client.clone(),
            asset_id: self.asset_id.clone(),
            asset_scale: self.asset_scale,
            connector_url: self.connector_url.clone(),
            connector_backoff: self.connector_backoff.clone(),
            settle_lock: self.settle_lock.clone(),
        }
    }
}

impl<S, C> IrohaLedgerSettlementEngine<S, C>
where
    S: IrohaStore
        + LeftoversStore<AccountId = String, AssetType = BigUint>
        + IdempotentStore
        + Clone
        + Send
        + Sync
        + 'static,
    C: IrohaClient + Send + Sync + 'static,
{
    pub fn new(
        store: S,
        iroha_client: C,
        asset_id: String,
        asset_scale: u8,
        connector_url: Url,
    ) -> Self {
        IrohaLedgerSettlementEngine {
            store,
            iroha_client: Arc::new(iroha_client),
            asset_id,
            asset_scale,
            connector_url,
            connector_backoff: backoff::ExponentialBackoff::default(),
            settle_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Starts the incoming settlement observer, polling Iroha with the given
    /// period. A tick that is still running swallows the ticks it missed, so
    /// iterations never overlap.
    pub fn spawn(&self, freq: Duration) {
        let engine_clone = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(freq);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                // ignore the return value
                let _ = engine_clone.handle_received_transactions().await;
            }
        });
    }

    /// Routine for notifying the connector about incoming settlements.
    /// Each tick:
    /// 1. Fetch a page of transactions newer than the last checked one and
    ///    process each, advancing the cursor past every transaction which
    ///    was fully checked.
    /// 2. Re-fetch the transactions whose connector notification previously
    ///    failed and process them again; these never move the cursor.
    pub async fn handle_received_transactions(&self) -> Result<(), ()> {
        let account_id = self.iroha_client.account_id();
        let last_checked = self.store.load_last_checked_tx_hash().await?;

        let new_txs = self
            .iroha_client
            .get_account_asset_transactions(
                account_id,
                &self.asset_id,
                TRANSACTIONS_PAGE_SIZE,
                last_checked,
            )
            .await
            .map_err(|err| error!("Could not fetch new transactions: {}", err))?;

        for tx in &new_txs {
            if self.process_transaction(tx).await {
                self.store.save_last_checked_tx_hash(&tx.hash).await?;
            }
        }

        // We can't query Iroha with an empty transaction hashes list
        let unchecked = self.store.load_unchecked_tx_hashes().await?;
        if !unchecked.is_empty() {
            let unchecked_txs = self
                .iroha_client
                .get_transactions(&unchecked)
                .await
                .map_err(|err| error!("Could not fetch unchecked transactions: {}", err))?;

            for tx in &unchecked_txs {
                if self.process_transaction(tx).await {
                    self.store.remove_unchecked_tx(&tx.hash).await?;
                }
            }
        }

        Ok(())
    }

    /// Checks a transaction for settlement related transfers and notifies
    /// the connector about each one that credits this instance's account.
    /// Returns whether the transaction is now fully checked.
    async fn process_transaction(&self, tx: &Transaction) -> bool {
        // Only check newly seen transactions
        match self.store.was_tx_checked(&tx.hash).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(_) => return false,
        }

        let mut successfully_checked = true;
        for transfer in tx.transfers() {
            // Settlement related transfers have a pre-established description
            if transfer.description != SETTLEMENT_DESCRIPTION {
                continue;
            }
            let settlement_account_id = match self
                .store
                .load_settlement_account(&transfer.src_account_id)
                .await
            {
                Ok(settlement_account_id) => settlement_account_id,
                Err(_) => {
                    successfully_checked = false;
                    break;
                }
            };
            // A known peer as the source, our own account as the destination
            // and a matching asset mean the transfer was part of a
            // settlement with this instance as the recipient
            if let Some(settlement_account_id) = settlement_account_id {
                if transfer.dest_account_id == self.iroha_client.account_id()
                    && transfer.asset_id == self.asset_id
                {
                    if self
                        .notify_connector(&settlement_account_id, &transfer.amount, &tx.hash)
                        .await
                        .is_err()
                    {
                        // We encountered errors, so we mark the transaction
                        // as unchecked and skip its remaining commands
                        successfully_checked = false;
                        break;
                    }
                }
            }
        }

        if successfully_checked {
            self.store.save_checked_tx(&tx.hash).await.is_ok()
        } else {
            let _ = self.store.save_unchecked_tx(&tx.hash).await;
            false
        }
    }

    async fn notify_connector(
        &self,
        settlement_account_id: &str,
        amount: &str,
        tx_hash: &str,
    ) -> Result<(), ()> {
        let mut url = self.connector_url.clone();
        url.path_segments_mut()
            .expect("Invalid connector URL")
            .push("accounts")
            .push(settlement_account_id)
            .push("settlements");

        info!(
            "Notifying connector of new settlement on settlement account {} for an amount of {} (transaction {})",
            settlement_account_id, amount, tx_hash
        );

        let client = RequestClient::new();
        let quantity = Quantity::new(amount, self.asset_scale);
        let ret = self
            .connector_backoff
            .retry(|| {
                let client = client.clone();
                let url = url.clone();
                let quantity = quantity.clone();
                async move {
                    let response = client
                        .post(url.as_str())
                        .header(
                            "Idempotency-Key",
                            Uuid::new_v4().to_hyphenated().to_string(),
                        )
                        .json(&quantity)
                        .send()
                        .await
                        .map_err(|err| format!("{:?}", err))?;
                    if response.status().is_success() {
                        Ok(response)
                    } else {
                        Err(format!("connector responded with {}", response.status()))
                    }
                }
            })
            .await
            .map_err(|err| {
                error!(
                    "Exceeded max retries when notifying connector about settlement account {} for amount {} and transaction hash {}: {}",
                    settlement_account_id, amount, tx_hash, err
                )
            })?;
        trace!("Connector responded with {:?}", ret.status());
        Ok(())
    }
}

#[async_trait]
impl<S, C> SettlementEngine for IrohaLedgerSettlementEngine<S, C>
where
    S: IrohaStore
        + LeftoversStore<AccountId = String, AssetType = BigUint>
        + IdempotentStore
        + Clone
        + Send
        + Sync
        + 'static,
    C: IrohaClient + Send + Sync + 'static,
{
    /// Corresponds to the `POST /accounts` endpoint. Sends a payment details
    /// request through OUR connector, which forwards it to the peer's
    /// connector and in turn to the peer's settlement engine; the response
    /// carries the peer's Iroha account id, which is saved for later
    /// settlements. Setting up an account whose peer is already known is a
    /// no-op.
    async fn create_account(&self, account_id: String) -> Result<ApiResponse, ApiError> {
        info!("POST /accounts {{ id: {} }}", account_id);

        let existing = self.store.load_peer_account(&account_id).await.map_err(|_| {
            ApiError::internal_server_error().detail("Couldn't connect to store")
        })?;
        if existing.is_some() {
            return Ok((StatusCode::CREATED, Bytes::new()));
        }

        let payment_details_request = PaymentDetailsMessage {
            iroha_account_id: self.iroha_client.account_id().to_string(),
        };
        let body = serde_json::to_vec(&payment_details_request).unwrap();

        let mut url = self.connector_url.clone();
        url.path_segments_mut()
            .expect("Invalid connector URL")
            .push("accounts")
            .push(&account_id)
            .push("messages");
        debug!("Requesting payment details via {}", url);

        let client = RequestClient::new();
        let response = self
            .connector_backoff
            .retry(|| {
                let client = client.clone();
                let url = url.clone();
                let body = body.clone();
                async move {
                    let response = client
                        .post(url.as_str())
                        .header("Content-Type", "application/octet-stream")
                        .header(
                            "Idempotency-Key",
                            Uuid::new_v4().to_hyphenated().to_string(),
                        )
                        .body(body)
                        .send()
                        .await
                        .map_err(|err| format!("{:?}", err))?;
                    if response.status().is_success() {
                        Ok(response)
                    } else {
                        Err(format!("connector responded with {}", response.status()))
                    }
                }
            })
            .await
            .map_err(|err| {
                let err = format!("Couldn't exchange payment details with peer: {}", err);
                error!("{}", err);
                ApiError::internal_server_error().detail(err)
            })?;

        let payment_details = parse_body_into_payment_details(response).await?;
        self.store
            .save_peer_account(&account_id, &payment_details.iroha_account_id)
            .await
            .map_err(|_| {
                ApiError::internal_server_error().detail("Couldn't save peer Iroha account id")
            })?;

        info!(
            "Got peer's Iroha account id ({}) corresponding to settlement account {}",
            payment_details.iroha_account_id, account_id
        );
        Ok((StatusCode::CREATED, Bytes::new()))
    }

    /// Corresponds to the `DELETE /accounts/:id` endpoint.
    async fn delete_account(&self, account_id: String) -> Result<ApiResponse, ApiError> {
        info!("DELETE /accounts/{}", account_id);

        let exists = self
            .store
            .exists_settlement_account(&account_id)
            .await
            .map_err(|_| {
                ApiError::internal_server_error().detail("Couldn't connect to store")
            })?;
        if !exists {
            let error_msg = format!("No settlement account to delete: {}", account_id);
            error!("{}", error_msg);
            return Err(ApiError::internal_server_error().detail(error_msg));
        }

        self.store
            .clear_uncredited_settlement_amount(account_id.clone())
            .await
            .map_err(|err| {
                error!("Couldn't clear uncredited settlement amount: {}", err);
                ApiError::internal_server_error()
            })?;
        self.store
            .delete_settlement_account(&account_id)
            .await
            .map_err(|_| {
                let error_msg = "Couldn't delete settlement account".to_string();
                error!("{}", error_msg);
                ApiError::internal_server_error()
            })?;

        Ok((StatusCode::NO_CONTENT, Bytes::new()))
    }

    /// Corresponds to the `POST /accounts/:id/settlements` endpoint. Performs
    /// an Iroha transfer of the requested amount (converted to the engine's
    /// asset scale, together with any pre-existing leftovers) to the peer's
    /// Iroha account.
    ///
    /// The whole operation runs under a single lock so that two concurrent
    /// deliveries of the same idempotency key produce exactly one ledger
    /// transfer and leftover arithmetic stays serialized. The request status
    /// is only recorded once the transfer has been committed; on any earlier
    /// failure the connector's retry re-executes the settlement.
    async fn send_money(
        &self,
        account_id: String,
        idempotency_key: String,
        quantity: Quantity,
    ) -> Result<ApiResponse, ApiError> {
        info!(
            "POST /accounts/{}/settlements {{ Idempotency-Key: {} }}",
            account_id, idempotency_key
        );
        let engine_scale = self.asset_scale;
        let _guard = self.settle_lock.lock().await;

        if let Some(status) = self
            .store
            .load_request_status(idempotency_key.clone())
            .await
            .map_err(ApiError::from)?
        {
            debug!(
                "Skipping settlement request {} as it was already processed before",
                idempotency_key
            );
            return Ok((status, Bytes::new()));
        }

        let peer_iroha_account_id = self
            .store
            .load_peer_account(&account_id)
            .await
            .map_err(|_| ApiError::internal_server_error().detail("Couldn't connect to store"))?
            .ok_or_else(|| {
                let error_msg = format!(
                    "No peer Iroha account id for settlement account {}; was the account set up?",
                    account_id
                );
                error!("{}", error_msg);
                ApiError::internal_server_error().detail(error_msg)
            })?;

        let amount_from_connector = BigUint::from_str(&quantity.amount).map_err(|err| {
            let error_msg = format!("Error converting to BigUint {:?}", err);
            error!("{}", error_msg);
            ApiError::conversion_error().detail(error_msg)
        })?;

        // Pick up the leftovers of earlier settlements at the connector's
        // scale before converting, so that accumulated sub-unit amounts can
        // make it onto the ledger as soon as they add up to a whole unit.
        // The store is not written here: if the transfer below fails, the
        // stored leftovers must remain exactly as they were.
        let (leftover_amount, leftover_scale) = self
            .store
            .get_uncredited_settlement_amount(account_id.clone())
            .await
            .map_err(ApiError::from)?;
        let (uncredited_settlement_amount, leftover_residue) =
            scale_with_precision_loss(leftover_amount, quantity.scale, leftover_scale);
        let (amount, precision_loss) = scale_with_precision_loss(
            amount_from_connector + uncredited_settlement_amount,
            engine_scale,
            quantity.scale,
        );

        if !amount.is_zero() {
            debug!(
                "Performing settlement on settlement account {} (from Iroha account {} to Iroha account {}) for an amount of {}",
                account_id,
                self.iroha_client.account_id(),
                peer_iroha_account_id,
                amount
            );
            let amount = amount.to_string();
            // 1s, 2s, 4s, ... between attempts
            let retry_strategy = ExponentialBackoff::from_millis(2)
                .factor(500)
                .take(MAX_ATTEMPTS - 1);
            Retry::spawn(retry_strategy, || {
                self.iroha_client.transfer_asset(
                    &peer_iroha_account_id,
                    &self.asset_id,
                    SETTLEMENT_DESCRIPTION,
                    &amount,
                )
            })
            .await
            .map_err(|err| {
                error!("Could not send transfer command to Iroha: {}", err);
                ApiError::from(err)
            })?;
        }

        // The transfer is committed: replace the stored leftovers with the
        // residue of the pick-up plus the precision loss of this settlement,
        // then persist the status of the request
        let leftovers = merge_leftovers(
            (leftover_residue, cmp::max(quantity.scale, leftover_scale)),
            (precision_loss, quantity.scale),
        );
        self.store
            .save_uncredited_settlement_amount(account_id, leftovers)
            .await
            .map_err(ApiError::from)?;
        self.store
            .save_request_status(idempotency_key, StatusCode::CREATED)
            .await
            .map_err(ApiError::from)?;

        Ok((StatusCode::CREATED, Bytes::new()))
    }

    /// Corresponds to the `POST /accounts/:id/messages` endpoint. The body is
    /// the peer engine's payment details message; we save the peer's Iroha
    /// account id and respond with our own.
    async fn receive_message(
        &self,
        account_id: String,
        message: Vec<u8>,
    ) -> Result<ApiResponse, ApiError> {
        info!("POST /accounts/{}/messages", account_id);

        if let Ok(payment_details_request) =
            serde_json::from_slice::<PaymentDetailsMessage>(&message)
        {
            self.store
                .save_peer_account(&account_id, &payment_details_request.iroha_account_id)
                .await
                .map_err(|_| {
                    ApiError::internal_server_error().detail("Couldn't save peer Iroha account id")
                })?;
            info!(
                "Got peer's Iroha account id ({}) corresponding to settlement account {}",
                payment_details_request.iroha_account_id, account_id
            );

            let payment_details_response = PaymentDetailsMessage {
                iroha_account_id: self.iroha_client.account_id().to_string(),
            };
            Ok((
                StatusCode::CREATED,
                Bytes::from(serde_json::to_vec(&payment_details_response).unwrap()),
            ))
        } else {
            let error_msg = "Only payment details messages are accepted via the messages endpoint";
            error!("{}", error_msg);
            Err(ApiError::internal_server_error().detail(error_msg))
        }
    }
}

async fn parse_body_into_payment_details(
    resp: HttpResponse,
) -> Result<PaymentDetailsMessage, ApiError> {
    let body = resp.bytes().await.map_err(|err| {
        let err = format!("Couldn't retrieve body {:?}", err);
        error!("{}", err);
        ApiError::internal_server_error().detail(err)
    })?;
    serde_json::from_slice::<PaymentDetailsMessage>(&body).map_err(|err| {
        let err = format!(
            "Couldn't parse body {:?} into payment details {:?}",
            body, err
        );
        error!("{}", err);
        ApiError::internal_server_error().detail(err)
    })
}
