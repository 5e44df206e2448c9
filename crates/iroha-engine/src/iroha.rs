use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use http::StatusCode;
use ilp_settlement_core::error::ApiError;
use log::error;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::TryInto;
use std::fs;
use thiserror::Error;
use url::Url;

/// Errors observable while submitting transactions to Iroha or querying it.
/// Every variant is treated as retryable by the settlement path; the
/// submission either reaches COMMITTED or the whole request fails.
#[derive(Debug, Error)]
pub enum IrohaError {
    #[error("transaction was not received by the ledger")]
    NotReceived,

    #[error("transaction expired before being committed")]
    Expired,

    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("unrecognized transaction status: {0}")]
    UnrecognizedStatus(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed ledger response: {0}")]
    Response(#[from] serde_json::Error),
}

impl From<IrohaError> for ApiError {
    fn from(err: IrohaError) -> Self {
        error!("{}", err);
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Ledger connection error")
            .detail(err.to_string())
    }
}

/// A transfer of `amount` integer units (at the ledger's asset scale) between
/// two Iroha accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAsset {
    pub src_account_id: String,
    pub dest_account_id: String,
    pub asset_id: String,
    pub description: String,
    pub amount: String,
}

/// A single Iroha command. Only `TransferAsset` is relevant for settlement;
/// all other command kinds deserialize to an empty record and are skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_asset: Option<TransferAsset>,
}

/// A committed Iroha transaction as returned by history queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Hex hash identifying the transaction
    pub hash: String,
    #[serde(default)]
    pub commands: Vec<Command>,
}

impl Transaction {
    /// The transfer commands carried by this transaction, in order.
    pub fn transfers(&self) -> impl Iterator<Item = &TransferAsset> {
        self.commands
            .iter()
            .filter_map(|command| command.transfer_asset.as_ref())
    }
}

/// Client interface towards the Iroha ledger. The engine is generic over this
/// trait so that tests can run against an in-memory ledger.
#[async_trait]
pub trait IrohaClient {
    /// The Iroha account this engine settles from.
    fn account_id(&self) -> &str;

    /// Simple query used as a liveness and authorization probe at startup.
    async fn get_account(&self, account_id: &str) -> Result<(), IrohaError>;

    /// Submits a signed `TransferAsset` command from our account and blocks
    /// until the ledger commits it.
    async fn transfer_asset(
        &self,
        dest_account_id: &str,
        asset_id: &str,
        description: &str,
        amount: &str,
    ) -> Result<(), IrohaError>;

    /// Returns up to `page_size` committed transactions involving the given
    /// account and asset, strictly after `first_tx_hash` (oldest first when
    /// no cursor is given).
    async fn get_account_asset_transactions(
        &self,
        account_id: &str,
        asset_id: &str,
        page_size: u32,
        first_tx_hash: Option<String>,
    ) -> Result<Vec<Transaction>, IrohaError>;

    /// Fetches the given transactions by hash.
    async fn get_transactions(&self, tx_hashes: &[String]) -> Result<Vec<Transaction>, IrohaError>;
}

#[derive(Debug, Deserialize)]
struct ToriiStatusResponse {
    tx_status: String,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToriiTransactionsResponse {
    #[serde(default)]
    transactions: Vec<Transaction>,
}

/// HTTP client for Iroha's Torii endpoint. Owns this engine's Ed25519
/// keypair and signs everything it submits.
#[derive(Clone)]
pub struct ToriiClient {
    http: reqwest::Client,
    torii_url: Url,
    account_id: String,
    keypair: SigningKey,
}

impl ToriiClient {
    pub fn new(torii_url: Url, account_id: String, keypair: SigningKey) -> Self {
        ToriiClient {
            http: reqwest::Client::new(),
            torii_url,
            account_id,
            keypair,
        }
    }

    fn endpoint(&self, segment: &str) -> Url {
        let mut url = self.torii_url.clone();
        url.path_segments_mut()
            .expect("Invalid torii URL")
            .push(segment);
        url
    }

    /// Wraps a payload with our signature and public key.
    fn sign(&self, payload: serde_json::Value) -> serde_json::Value {
        let signature = self.keypair.sign(payload.to_string().as_bytes());
        json!({
            "payload": payload,
            "signature": hex::encode(signature.to_bytes()),
            "public_key": hex::encode(self.keypair.verifying_key().to_bytes()),
        })
    }

    async fn query(&self, query: serde_json::Value) -> Result<serde_json::Value, IrohaError> {
        let request = self.sign(json!({
            "creator_account_id": self.account_id,
            "query": query,
        }));
        let response = self
            .http
            .post(self.endpoint("query"))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl IrohaClient for ToriiClient {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn get_account(&self, account_id: &str) -> Result<(), IrohaError> {
        self.query(json!({ "get_account": { "account_id": account_id } }))
            .await
            .map(|_| ())
    }

    async fn transfer_asset(
        &self,
        dest_account_id: &str,
        asset_id: &str,
        description: &str,
        amount: &str,
    ) -> Result<(), IrohaError> {
        let request = self.sign(json!({
            "creator_account_id": self.account_id,
            "commands": [{
                "transfer_asset": TransferAsset {
                    src_account_id: self.account_id.clone(),
                    dest_account_id: dest_account_id.to_string(),
                    asset_id: asset_id.to_string(),
                    description: description.to_string(),
                    amount: amount.to_string(),
                },
            }],
        }));
        let response = self
            .http
            .post(self.endpoint("transaction"))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        let status: ToriiStatusResponse = response.json().await?;
        match status.tx_status.as_str() {
            "COMMITTED" => Ok(()),
            "NOT_RECEIVED" => Err(IrohaError::NotReceived),
            "MST_EXPIRED" => Err(IrohaError::Expired),
            "REJECTED" => Err(IrohaError::Rejected(
                status.error_message.unwrap_or_default(),
            )),
            other => Err(IrohaError::UnrecognizedStatus(other.to_string())),
        }
    }

    async fn get_account_asset_transactions(
        &self,
        account_id: &str,
        asset_id: &str,
        page_size: u32,
        first_tx_hash: Option<String>,
    ) -> Result<Vec<Transaction>, IrohaError> {
        let mut query = json!({
            "account_id": account_id,
            "asset_id": asset_id,
            "page_size": page_size,
        });
        if let Some(hash) = first_tx_hash {
            query["first_tx_hash"] = json!(hash);
        }
        let response = self
            .query(json!({ "get_account_asset_transactions": query }))
            .await?;
        let page: ToriiTransactionsResponse = serde_json::from_value(response)?;
        Ok(page.transactions)
    }

    async fn get_transactions(&self, tx_hashes: &[String]) -> Result<Vec<Transaction>, IrohaError> {
        let response = self
            .query(json!({ "get_transactions": { "tx_hashes": tx_hashes } }))
            .await?;
        let page: ToriiTransactionsResponse = serde_json::from_value(response)?;
        Ok(page.transactions)
    }
}

/// Errors raised while loading this engine's keypair at startup.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("could not read key file: {0}")]
    Io(#[from] std::io::Error),

    #[error("key is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("key has the wrong length")]
    Length,

    #[error("public key does not match the private key")]
    Mismatch,
}

/// Loads the hex-encoded Ed25519 keypair from `<keypair_name>.priv` and
/// `<keypair_name>.pub`, verifying that the two halves belong together.
pub fn load_keypair(keypair_name: &str) -> Result<SigningKey, KeyError> {
    let priv_hex = fs::read_to_string(format!("{}.priv", keypair_name))?;
    let pub_hex = fs::read_to_string(format!("{}.pub", keypair_name))?;

    let priv_bytes: [u8; 32] = hex::decode(priv_hex.trim())?
        .try_into()
        .map_err(|_| KeyError::Length)?;
    let pub_bytes: [u8; 32] = hex::decode(pub_hex.trim())?
        .try_into()
        .map_err(|_| KeyError::Length)?;

    let keypair = SigningKey::from_bytes(&priv_bytes);
    let public: VerifyingKey = keypair.verifying_key();
    if public.to_bytes() != pub_bytes {
        return Err(KeyError::Mismatch);
    }
    Ok(keypair)
}
