use crate::error::{ApiError, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The status code and body returned to the connector by an engine operation.
pub type ApiResponse = (StatusCode, Bytes);

/// The JSON body of a settlement request or notification.
///
/// The amount is unscaled and always serialized as a string because the
/// connector does not accept JSON numbers for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Quantity {
    pub amount: String,
    pub scale: u8,
}

impl Quantity {
    pub fn new(amount: impl ToString, scale: u8) -> Self {
        Quantity {
            amount: amount.to_string(),
            scale,
        }
    }
}

/// The body of the connector's account setup request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementAccount {
    pub id: String,
}

/// Trait consumed by the settlement engine HTTP API. Every settlement engine
/// must implement this trait so that it can be exposed over the API.
#[async_trait]
pub trait SettlementEngine {
    /// Called when the connector sets up a settlement account. Responsible
    /// for exchanging ledger identities with the peer's engine.
    async fn create_account(&self, account_id: String) -> Result<ApiResponse, ApiError>;

    /// Called when the connector tears an account down.
    async fn delete_account(&self, account_id: String) -> Result<ApiResponse, ApiError>;

    /// Called to settle an amount of `quantity.scale` scaled units on behalf
    /// of the given account. Requests carrying an already-processed
    /// idempotency key must be answered with the recorded status and produce
    /// no further ledger effects.
    async fn send_money(
        &self,
        account_id: String,
        idempotency_key: String,
        quantity: Quantity,
    ) -> Result<ApiResponse, ApiError>;

    /// Called with an opaque message from the peer's settlement engine,
    /// forwarded by the connector. Returns the bytes to relay back.
    async fn receive_message(
        &self,
        account_id: String,
        message: Vec<u8>,
    ) -> Result<ApiResponse, ApiError>;
}

/// Idempotency ledger: one status per idempotency key, written exactly once
/// after the corresponding ledger effect has been driven to completion.
#[async_trait]
pub trait IdempotentStore {
    async fn load_request_status(
        &self,
        idempotency_key: String,
    ) -> Result<Option<StatusCode>, StoreError>;

    async fn save_request_status(
        &self,
        idempotency_key: String,
        status: StatusCode,
    ) -> Result<(), StoreError>;
}

/// Store for the value which could not be settled on the ledger due to
/// precision loss, kept per account until a later settlement can consume it.
///
/// Reads never modify the stored value; the settlement path reads the
/// leftovers, folds them into the amount it is settling and only overwrites
/// them once the ledger transfer has committed. A failed settlement must
/// leave the stored leftovers exactly as they were.
#[async_trait]
pub trait LeftoversStore {
    type AccountId;
    type AssetType;

    /// Overwrites the stored leftovers with the given amount and scale.
    async fn save_uncredited_settlement_amount(
        &self,
        account_id: Self::AccountId,
        uncredited_settlement_amount: (Self::AssetType, u8),
    ) -> Result<(), StoreError>;

    /// Returns the stored leftovers along with their scale.
    async fn get_uncredited_settlement_amount(
        &self,
        account_id: Self::AccountId,
    ) -> Result<(Self::AssetType, u8), StoreError>;

    async fn clear_uncredited_settlement_amount(
        &self,
        account_id: Self::AccountId,
    ) -> Result<(), StoreError>;
}

/// Conversion between two asset scales.
pub struct ConvertDetails {
    pub from: u8,
    pub to: u8,
}

/// Scale normalization for unsigned big integers. Scaling up multiplies by a
/// power of ten and is lossless; scaling down divides and truncates toward
/// zero.
pub trait Convert {
    type Item: Sized;

    fn normalize_scale(&self, details: ConvertDetails) -> Self::Item;
}

impl Convert for BigUint {
    type Item = BigUint;

    fn normalize_scale(&self, details: ConvertDetails) -> BigUint {
        let scale_diff = if details.from > details.to {
            details.from - details.to
        } else {
            details.to - details.from
        };
        let scale = BigUint::from(10u8).pow(scale_diff as u32);
        if details.to >= details.from {
            self * scale
        } else {
            self / scale
        }
    }
}

/// Converts `amount` from `remote_scale` to `local_scale`, returning the
/// converted amount at the local scale together with the value which is not
/// representable at the local scale, expressed at the remote scale.
///
/// Truncation is always toward zero: settling more than the connector asked
/// for would be a correctness violation, so no rounding up ever happens. The
/// results satisfy `scaled * 10^(remote - local) + precision_loss == amount`
/// whenever the remote scale is the finer one.
pub fn scale_with_precision_loss(
    amount: BigUint,
    local_scale: u8,
    remote_scale: u8,
) -> (BigUint, BigUint) {
    let scaled = amount.normalize_scale(ConvertDetails {
        from: remote_scale,
        to: local_scale,
    });

    if local_scale < remote_scale {
        // scale back up to compare against the original amount; the
        // difference is the truncated low-order digits
        let upscaled = scaled.normalize_scale(ConvertDetails {
            from: local_scale,
            to: remote_scale,
        });
        let precision_loss = amount - upscaled;
        (scaled, precision_loss)
    } else {
        (scaled, Zero::zero())
    }
}

/// Folds new leftovers into existing ones, converting both to the finer of
/// the two scales so that no value is lost.
pub fn merge_leftovers(existing: (BigUint, u8), incoming: (BigUint, u8)) -> (BigUint, u8) {
    let (existing_amount, existing_scale) = existing;
    let (incoming_amount, incoming_scale) = incoming;
    match existing_scale.cmp(&incoming_scale) {
        Ordering::Greater => (
            existing_amount
                + incoming_amount.normalize_scale(ConvertDetails {
                    from: incoming_scale,
                    to: existing_scale,
                }),
            existing_scale,
        ),
        Ordering::Equal => (existing_amount + incoming_amount, existing_scale),
        Ordering::Less => (
            existing_amount.normalize_scale(ConvertDetails {
                from: existing_scale,
                to: incoming_scale,
            }) + incoming_amount,
            incoming_scale,
        ),
    }
}
