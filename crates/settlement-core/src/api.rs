use crate::error::ApiError;
use crate::types::{Quantity, SettlementAccount, SettlementEngine};
use bytes::Bytes;
use http::StatusCode;
use log::error;
use std::convert::Infallible;
use warp::http::Response;
use warp::{self, Filter, Rejection, Reply};

/// # Settlement Engine API
///
/// Exposes the settlement related endpoints called by the connector, as
/// described in RFC536. The engine decides the response status of every
/// operation; this layer only does routing, extraction and error rendering.
///
/// - `POST /accounts` with a `SettlementAccount` JSON body
/// - `DELETE /accounts/:id`
/// - `POST /accounts/:id/settlements` with a `Quantity` JSON body and a
///   mandatory `Idempotency-Key` header
/// - `POST /accounts/:id/messages` with an opaque bytes body
pub fn create_settlement_engine_filter<E>(
    engine: E,
) -> warp::filters::BoxedFilter<(impl warp::Reply,)>
where
    E: SettlementEngine + Clone + Send + Sync + 'static,
{
    let with_engine = warp::any().map(move || engine.clone()).boxed();
    let account_id = warp::path("accounts").and(warp::path::param::<String>());

    // POST /accounts
    let accounts = warp::post()
        .and(warp::path("accounts"))
        .and(warp::path::end())
        .and(warp::body::json())
        .and(with_engine.clone())
        .and_then(|account: SettlementAccount, engine: E| async move {
            let (status, body) = engine
                .create_account(account.id)
                .await
                .map_err(warp::reject::custom)?;
            Ok::<_, Rejection>(Response::builder().status(status).body(body).unwrap())
        });

    // DELETE /accounts/:account_id
    let delete_account = warp::delete()
        .and(account_id)
        .and(warp::path::end())
        .and(with_engine.clone())
        .and_then(|id: String, engine: E| async move {
            let (status, body) = engine
                .delete_account(id)
                .await
                .map_err(warp::reject::custom)?;
            Ok::<_, Rejection>(Response::builder().status(status).body(body).unwrap())
        });

    // POST /accounts/:account_id/settlements (mandatory idempotency-key header)
    let settlements = warp::post()
        .and(account_id)
        .and(warp::path("settlements"))
        .and(warp::path::end())
        .and(warp::header::<String>("idempotency-key"))
        .and(warp::body::json())
        .and(with_engine.clone())
        .and_then(
            |id: String, idempotency_key: String, quantity: Quantity, engine: E| async move {
                let (status, body) = engine
                    .send_money(id, idempotency_key, quantity)
                    .await
                    .map_err(warp::reject::custom)?;
                Ok::<_, Rejection>(Response::builder().status(status).body(body).unwrap())
            },
        );

    // POST /accounts/:account_id/messages
    let messages = warp::post()
        .and(account_id)
        .and(warp::path("messages"))
        .and(warp::path::end())
        .and(warp::body::bytes())
        .and(with_engine)
        .and_then(|id: String, body: Bytes, engine: E| async move {
            let (status, message) = engine
                .receive_message(id, body.to_vec())
                .await
                .map_err(warp::reject::custom)?;
            Ok::<_, Rejection>(
                Response::builder()
                    .status(status)
                    .header("Content-Type", "application/octet-stream")
                    .body(message)
                    .unwrap(),
            )
        });

    accounts
        .or(delete_account)
        .or(settlements)
        .or(messages)
        .recover(handle_rejection)
        .boxed()
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, detail) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not Found".to_string())
    } else if let Some(api_error) = err.find::<ApiError>() {
        (
            api_error.status,
            api_error
                .detail
                .clone()
                .unwrap_or_else(|| api_error.title.to_string()),
        )
    } else if err.find::<warp::reject::MissingHeader>().is_some()
        || err.find::<warp::body::BodyDeserializeError>().is_some()
    {
        // the connector protocol only knows 201/204/500; a request we cannot
        // parse fails the same way a malformed message body does
        (StatusCode::INTERNAL_SERVER_ERROR, "Invalid request".to_string())
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Unhandled rejection".to_string(),
        )
    };
    Ok(warp::reply::with_status(detail, status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ApiResponse;
    use async_trait::async_trait;
    use serde_json::json;

    static IDEMPOTENCY: &str = "df2b6b92-2a85-44c0-b9a2-51c6b1d73c10";

    #[derive(Clone)]
    struct TestEngine;

    #[async_trait]
    impl SettlementEngine for TestEngine {
        async fn create_account(&self, _account_id: String) -> Result<ApiResponse, ApiError> {
            Ok((StatusCode::CREATED, Bytes::from("CREATED")))
        }

        async fn delete_account(&self, _account_id: String) -> Result<ApiResponse, ApiError> {
            Ok((StatusCode::NO_CONTENT, Bytes::new()))
        }

        async fn send_money(
            &self,
            _account_id: String,
            _idempotency_key: String,
            _quantity: Quantity,
        ) -> Result<ApiResponse, ApiError> {
            Ok((StatusCode::CREATED, Bytes::from("OK")))
        }

        async fn receive_message(
            &self,
            _account_id: String,
            message: Vec<u8>,
        ) -> Result<ApiResponse, ApiError> {
            Ok((StatusCode::CREATED, Bytes::from(message)))
        }
    }

    #[derive(Clone)]
    struct FailingEngine;

    #[async_trait]
    impl SettlementEngine for FailingEngine {
        async fn create_account(&self, _account_id: String) -> Result<ApiResponse, ApiError> {
            Err(ApiError::internal_server_error().detail("engine is down"))
        }

        async fn delete_account(&self, _account_id: String) -> Result<ApiResponse, ApiError> {
            Err(ApiError::internal_server_error())
        }

        async fn send_money(
            &self,
            _account_id: String,
            _idempotency_key: String,
            _quantity: Quantity,
        ) -> Result<ApiResponse, ApiError> {
            Err(ApiError::internal_server_error())
        }

        async fn receive_message(
            &self,
            _account_id: String,
            _message: Vec<u8>,
        ) -> Result<ApiResponse, ApiError> {
            Err(ApiError::internal_server_error())
        }
    }

    #[tokio::test]
    async fn creates_account() {
        let api = create_settlement_engine_filter(TestEngine);
        let ret = warp::test::request()
            .method("POST")
            .path("/accounts")
            .body(json!({ "id": "1" }).to_string())
            .reply(&api)
            .await;
        assert_eq!(ret.status(), StatusCode::CREATED);
        assert_eq!(ret.body(), "CREATED");
    }

    #[tokio::test]
    async fn deletes_account() {
        let api = create_settlement_engine_filter(TestEngine);
        let ret = warp::test::request()
            .method("DELETE")
            .path("/accounts/1")
            .reply(&api)
            .await;
        assert_eq!(ret.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn executes_settlement() {
        let api = create_settlement_engine_filter(TestEngine);
        let ret = warp::test::request()
            .method("POST")
            .path("/accounts/1/settlements")
            .header("Idempotency-Key", IDEMPOTENCY)
            .body(json!(Quantity::new(100u32, 6)).to_string())
            .reply(&api)
            .await;
        assert_eq!(ret.status(), StatusCode::CREATED);
        assert_eq!(ret.body(), "OK");
    }

    #[tokio::test]
    async fn settlement_requires_idempotency_key() {
        let api = create_settlement_engine_filter(TestEngine);
        let ret = warp::test::request()
            .method("POST")
            .path("/accounts/1/settlements")
            .body(json!(Quantity::new(100u32, 6)).to_string())
            .reply(&api)
            .await;
        assert_eq!(ret.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn relays_messages_as_octet_stream() {
        let api = create_settlement_engine_filter(TestEngine);
        let ret = warp::test::request()
            .method("POST")
            .path("/accounts/1/messages")
            .body(vec![0, 1, 2])
            .reply(&api)
            .await;
        assert_eq!(ret.status(), StatusCode::CREATED);
        assert_eq!(
            ret.headers().get("content-type").unwrap(),
            "application/octet-stream"
        );
        assert_eq!(ret.body().as_ref(), &[0, 1, 2][..]);
    }

    #[tokio::test]
    async fn renders_engine_errors_with_their_status() {
        let api = create_settlement_engine_filter(FailingEngine);
        let ret = warp::test::request()
            .method("POST")
            .path("/accounts")
            .body(json!({ "id": "1" }).to_string())
            .reply(&api)
            .await;
        assert_eq!(ret.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ret.body(), "engine is down");
    }
}
