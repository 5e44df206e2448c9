use http::StatusCode;
use thiserror::Error;

/// Error returned by a settlement engine operation, rendered by the API as a
/// plain-text response with the corresponding status code.
#[derive(Debug, Clone, Error)]
#[error("{status} {title}")]
pub struct ApiError {
    pub status: StatusCode,
    pub title: &'static str,
    pub detail: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, title: &'static str) -> Self {
        ApiError {
            status,
            title,
            detail: None,
        }
    }

    pub fn internal_server_error() -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    }

    pub fn conversion_error() -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Conversion error")
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl warp::reject::Reject for ApiError {}

/// Error raised by a store backend. Store failures surface to the connector
/// as internal errors so that it retries with the same idempotency key.
#[derive(Debug, Clone, Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

impl From<StoreError> for ApiError {
    fn from(src: StoreError) -> Self {
        ApiError::internal_server_error().detail(src.to_string())
    }
}
