//! error taxonomy for the gateway
//!
//! transient device errors never show up here: the reader swallows them and
//! retries. what is left is what a caller can actually act on.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// why a pushed reading was refused
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rejection {
    #[error("Missing parameters t (temperature) and h (humidity)")]
    MissingFields,

    #[error("Invalid numeric format for t or h")]
    NonNumeric,

    #[error("Reading outside plausible range (-50..80 C, 0..100 %)")]
    OutOfRange,

    #[error("Unparsable timestamp")]
    InvalidTimestamp,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open sample store: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("Sample store query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Stored row {id} is unreadable: {detail}")]
    Corrupt { id: i64, detail: String },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// errors as the http layer reports them
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no data yet")]
    NoData,

    #[error(transparent)]
    Rejected(Rejection),

    #[error("Storage failure")]
    Store(#[source] StoreError),
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Rejected(r) => ApiError::Rejected(r),
            IngestError::Store(s) => ApiError::Store(s),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::NoData => (
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": self.to_string() }),
            ),
            ApiError::Rejected(reason) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": reason.to_string(), "reason": reason }),
            ),
            ApiError::Store(e) => {
                tracing::error!(error = %e, "request failed on the sample store");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": self.to_string() }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_reasons_are_kebab_case() {
        assert_eq!(serde_json::to_value(Rejection::MissingFields).unwrap(), "missing-fields");
        assert_eq!(serde_json::to_value(Rejection::NonNumeric).unwrap(), "non-numeric");
        assert_eq!(serde_json::to_value(Rejection::OutOfRange).unwrap(), "out-of-range");
    }

    #[test]
    fn status_codes() {
        assert_eq!(ApiError::NoData.into_response().status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Rejected(Rejection::OutOfRange).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        let store = ApiError::Store(StoreError::Corrupt { id: 1, detail: "x".into() });
        assert_eq!(store.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
