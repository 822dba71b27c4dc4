// Request body validation.
//
// `ValidatedJson<T>` turns axum's plain-text JSON rejections into structured
// `RelayError` bodies, and an oversized body into PAYLOAD_TOO_LARGE.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;

use crate::error::{ErrorCode, RelayError};

/// Maximum REST request body in bytes (1 MiB). Update blobs for a parcel's
/// whole note history fit comfortably.
pub const MAX_REST_BODY_BYTES: usize = 1024 * 1024;

/// A JSON body extractor that returns structured `RelayError` on failure.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidatedJson(value)),
            Err(rejection) => {
                let (code, message, details) = classify_json_rejection(&rejection);
                Err(RelayError::new(code, message).with_details(details).into_response())
            }
        }
    }
}

fn classify_json_rejection(rejection: &JsonRejection) -> (ErrorCode, String, serde_json::Value) {
    match rejection {
        JsonRejection::JsonDataError(e) => (
            ErrorCode::ValidationFailed,
            format!("invalid JSON payload: {e}"),
            serde_json::json!({ "kind": "data_error" }),
        ),
        JsonRejection::JsonSyntaxError(e) => (
            ErrorCode::ValidationFailed,
            format!("malformed JSON: {e}"),
            serde_json::json!({ "kind": "syntax_error" }),
        ),
        JsonRejection::MissingJsonContentType(_) => (
            ErrorCode::ValidationFailed,
            "expected Content-Type: application/json".to_string(),
            serde_json::json!({ "kind": "missing_content_type" }),
        ),
        JsonRejection::BytesRejection(e) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => (
            ErrorCode::PayloadTooLarge,
            format!("request body exceeds {MAX_REST_BODY_BYTES} bytes: {e}"),
            serde_json::json!({ "kind": "too_large", "limit_bytes": MAX_REST_BODY_BYTES }),
        ),
        JsonRejection::BytesRejection(e) => (
            ErrorCode::ValidationFailed,
            format!("request body error: {e}"),
            serde_json::json!({ "kind": "body_error" }),
        ),
        other => (
            ErrorCode::ValidationFailed,
            format!("request body error: {other}"),
            serde_json::json!({ "kind": "unknown" }),
        ),
    }
}
