use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Maps the shared error taxonomy onto HTTP status codes for this crate's handlers (§7
/// "surfaced as validation to the API").
pub struct ApiError(pub push_common::error::PushError);

impl From<push_common::error::PushError> for ApiError {
    fn from(err: push_common::error::PushError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use push_common::error::PushError;

        let status = match &self.0 {
            PushError::Validation(_) => StatusCode::BAD_REQUEST,
            PushError::NotFound(_) => StatusCode::NOT_FOUND,
            PushError::Transient(_) | PushError::Fatal(_) | PushError::Poison(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
