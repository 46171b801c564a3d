//! Transport error mapping. This is the only place domain errors become
//! HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use almanac_core::{Error, ErrorKind};
use tracing::error;

pub struct ApiError(pub Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Conflict
            | ErrorKind::TransientNetwork
            | ErrorKind::Cancelled
            | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(kind = self.0.kind().as_str(), error = %self.0, "request failed");
        }
        let body = serde_json::json!({
            "error": self.0.message(),
            "kind": self.0.kind().as_str(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}
