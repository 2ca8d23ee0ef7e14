use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use blogwire_storage::StoreError;
use serde_json::json;
use tracing::error;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(&'static str),
    Forbidden(&'static str),
    NotFound(&'static str),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(msg) | StoreError::Conflict(msg) => Self::BadRequest(msg),
            StoreError::NotFound(_) => Self::NotFound("Not found."),
            err @ StoreError::DuplicateUrl(_) => Self::BadRequest(err.to_string()),
            StoreError::ReadOnly(_) => Self::Forbidden("Scraped articles are read-only."),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            Self::BadRequest(msg) => msg,
            Self::Unauthorized(msg) | Self::Forbidden(msg) | Self::NotFound(msg) => msg.to_string(),
            Self::Internal(detail) => {
                error!(error = %detail, "request failed");
                "Internal server error.".to_string()
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
