use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

use tandem_types::error::{ChatError, ErrorReason};

/// `ChatError` as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ChatError);

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorReason,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ChatError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ChatError::Conflict(_) => StatusCode::CONFLICT,
            ChatError::TransientDeliveryFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::ConnectionClosed | ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Storage details stay in the log.
        let message = if status.is_server_error() {
            error!("Request failed: {}", self.0);
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        let body = ErrorBody {
            error: self.0.reason(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
