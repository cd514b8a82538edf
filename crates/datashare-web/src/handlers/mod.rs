pub mod batch;
pub mod health;

use axum::{Json, http::StatusCode, response::IntoResponse};
use datashare_common::error::DatashareError;

pub struct ApiError(pub DatashareError);

impl From<DatashareError> for ApiError {
    fn from(value: DatashareError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.0 {
            DatashareError::NotFound(_) => StatusCode::NOT_FOUND,
            DatashareError::AccessDenied(_) => StatusCode::FORBIDDEN,
            DatashareError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            DatashareError::Conflict(_) | DatashareError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            DatashareError::IndexUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DatashareError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            status,
            Json(serde_json::json!({
                "code": self.0.error_code(),
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}
