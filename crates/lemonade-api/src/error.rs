//! Error-to-response mapping.
//!
//! Handlers return `ApiResult<T>`; any gateway error becomes the structured
//! `{"error": {...}}` body with its mapped status code. Clients never see a
//! dropped connection for a server-side failure.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use lemonade_core::Error;

pub struct ApiError(pub Error);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        } else {
            tracing::debug!("request rejected: {}", self.0);
        }
        (status, Json(self.0.to_error_json())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_maps_to_400() {
        let response = ApiError(Error::validation("bad field")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_unsupported_maps_to_422() {
        let response = ApiError(Error::unsupported("Responses", "llamacpp")).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let response = ApiError(Error::model_not_found("nope")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
