//! Response envelope and error mapping.

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use pulse_core::PointError;
use pulse_store::StoreError;

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<PointError>>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            errors: None,
        })
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("batch rejected: {} invalid entries", .0.len())]
    Validation(Vec<PointError>),

    #[error("storage unavailable, retry later")]
    StorageUnavailable(#[source] StoreError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::StorageUnavailable(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        let retryable = matches!(self, ApiError::StorageUnavailable(_));
        let errors = match self {
            ApiError::Validation(errors) => Some(errors),
            _ => None,
        };
        let body = Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message),
            errors,
        });
        if retryable {
            (status, [(header::RETRY_AFTER, "1")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_retryable_503() {
        let resp = ApiError::from(StoreError::Transaction("locked".into())).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }

    #[test]
    fn validation_maps_to_400() {
        let err = ApiError::Validation(vec![PointError::at(1, "value", "value must be finite")]);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "batch rejected: 1 invalid entries");
        let resp = err.into_response();
        assert!(resp.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(ApiError::NotFound("no data".into()).status(), StatusCode::NOT_FOUND);
    }
}
