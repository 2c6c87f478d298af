//! JSON response envelope shared by every endpoint.
//!
//! Success bodies look like `{"success": true, "message"?, "data"?}`, errors
//! like `{"success": false, "error": "..."}` and paginated lists carry
//! `page`, `pageSize`, `totalCount` and `totalPages` next to `data`.

use std::collections::BTreeMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_core::models::Page;
use courier_delivery::{DeliveryError, ErrorCategory};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Successful response body.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// Always true.
    pub success: bool,
    /// Optional human readable message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Optional payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    /// 200 with data.
    pub fn ok(data: T) -> Response {
        Self::with_status(StatusCode::OK, None, data)
    }

    /// 200 with a message and data.
    pub fn ok_with_message(message: impl Into<String>, data: T) -> Response {
        Self::with_status(StatusCode::OK, Some(message.into()), data)
    }

    /// 201 with a message and the created resource.
    pub fn created(message: impl Into<String>, data: T) -> Response {
        Self::with_status(StatusCode::CREATED, Some(message.into()), data)
    }

    fn with_status(status: StatusCode, message: Option<String>, data: T) -> Response {
        (status, Json(Self { success: true, message, data: Some(data) })).into_response()
    }
}

/// Paginated list body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedResponse<T> {
    /// Always true.
    pub success: bool,
    /// Rows on this page.
    pub data: Vec<T>,
    /// 1-based page number.
    pub page: u32,
    /// Rows per page.
    pub page_size: u32,
    /// Rows across all pages.
    pub total_count: i64,
    /// Number of pages.
    pub total_pages: i64,
}

impl<T: Serialize> From<Page<T>> for PaginatedResponse<T> {
    fn from(page: Page<T>) -> Self {
        Self {
            success: true,
            total_pages: page.request.total_pages(page.total_count),
            page: page.request.page(),
            page_size: page.request.page_size(),
            total_count: page.total_count,
            data: page.items,
        }
    }
}

impl<T: Serialize> IntoResponse for PaginatedResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<BTreeMap<String, String>>,
}

/// Errors returned by handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request.
    #[error("{0}")]
    BadRequest(String),

    /// Missing or wrong API key.
    #[error("Invalid or missing API key")]
    Unauthorized,

    /// Resource absent or not eligible.
    #[error("{0}")]
    NotFound(String),

    /// Well-formed request with invalid fields.
    #[error("Validation failed")]
    Validation(BTreeMap<String, String>),

    /// Optional dependency not available.
    #[error("{0}")]
    ServiceUnavailable(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Single-field validation failure.
    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        Self::Validation(BTreeMap::from([(field.to_string(), message.into())]))
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DeliveryError> for ApiError {
    fn from(err: DeliveryError) -> Self {
        match &err {
            DeliveryError::ReplayNotFound { .. } => Self::NotFound(err.to_string()),
            DeliveryError::InvalidInput { message } => Self::BadRequest(message.clone()),
            DeliveryError::CacheNotConfigured => Self::ServiceUnavailable(err.to_string()),
            _ => {
                error!(category = %ErrorCategory::from(&err), error = %err, "request failed");
                Self::Internal(err.to_string())
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error = self.to_string();
        let details = match self {
            Self::Validation(details) => Some(details),
            _ => None,
        };
        (status, Json(ErrorBody { success: false, error, details })).into_response()
    }
}

/// Handler result type.
pub type ApiResult<T = Response> = Result<T, ApiError>;
