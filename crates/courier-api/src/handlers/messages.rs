//! Message endpoints under `/api/v1/messages`.

use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
};
use courier_core::{
    models::{DEFAULT_PAGE, DEFAULT_PAGE_SIZE},
    MessageId, MessageStatus, PageRequest,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument};

use super::parse_json_body;
use crate::{
    response::{ApiError, ApiResponse, ApiResult, PaginatedResponse},
    server::AppState,
};

/// Query parameters accepted by the list endpoints.
///
/// Kept as raw strings so malformed numbers get the same message as
/// out-of-range ones.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    /// Status filter.
    pub status: Option<String>,
    /// 1-based page number.
    pub page: Option<String>,
    /// Rows per page.
    pub page_size: Option<String>,
}

impl ListQuery {
    fn page_request(&self) -> Result<PageRequest, ApiError> {
        let page = parse_page_param(self.page.as_deref(), DEFAULT_PAGE)
            .ok_or_else(|| ApiError::BadRequest("page must be a positive integer".to_string()))?;
        let page_size = parse_page_param(self.page_size.as_deref(), DEFAULT_PAGE_SIZE)
            .ok_or_else(|| ApiError::BadRequest("pageSize must be between 1 and 100".to_string()))?;
        PageRequest::new(page, page_size).map_err(|e| ApiError::BadRequest(e.to_string()))
    }

    fn status_filter(&self) -> Result<Option<MessageStatus>, ApiError> {
        match self.status.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => raw
                .to_ascii_lowercase()
                .parse()
                .map(Some)
                .map_err(|e: courier_core::CoreError| ApiError::BadRequest(e.to_string())),
        }
    }
}

/// Missing or empty selects the default; anything unparsable is `None`.
fn parse_page_param(raw: Option<&str>, default: u32) -> Option<u32> {
    match raw.map(str::trim) {
        None | Some("") => Some(default),
        Some(value) => value.parse().ok(),
    }
}

/// Body of `POST /api/v1/messages`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageRequest {
    /// Message body.
    pub content: Option<String>,
    /// Recipient.
    pub phone_number: Option<String>,
}

impl CreateMessageRequest {
    fn validate(self, max_content_length: usize) -> Result<(String, String), ApiError> {
        let mut details = BTreeMap::new();
        let content = self.content.unwrap_or_default();
        let phone_number = self.phone_number.unwrap_or_default();

        if content.trim().is_empty() {
            details.insert("content".to_string(), "content is required".to_string());
        } else if content.chars().count() > max_content_length {
            details.insert(
                "content".to_string(),
                format!("content exceeds maximum length of {max_content_length} characters"),
            );
        }
        if phone_number.trim().is_empty() {
            details.insert("phoneNumber".to_string(), "phone number is required".to_string());
        }

        if details.is_empty() {
            Ok((content, phone_number))
        } else {
            Err(ApiError::Validation(details))
        }
    }
}

/// `POST /api/v1/messages`
#[instrument(name = "create_message", skip_all)]
pub async fn create_message(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let request: CreateMessageRequest = parse_json_body(&body)?.unwrap_or_default();
    let (content, phone_number) = request.validate(state.service.max_content_length())?;

    let message = state.service.create(content, phone_number).await?;
    Ok(ApiResponse::created("Message created successfully", message))
}

/// `GET /api/v1/messages`
#[instrument(name = "list_messages", skip(state))]
pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<PaginatedResponse<courier_core::Message>> {
    let status = query.status_filter()?;
    let page = query.page_request()?;

    let page = state.service.list(status, page).await?;
    Ok(PaginatedResponse::from(page))
}

/// `GET /api/v1/messages/sent`
#[instrument(name = "list_sent_messages", skip(state))]
pub async fn list_sent_messages(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<PaginatedResponse<courier_core::Message>> {
    let page = query.page_request()?;

    let page = state.service.sent(page).await?;
    Ok(PaginatedResponse::from(page))
}

/// `GET /api/v1/messages/stats`
#[instrument(name = "message_stats", skip(state))]
pub async fn message_stats(State(state): State<AppState>) -> ApiResult {
    let stats = state.service.stats().await?;
    Ok(ApiResponse::ok(stats))
}

/// `GET /api/v1/messages/cached`
#[instrument(name = "cached_messages", skip(state))]
pub async fn cached_messages(State(state): State<AppState>) -> ApiResult {
    let cached = state.service.cached().await?;
    Ok(ApiResponse::ok(cached))
}

/// `POST /api/v1/messages/replay`
#[instrument(name = "replay_all", skip(state))]
pub async fn replay_all(State(state): State<AppState>) -> ApiResult {
    let replayed = state.service.replay_all().await?;
    info!(replayed, "replayed failed messages");
    Ok(ApiResponse::ok_with_message("Failed messages replayed", json!({ "replayed": replayed })))
}

/// `POST /api/v1/messages/{id}/replay`
#[instrument(name = "replay_one", skip(state))]
pub async fn replay_one(State(state): State<AppState>, Path(raw_id): Path<String>) -> ApiResult {
    let id: MessageId = raw_id
        .parse()
        .ok()
        .filter(|id: &MessageId| id.0 > 0)
        .ok_or_else(|| ApiError::BadRequest("invalid message id".to_string()))?;

    state.service.replay_one(id).await?;
    Ok(ApiResponse::ok_with_message("Message replayed", json!({ "replayed": 1 })))
}
