//! Core domain models and strongly-typed identifiers.
//!
//! Defines queued messages, their delivery status, and the small value types
//! shared by the store, the delivery engine, and the HTTP layer. Includes
//! database serialization traits so the repository can bind and decode these
//! types directly.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed message identifier.
///
/// Wraps the ordinal primary key assigned by the database so it cannot be
/// confused with page numbers or counts.
///
/// # Example
///
/// ```
/// use courier_core::models::MessageId;
/// let id = MessageId(42);
/// assert_eq!(id.to_string(), "42");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl FromStr for MessageId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(Self)
            .map_err(|_| CoreError::InvalidInput("invalid message id".to_string()))
    }
}

impl sqlx::Type<PgDb> for MessageId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for MessageId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let id = <i64 as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for MessageId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Message delivery status.
///
/// Messages enter as `Pending`, leave a scheduler pass as either `Sent` or
/// `Failed`, and only return to `Pending` through an explicit replay of a
/// `Failed` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting to be picked up by a scheduler pass.
    Pending,

    /// Accepted by the downstream endpoint.
    ///
    /// Terminal. Carries the delivery identifier and sent timestamp.
    Sent,

    /// Delivery attempt failed or was force-failed.
    ///
    /// Eligible for replay.
    Failed,
}

impl MessageStatus {
    /// Returns the database representation of this status.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            _ => Err(CoreError::InvalidInput(format!("invalid message status: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for MessageStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as sqlx::Type<PgDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for MessageStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(|e: CoreError| e.to_string().into())
    }
}

/// A queued outbound message.
///
/// The delivery identifier and sent timestamp are present exactly when the
/// status is [`MessageStatus::Sent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Database identifier.
    pub id: MessageId,
    /// Text to deliver.
    pub content: String,
    /// Destination address.
    pub phone_number: String,
    /// Current delivery status.
    pub status: MessageStatus,
    /// Identifier assigned by the downstream endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// When the downstream endpoint accepted the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Returns true if the sent-state fields agree with the status.
    pub fn is_consistent(&self) -> bool {
        let has_receipt = self.message_id.is_some() && self.sent_at.is_some();
        let has_any_receipt = self.message_id.is_some() || self.sent_at.is_some();
        match self.status {
            MessageStatus::Sent => has_receipt,
            MessageStatus::Pending | MessageStatus::Failed => !has_any_receipt,
        }
    }
}

/// Delivery receipt stored in the cache after a confirmed send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessageCache {
    /// Identifier assigned by the downstream endpoint.
    pub message_id: String,
    /// Time the send was confirmed.
    pub sent_at: DateTime<Utc>,
}

/// Message counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStats {
    /// Messages waiting for delivery.
    pub pending: i64,
    /// Messages accepted downstream.
    pub sent: i64,
    /// Messages that failed delivery.
    pub failed: i64,
    /// Sum of all statuses.
    pub total: i64,
}

impl MessageStats {
    /// Builds stats from per-status counts.
    pub fn new(pending: i64, sent: i64, failed: i64) -> Self {
        Self { pending, sent, failed, total: pending + sent + failed }
    }
}

/// Default page number for list queries.
pub const DEFAULT_PAGE: u32 = 1;

/// Default page size for list queries.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Largest page size a caller may request.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Validated pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    page: u32,
    page_size: u32,
}

impl PageRequest {
    /// Creates a page request, rejecting out-of-range values.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if `page` is zero or `page_size` is
    /// outside `1..=MAX_PAGE_SIZE`.
    pub fn new(page: u32, page_size: u32) -> Result<Self, CoreError> {
        if page == 0 {
            return Err(CoreError::InvalidInput("page must be a positive integer".to_string()));
        }
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(CoreError::InvalidInput(format!(
                "pageSize must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok(Self { page, page_size })
    }

    /// 1-based page number.
    pub fn page(&self) -> u32 {
        self.page
    }

    /// Number of rows per page.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Row offset for SQL `OFFSET`.
    pub fn offset(&self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.page_size)
    }

    /// Row limit for SQL `LIMIT`.
    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }

    /// Number of pages needed to show `total` rows.
    pub fn total_pages(&self, total: i64) -> i64 {
        if total <= 0 {
            return 0;
        }
        let size = i64::from(self.page_size);
        (total + size - 1) / size
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: DEFAULT_PAGE, page_size: DEFAULT_PAGE_SIZE }
    }
}

/// A page of results together with the unpaged total.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    /// Rows on this page.
    pub items: Vec<T>,
    /// Window that produced this page.
    pub request: PageRequest,
    /// Total rows across all pages.
    pub total_count: i64,
}
