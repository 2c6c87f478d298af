//! HTTP request handlers.
//!
//! Handlers are grouped by route prefix:
//! - `health` - component health for probes
//! - `messages` - message creation, listing and replay
//! - `scheduler` - start, stop and status of the delivery loop
//!
//! Bodies are read as raw bytes and decoded here so that malformed JSON
//! answers 400 while field validation answers 422, both in the standard
//! error envelope.

pub mod health;
pub mod messages;
pub mod scheduler;

use serde::de::DeserializeOwned;

pub use health::health_check;
pub use messages::{
    cached_messages, create_message, list_messages, list_sent_messages, message_stats,
    replay_all, replay_one,
};
pub use scheduler::{scheduler_status, start_scheduler, stop_scheduler};

use crate::response::ApiError;

/// Decodes an optional JSON body. Empty or whitespace-only bodies yield
/// `None`.
fn parse_json_body<T: DeserializeOwned>(body: &[u8]) -> Result<Option<T>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))
}
