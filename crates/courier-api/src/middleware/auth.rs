//! API key authentication per route group.
//!
//! The presented key and the configured key are both reduced to SHA-256
//! digests and compared in constant time, so neither length nor content
//! leaks through response timing.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use tracing::{error, warn};

use crate::response::ApiError;

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "x-ins-auth-key";

/// Configured key for one route group.
#[derive(Clone)]
pub struct ApiKey {
    group: &'static str,
    digest: Option<Arc<[u8; 32]>>,
}

impl ApiKey {
    /// Creates the key for `group`. An empty key rejects every request.
    pub fn new(group: &'static str, key: &str) -> Self {
        let digest = (!key.is_empty()).then(|| Arc::new(digest(key)));
        Self { group, digest }
    }

    /// Route group name used in logs.
    pub fn group(&self) -> &'static str {
        self.group
    }

    /// Whether a key has been configured.
    pub fn is_configured(&self) -> bool {
        self.digest.is_some()
    }

    fn matches(&self, presented: &str) -> bool {
        self.digest.as_deref().is_some_and(|expected| constant_time_eq(expected, &digest(presented)))
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("group", &self.group)
            .field("configured", &self.is_configured())
            .finish()
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Extracts the API key from the request headers.
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()).filter(|s| !s.is_empty())
}

/// Axum middleware rejecting requests without the group's key.
///
/// # Errors
///
/// Returns 500 when the group has no key configured and 401 when the key is
/// missing or wrong.
pub async fn require_api_key(
    State(api_key): State<ApiKey>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if !api_key.is_configured() {
        error!(group = api_key.group(), "api key not configured");
        return Err(ApiError::Internal(
            "API key is not configured for this endpoint group".to_string(),
        ));
    }

    let authorized = extract_api_key(req.headers()).is_some_and(|key| api_key.matches(key));
    if !authorized {
        warn!(group = api_key.group(), path = %req.uri().path(), "rejected api key");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn extract_api_key_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("secret-key"));

        assert_eq!(extract_api_key(&headers), Some("secret-key"));
    }

    #[test]
    fn empty_header_is_missing() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static(""));

        assert_eq!(extract_api_key(&headers), None);
        assert_eq!(extract_api_key(&HeaderMap::new()), None);
    }

    #[test]
    fn key_comparison() {
        let key = ApiKey::new("messages", "secret");

        assert!(key.matches("secret"));
        assert!(!key.matches("secret "));
        assert!(!key.matches("SECRET"));
        assert!(!key.matches(""));
    }

    #[test]
    fn unconfigured_key_matches_nothing() {
        let key = ApiKey::new("scheduler", "");

        assert!(!key.is_configured());
        assert!(!key.matches(""));
        assert!(!format!("{key:?}").contains("digest"));
    }
}
