//! Degradation alerts.
//!
//! When every message of a batch fails for enough consecutive passes the
//! scheduler posts a JSON summary to the configured alert endpoint. Any 2xx
//! answer counts as acknowledged.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

/// Alert kind sent when whole batches keep failing.
pub const CONSECUTIVE_ALL_FAIL: &str = "consecutive_all_fail";

/// Timeout for one alert request.
pub const ALERT_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON body posted to the alert endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    /// Alert kind.
    pub alert: String,
    /// Scheduler pass that raised the alert.
    pub run_number: u64,
    /// Length of the failure streak.
    pub consecutive_failures: u32,
    /// Size of the batch that completed the streak.
    pub messages_in_batch: usize,
    /// RFC 3339 time the alert was raised.
    pub timestamp: String,
    /// Human readable summary.
    pub message: String,
}

impl AlertPayload {
    /// Builds the payload for a run of fully failed batches.
    pub fn consecutive_all_fail(
        run_number: u64,
        consecutive_failures: u32,
        messages_in_batch: usize,
        raised_at: DateTime<Utc>,
    ) -> Self {
        Self {
            alert: CONSECUTIVE_ALL_FAIL.to_string(),
            run_number,
            consecutive_failures,
            messages_in_batch,
            timestamp: raised_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            message: format!(
                "All {messages_in_batch} messages failed for {consecutive_failures} consecutive iterations"
            ),
        }
    }
}

/// Posts alert payloads over HTTP.
#[derive(Debug, Clone)]
pub struct AlertNotifier {
    client: reqwest::Client,
}

impl AlertNotifier {
    /// Creates a notifier with the default ten second timeout.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new() -> Result<Self> {
        Self::with_timeout(ALERT_TIMEOUT)
    }

    /// Creates a notifier with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build().map_err(|e| {
            DeliveryError::configuration(format!("failed to build alert client: {e}"))
        })?;
        Ok(Self { client })
    }

    /// Posts `payload` to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns a network error if the request fails and
    /// `DeliveryError::UnexpectedStatus` for any non-2xx answer.
    pub async fn notify(&self, endpoint: &str, payload: &AlertPayload) -> Result<()> {
        let span = info_span!(
            "alert_notification",
            run_number = payload.run_number,
            consecutive_failures = payload.consecutive_failures
        );

        self.post(endpoint, payload).instrument(span).await
    }

    async fn post(&self, endpoint: &str, payload: &AlertPayload) -> Result<()> {
        let response = self.client.post(endpoint).json(payload).send().await.map_err(|e| {
            warn!(error = %e, "alert request failed");
            if e.is_timeout() {
                DeliveryError::timeout(ALERT_TIMEOUT.as_secs())
            } else {
                DeliveryError::network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::unexpected_status(status.as_u16(), 200, body))
    }
}
