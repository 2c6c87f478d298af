//! HTTP transport for message delivery.
//!
//! Posts `{"to", "content"}` to the configured webhook with the
//! `x-ins-auth-key` header. Only `202 Accepted` counts as delivery; every
//! other status, a transport error, or an unreadable body is a failure.

use std::{future::Future, pin::Pin, time::Duration};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Header carrying the webhook authentication key.
pub const AUTH_KEY_HEADER: &str = "x-ins-auth-key";

/// The single status code the webhook uses to accept a message.
pub const ACCEPTED_STATUS: StatusCode = StatusCode::ACCEPTED;

/// Largest response body kept for error messages.
const MAX_ERROR_BODY: usize = 512;

/// Boxed future returned by transport sends.
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<DeliveryReceipt>> + Send + 'a>>;

/// Single request/response exchange with the delivery endpoint.
pub trait Transport: Send + Sync + 'static {
    /// Sends one message, returning the endpoint's receipt.
    fn send<'a>(&'a self, to: &'a str, content: &'a str) -> SendFuture<'a>;
}

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Webhook URL every message is posted to.
    pub url: String,
    /// Value sent in the `x-ins-auth-key` header.
    pub auth_key: String,
    /// Timeout for each request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "https://webhook.site/your-unique-id".to_string(),
            auth_key: String::new(),
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: concat!("courier/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Request body posted to the webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookRequest {
    /// Destination address.
    pub to: String,
    /// Message text.
    pub content: String,
}

/// Receipt returned by the webhook on acceptance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    /// Free-form acknowledgement text.
    #[serde(default)]
    pub message: String,
    /// Identifier the endpoint assigned to the message.
    pub message_id: String,
}

/// reqwest-backed webhook client.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl WebhookClient {
    /// Creates a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the URL is empty or the
    /// HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(DeliveryError::configuration("webhook url must not be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Returns the webhook URL.
    pub fn url(&self) -> &str {
        &self.config.url
    }

    async fn post(&self, to: &str, content: &str) -> Result<DeliveryReceipt> {
        let start_time = std::time::Instant::now();
        let payload = WebhookRequest { to: to.to_string(), content: content.to_string() };

        let response = match self
            .client
            .post(&self.config.url)
            .header(AUTH_KEY_HEADER, &self.config.auth_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    duration_ms = start_time.elapsed().as_millis(),
                    error = %e,
                    "webhook request failed"
                );
                if e.is_timeout() {
                    return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                }
                return Err(DeliveryError::network(e.to_string()));
            },
        };

        let status = response.status();
        tracing::info!(
            status = status.as_u16(),
            duration_ms = start_time.elapsed().as_millis(),
            "webhook request completed"
        );

        let body = response
            .text()
            .await
            .map_err(|e| DeliveryError::invalid_response(format!("failed to read body: {e}")))?;

        if status != ACCEPTED_STATUS {
            return Err(DeliveryError::unexpected_status(
                status.as_u16(),
                ACCEPTED_STATUS.as_u16(),
                truncate_body(&body),
            ));
        }

        serde_json::from_str::<DeliveryReceipt>(&body)
            .map_err(|e| DeliveryError::invalid_response(e.to_string()))
    }
}

impl Transport for WebhookClient {
    fn send<'a>(&'a self, to: &'a str, content: &'a str) -> SendFuture<'a> {
        let span = info_span!("webhook_delivery", url = %self.config.url, to = %to);
        Box::pin(self.post(to, content).instrument(span))
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &body[..end])
}

pub mod mock {
    //! Scriptable transport for tests.

    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc, Mutex,
        },
    };

    use super::{DeliveryReceipt, SendFuture, Transport};
    use crate::error::{DeliveryError, Result};

    /// What the transport does once its script is exhausted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Fallback {
        /// Accept every message with a generated id.
        Accept,
        /// Reject every message with a 500.
        Reject,
    }

    /// Transport returning scripted results and recording every call.
    #[derive(Clone)]
    pub struct MockTransport {
        script: Arc<Mutex<VecDeque<Result<DeliveryReceipt>>>>,
        calls: Arc<Mutex<Vec<(String, String)>>>,
        fallback: Fallback,
        counter: Arc<AtomicU64>,
    }

    impl MockTransport {
        /// Transport that accepts every message.
        pub fn accepting() -> Self {
            Self::with_fallback(Fallback::Accept)
        }

        /// Transport that rejects every message.
        pub fn rejecting() -> Self {
            Self::with_fallback(Fallback::Reject)
        }

        fn with_fallback(fallback: Fallback) -> Self {
            Self {
                script: Arc::new(Mutex::new(VecDeque::new())),
                calls: Arc::new(Mutex::new(Vec::new())),
                fallback,
                counter: Arc::new(AtomicU64::new(0)),
            }
        }

        /// Queues an acceptance with a fixed id.
        pub fn push_accept(&self, message_id: impl Into<String>) -> &Self {
            self.push(Ok(DeliveryReceipt {
                message: "Accepted".to_string(),
                message_id: message_id.into(),
            }))
        }

        /// Queues a rejection with the given status.
        pub fn push_reject(&self, status_code: u16) -> &Self {
            self.push(Err(DeliveryError::unexpected_status(status_code, 202, "rejected")))
        }

        fn push(&self, result: Result<DeliveryReceipt>) -> &Self {
            if let Ok(mut script) = self.script.lock() {
                script.push_back(result);
            }
            self
        }

        /// Every `(to, content)` pair sent so far.
        pub fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }

        /// Number of sends attempted.
        pub fn call_count(&self) -> usize {
            self.calls.lock().map(|calls| calls.len()).unwrap_or_default()
        }

        fn next_result(&self) -> Result<DeliveryReceipt> {
            let scripted = self.script.lock().ok().and_then(|mut script| script.pop_front());
            if let Some(result) = scripted {
                return result;
            }
            match self.fallback {
                Fallback::Accept => {
                    let n = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
                    Ok(DeliveryReceipt {
                        message: "Accepted".to_string(),
                        message_id: format!("mock-{n}"),
                    })
                },
                Fallback::Reject => {
                    Err(DeliveryError::unexpected_status(500, 202, "internal error"))
                },
            }
        }
    }

    impl Transport for MockTransport {
        fn send<'a>(&'a self, to: &'a str, content: &'a str) -> SendFuture<'a> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((to.to_string(), content.to_string()));
            }
            let result = self.next_result();
            Box::pin(async move { result })
        }
    }
}
