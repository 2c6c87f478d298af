//! Error types for message delivery operations.
//!
//! Covers transport failures, store and cache failures, replay eligibility,
//! and configuration problems. Each error maps onto an [`ErrorCategory`] used
//! as a structured logging field.

use std::fmt;

use courier_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions raised by the delivery pipeline.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level failure talking to the endpoint.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// Request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// The endpoint answered with a status other than the accepted one.
    #[error("unexpected status code: {status_code} (expected {expected}), body: {body}")]
    UnexpectedStatus {
        /// HTTP status code received
        status_code: u16,
        /// HTTP status code required for success
        expected: u16,
        /// Response body content
        body: String,
    },

    /// The endpoint accepted the request but the body could not be read.
    #[error("invalid response body: {message}")]
    InvalidResponse {
        /// Decode error message
        message: String,
    },

    /// Delivery was failed on purpose by the failure injector.
    #[error("simulated failure for testing")]
    ForcedFailure,

    /// Store operation failed.
    #[error("store error: {message}")]
    StoreError {
        /// Store error message
        message: String,
    },

    /// Replay target does not exist or is not failed.
    #[error("no failed message found with id {id}")]
    ReplayNotFound {
        /// Requested message id
        id: i64,
    },

    /// Cache operation failed.
    #[error("cache error: {message}")]
    CacheError {
        /// Cache error message
        message: String,
    },

    /// No cache is wired into this process.
    #[error("cache not configured")]
    CacheNotConfigured,

    /// Caller supplied invalid data.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Validation message
        message: String,
    },

    /// Invalid client or scheduler configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an unexpected status error.
    pub fn unexpected_status(status_code: u16, expected: u16, body: impl Into<String>) -> Self {
        Self::UnexpectedStatus { status_code, expected, body: body.into() }
    }

    /// Creates an invalid response error.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse { message: message.into() }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreError { message: message.into() }
    }

    /// Creates a cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::CacheError { message: message.into() }
    }

    /// Creates an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Returns true for failures that came from the downstream endpoint.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            ErrorCategory::from(self),
            ErrorCategory::Network | ErrorCategory::Endpoint | ErrorCategory::Injected
        )
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidInput(message) => Self::InvalidInput { message },
            other => Self::store(other.to_string()),
        }
    }
}

/// Category of delivery error for structured logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues and timeouts.
    Network,
    /// Endpoint answered but not with acceptance.
    Endpoint,
    /// Simulated failure.
    Injected,
    /// Store operations.
    Store,
    /// Cache operations.
    Cache,
    /// Caller input or replay eligibility.
    Client,
    /// Configuration problems.
    Configuration,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::UnexpectedStatus { .. } | DeliveryError::InvalidResponse { .. } => {
                Self::Endpoint
            },
            DeliveryError::ForcedFailure => Self::Injected,
            DeliveryError::StoreError { .. } => Self::Store,
            DeliveryError::CacheError { .. } | DeliveryError::CacheNotConfigured => Self::Cache,
            DeliveryError::ReplayNotFound { .. } | DeliveryError::InvalidInput { .. } => {
                Self::Client
            },
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Endpoint => write!(f, "endpoint"),
            Self::Injected => write!(f, "injected"),
            Self::Store => write!(f, "store"),
            Self::Cache => write!(f, "cache"),
            Self::Client => write!(f, "client"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}
