//! Health check handler.
//!
//! The store is critical: when it is down the endpoint answers 503. The
//! receipt cache is optional, so a cache outage only degrades the status and
//! an unconfigured cache reports `disabled`.

use std::{future::Future, sync::Arc, time::Duration};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use courier_core::Clock;
use courier_delivery::MessageService;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::server::AppState;

/// Upper bound on each component check.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// When the check ran
    pub timestamp: DateTime<Utc>,
    /// Per-component results
    pub components: HealthComponents,
    /// Service version
    pub version: String,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every configured component is up
    Ok,
    /// The store is up but the cache is not
    Degraded,
    /// The store is down
    Down,
}

/// Per-component results.
#[derive(Debug, Serialize)]
pub struct HealthComponents {
    /// Message store
    pub database: ComponentHealth,
    /// Receipt cache
    pub redis: ComponentHealth,
}

/// Health of one component.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Failure detail when down
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentHealth {
    fn up() -> Self {
        Self { status: ComponentStatus::Up, message: None }
    }

    fn down(message: String) -> Self {
        Self { status: ComponentStatus::Down, message: Some(message) }
    }

    fn disabled() -> Self {
        Self { status: ComponentStatus::Disabled, message: None }
    }
}

/// Component-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Reachable
    Up,
    /// Unreachable or failing
    Down,
    /// Not configured
    Disabled,
}

/// Runs component checks against a message service.
pub struct HealthService {
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl HealthService {
    /// Creates a health service using the default check timeout.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, timeout: HEALTH_CHECK_TIMEOUT }
    }

    /// Checks the store and cache behind `service`.
    pub async fn health_check(&self, service: &MessageService) -> HealthResponse {
        debug!("performing health check");

        let database = match self.bounded(service.store_health()).await {
            Some(Ok(())) => ComponentHealth::up(),
            Some(Err(e)) => ComponentHealth::down(format!("database check failed: {e}")),
            None => ComponentHealth::down("database check timed out".to_string()),
        };

        let redis = match self.bounded(service.cache_health()).await {
            Some(None) => ComponentHealth::disabled(),
            Some(Some(Ok(()))) => ComponentHealth::up(),
            Some(Some(Err(e))) => ComponentHealth::down(format!("redis check failed: {e}")),
            None => ComponentHealth::down("redis check timed out".to_string()),
        };

        let status = overall_status(&database, &redis);
        if status != HealthStatus::Ok {
            warn!(?status, database = ?database.status, redis = ?redis.status, "service not healthy");
        }

        HealthResponse {
            status,
            timestamp: self.clock.now_utc(),
            components: HealthComponents { database, redis },
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn bounded<T>(&self, check: impl Future<Output = T>) -> Option<T> {
        tokio::time::timeout(self.timeout, check).await.ok()
    }
}

fn overall_status(database: &ComponentHealth, redis: &ComponentHealth) -> HealthStatus {
    match (database.status, redis.status) {
        (ComponentStatus::Down, _) => HealthStatus::Down,
        (_, ComponentStatus::Down) => HealthStatus::Degraded,
        _ => HealthStatus::Ok,
    }
}

/// `GET /health`
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let response = HealthService::new(state.clock.clone()).health_check(&state.service).await;

    let status_code = match response.status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Down => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(response)).into_response()
}
