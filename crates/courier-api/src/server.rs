//! HTTP server configuration and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response logging
//! 3. Timeout enforcement
//! 4. API key check for the route group
//! 5. Handler execution
//!
//! `/health` sits outside both key groups.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use courier_core::Clock;
use courier_delivery::{MessageService, Scheduler, StartParams};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::{
    config::Config,
    handlers,
    middleware::auth::{require_api_key, ApiKey},
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Message operations.
    pub service: MessageService,
    /// Delivery loop control.
    pub scheduler: Arc<Scheduler>,
    /// Parameters a start request falls back to.
    pub start_defaults: StartParams,
    /// Time source for health timestamps.
    pub clock: Arc<dyn Clock>,
}

/// Creates the Axum router with all routes and middleware.
///
/// # Example
///
/// ```no_run
/// use courier_api::{create_router, AppState, Config};
///
/// fn build(state: AppState, config: &Config) -> axum::Router {
///     create_router(state, config)
/// }
/// ```
pub fn create_router(state: AppState, config: &Config) -> Router {
    let health_routes = Router::new().route("/health", get(handlers::health_check));

    let message_routes = Router::new()
        .route(
            "/api/v1/messages",
            get(handlers::list_messages).post(handlers::create_message),
        )
        .route("/api/v1/messages/sent", get(handlers::list_sent_messages))
        .route("/api/v1/messages/stats", get(handlers::message_stats))
        .route("/api/v1/messages/cached", get(handlers::cached_messages))
        .route("/api/v1/messages/replay", post(handlers::replay_all))
        .route("/api/v1/messages/{id}/replay", post(handlers::replay_one))
        .route_layer(middleware::from_fn_with_state(
            ApiKey::new("messages", &config.messages_api_key),
            require_api_key,
        ));

    let scheduler_routes = Router::new()
        .route("/api/v1/scheduler/start", post(handlers::start_scheduler))
        .route("/api/v1/scheduler/stop", post(handlers::stop_scheduler))
        .route("/api/v1/scheduler/status", get(handlers::scheduler_status))
        .route_layer(middleware::from_fn_with_state(
            ApiKey::new("scheduler", &config.scheduler_api_key),
            require_api_key,
        ));

    Router::new()
        .merge(health_routes)
        .merge(message_routes)
        .merge(scheduler_routes)
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout)))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Adds an `X-Request-Id` header to every response.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Serves `app` on `addr` until `shutdown` resolves, then drains in-flight
/// requests.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound.
pub async fn start_server<F>(app: Router, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    info!(%local_addr, "HTTP server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    info!("HTTP server stopped gracefully");
    Ok(())
}

/// Waits for CTRL+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
