//! Scheduler control endpoints under `/api/v1/scheduler`.

use std::{collections::BTreeMap, time::Duration};

use axum::{body::Bytes, extract::State, response::Response};
use courier_delivery::StartParams;
use serde::Deserialize;
use tracing::{info, instrument};

use super::parse_json_body;
use crate::{
    response::{ApiError, ApiResponse, ApiResult},
    server::AppState,
};

/// Optional body of `POST /api/v1/scheduler/start`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSchedulerRequest {
    /// Minutes between passes.
    pub interval: Option<i64>,
    /// Probability in `[0, 1]` of failing a delivery on purpose.
    pub failure_rate: Option<f64>,
}

impl StartSchedulerRequest {
    /// Applies the request over `defaults`, collecting every invalid field.
    fn into_params(self, defaults: &StartParams) -> Result<StartParams, ApiError> {
        let mut details = BTreeMap::new();
        let mut params = defaults.clone();

        if let Some(minutes) = self.interval {
            match u64::try_from(minutes) {
                Ok(minutes) if minutes >= 1 => {
                    params.interval = Duration::from_secs(minutes.saturating_mul(60));
                },
                _ => {
                    details.insert("interval".to_string(), "interval must be at least 1".to_string());
                },
            }
        }

        if let Some(rate) = self.failure_rate {
            if (0.0..=1.0).contains(&rate) {
                params.failure_probability = rate;
            } else {
                details.insert(
                    "failureRate".to_string(),
                    "failureRate must be between 0 and 1".to_string(),
                );
            }
        }

        if details.is_empty() {
            Ok(params)
        } else {
            Err(ApiError::Validation(details))
        }
    }
}

/// `POST /api/v1/scheduler/start`
#[instrument(name = "start_scheduler", skip_all)]
pub async fn start_scheduler(State(state): State<AppState>, body: Bytes) -> ApiResult {
    if state.scheduler.is_running().await {
        let status = state.scheduler.status().await;
        return Ok(ApiResponse::ok_with_message("Scheduler is already running", status));
    }

    let request: StartSchedulerRequest = parse_json_body(&body)?.unwrap_or_default();
    let params = request.into_params(&state.start_defaults)?;
    let interval_seconds = params.interval.as_secs();
    let failure_probability = params.failure_probability;

    let outcome = state.scheduler.start(params).await;
    if !outcome.changed {
        return Ok(ApiResponse::ok_with_message("Scheduler is already running", outcome.status));
    }

    info!(interval_seconds, failure_probability, "scheduler started via api");
    Ok(ApiResponse::ok_with_message("Scheduler started successfully", outcome.status))
}

/// `POST /api/v1/scheduler/stop`
#[instrument(name = "stop_scheduler", skip(state))]
pub async fn stop_scheduler(State(state): State<AppState>) -> ApiResult {
    let outcome = state.scheduler.stop().await;
    let message = if outcome.changed {
        info!("scheduler stopped via api");
        "Scheduler stopped successfully"
    } else {
        "Scheduler is already stopped"
    };
    Ok(ApiResponse::ok_with_message(message, outcome.status))
}

/// `GET /api/v1/scheduler/status`
#[instrument(name = "scheduler_status", skip(state))]
pub async fn scheduler_status(State(state): State<AppState>) -> Response {
    ApiResponse::ok(state.scheduler.status().await)
}
