//! End-to-end flow through the HTTP API and a real webhook client.
//!
//! Messages are created over HTTP, the scheduler is started over HTTP and
//! delivers to a wiremock webhook, and the results are read back over HTTP.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use courier_api::{create_router, AppState, Config};
use courier_core::RealClock;
use courier_delivery::{
    cache::mock::MockMessageCache, client::AUTH_KEY_HEADER, storage::mock::MockMessageStore,
    AlertNotifier, DeliveryEngine, MessageService, Scheduler, WebhookClient,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

const MESSAGES_KEY: &str = "e2e-messages";
const SCHEDULER_KEY: &str = "e2e-scheduler";

fn build_app(webhook: &MockServer, alerts: &MockServer) -> (Router, Arc<Scheduler>) {
    let config = Config {
        webhook_url: format!("{}/webhook", webhook.uri()),
        webhook_auth_key: "hook-secret".to_string(),
        webhook_timeout_seconds: 2,
        message_max_content_length: 30,
        alert_webhook_url: format!("{}/alert", alerts.uri()),
        alert_iteration_count: 1,
        messages_api_key: MESSAGES_KEY.to_string(),
        scheduler_api_key: SCHEDULER_KEY.to_string(),
        ..Config::default()
    };
    config.require_secrets().unwrap();

    let clock = Arc::new(RealClock::new());
    let transport = WebhookClient::new(config.to_client_config()).unwrap();
    let engine = Arc::new(
        DeliveryEngine::new(
            Arc::new(MockMessageStore::new()),
            Arc::new(transport),
            config.to_engine_config(),
            clock.clone(),
        )
        .with_cache(Arc::new(MockMessageCache::new())),
    );
    let scheduler = Arc::new(Scheduler::new(
        engine.clone(),
        AlertNotifier::new().unwrap(),
        config.to_scheduler_config(),
        clock.clone(),
    ));
    let state = AppState {
        service: MessageService::new(engine),
        scheduler: scheduler.clone(),
        start_defaults: config.default_start_params(),
        clock,
    };

    (create_router(state, &config), scheduler)
}

async fn call(app: &Router, method: Method, uri: &str, key: &str, body: Option<Value>) -> Value {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-ins-auth-key", key)
        .header("content-type", "application/json")
        .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert!(response.status().is_success(), "{uri} returned {}", response.status());
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn messages_flow_from_api_to_webhook() {
    let webhook = MockServer::start().await;
    let alerts = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .and(header(AUTH_KEY_HEADER, "hook-secret"))
        .respond_with(
            ResponseTemplate::new(202)
                .set_body_json(json!({"message": "Accepted", "messageId": "remote-1"})),
        )
        .mount(&webhook)
        .await;
    let (app, scheduler) = build_app(&webhook, &alerts);

    for (content, phone) in [("first", "+905550000001"), ("second", "+905550000002")] {
        let body = json!({"content": content, "phoneNumber": phone});
        call(&app, Method::POST, "/api/v1/messages", MESSAGES_KEY, Some(body)).await;
    }

    let started = call(&app, Method::POST, "/api/v1/scheduler/start", SCHEDULER_KEY, None).await;
    assert_eq!(started["data"]["running"], true);

    wait_until(|| {
        let app = app.clone();
        async move {
            let stats = call(&app, Method::GET, "/api/v1/messages/stats", MESSAGES_KEY, None).await;
            stats["data"]["sent"] == 2
        }
    })
    .await;

    let stopped = call(&app, Method::POST, "/api/v1/scheduler/stop", SCHEDULER_KEY, None).await;
    assert_eq!(stopped["data"]["running"], false);
    assert_eq!(stopped["data"]["messagesSent"], 2);
    assert_eq!(stopped["data"]["runsCount"], 1);
    assert!(!scheduler.is_running().await);

    let sent = call(&app, Method::GET, "/api/v1/messages/sent", MESSAGES_KEY, None).await;
    assert_eq!(sent["totalCount"], 2);
    assert!(sent["data"].as_array().unwrap().iter().all(|m| m["messageId"] == "remote-1"));

    let cached = call(&app, Method::GET, "/api/v1/messages/cached", MESSAGES_KEY, None).await;
    assert_eq!(cached["data"].as_object().unwrap().len(), 2);

    assert!(alerts.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn failing_webhook_triggers_alert_and_replay_recovers() {
    let webhook = MockServer::start().await;
    let alerts = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&webhook)
        .await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(
            ResponseTemplate::new(202)
                .set_body_json(json!({"message": "Accepted", "messageId": "remote-2"})),
        )
        .mount(&webhook)
        .await;
    Mock::given(method("POST"))
        .and(path("/alert"))
        .and(body_partial_json(json!({"consecutiveFailures": 1})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&alerts)
        .await;
    let (app, scheduler) = build_app(&webhook, &alerts);

    // Start and stop on an empty queue so the alert settings are applied.
    call(&app, Method::POST, "/api/v1/scheduler/start", SCHEDULER_KEY, None).await;
    call(&app, Method::POST, "/api/v1/scheduler/stop", SCHEDULER_KEY, None).await;

    let body = json!({"content": "this content is longer than thirty characters", "phoneNumber": "+905550000003"});
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/v1/messages")
                .header("x-ins-auth-key", MESSAGES_KEY)
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let body = json!({"content": "short", "phoneNumber": "+905550000003"});
    let created = call(&app, Method::POST, "/api/v1/messages", MESSAGES_KEY, Some(body)).await;
    let id = created["data"]["id"].as_i64().unwrap();

    let summary = scheduler.process_once().await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.consecutive_all_fail, 1);
    assert!(summary.alert_triggered);

    wait_until(|| {
        let scheduler = scheduler.clone();
        async move { scheduler.status().await.last_alert_sent_at.is_some() }
    })
    .await;

    let replayed =
        call(&app, Method::POST, &format!("/api/v1/messages/{id}/replay"), MESSAGES_KEY, None)
            .await;
    assert_eq!(replayed["data"]["replayed"], 1);

    let summary = scheduler.process_once().await;
    assert_eq!(summary.sent, 1);
    assert_eq!(summary.consecutive_all_fail, 0);

    let stats = call(&app, Method::GET, "/api/v1/messages/stats", MESSAGES_KEY, None).await;
    assert_eq!(stats["data"], json!({"pending": 0, "sent": 1, "failed": 0, "total": 1}));
}
