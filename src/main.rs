//! Courier message delivery service.
//!
//! Main entry point. Wires storage, cache, delivery engine, scheduler and
//! HTTP API together and coordinates startup and graceful shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::{create_router, shutdown_signal, start_server, AppState, Config};
use courier_core::{storage::Storage, RealClock};
use courier_delivery::{
    AlertNotifier, DeliveryEngine, MessageService, MessageStore, PostgresMessageStore,
    RedisMessageCache, Scheduler, WebhookClient,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SCHEDULER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const SEED_MESSAGES: &[(&str, &str)] = &[
    ("Your one-time code is 482913", "+905551000001"),
    ("Your parcel left the warehouse this morning.", "+905551000002"),
    ("Reminder: dentist appointment tomorrow at 09:30", "+905551000003"),
    ("Welcome aboard! Reply STOP to unsubscribe.", "+905551000004"),
    ("Your card ending 4421 was charged 129.90 TRY", "+905551000005"),
    ("Weekend sale: 15% off with code SPRING15", "+905551000006"),
    ("Your password was changed. Not you? Call support.", "+905551000007"),
    ("Order #88214 has been delivered.", "+905551000008"),
    ("Your subscription renews in 3 days.", "+905551000009"),
    ("Thanks for your feedback!", "+905551000010"),
];

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting courier message delivery service");

    let config = Config::load()?;
    config.require_secrets()?;
    info!(
        database_url = %config.database_url_masked(),
        webhook_url = %config.webhook_url,
        batch_size = config.message_batch_size,
        interval_minutes = config.message_send_interval_minutes,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    run_migrations(&db_pool).await?;
    info!("Database migrations completed");

    let clock = Arc::new(RealClock::new());
    let store: Arc<dyn MessageStore> =
        Arc::new(PostgresMessageStore::new(Arc::new(Storage::new(db_pool.clone()))));

    if config.seed_data {
        seed_messages(store.as_ref()).await?;
    }

    let transport = WebhookClient::new(config.to_client_config())
        .context("Failed to build webhook client")?;
    let mut engine =
        DeliveryEngine::new(store, Arc::new(transport), config.to_engine_config(), clock.clone());
    if let Some(url) = config.redis_endpoint() {
        match RedisMessageCache::connect(url).await {
            Ok(cache) => {
                info!(redis_url = %config.redis_url_masked(), "Redis cache connected");
                engine = engine.with_cache(Arc::new(cache));
            },
            Err(e) => warn!(error = %e, "Redis unavailable, receipt caching disabled"),
        }
    } else {
        info!("Redis not configured, receipt caching disabled");
    }
    let engine = Arc::new(engine);

    let shutdown = CancellationToken::new();
    let notifier = AlertNotifier::new().context("Failed to build alert client")?;
    let scheduler = Arc::new(
        Scheduler::new(engine.clone(), notifier, config.to_scheduler_config(), clock.clone())
            .with_shutdown(shutdown.clone()),
    );

    let start_defaults = config.default_start_params();
    if config.auto_start_scheduler {
        scheduler.start(start_defaults.clone()).await;
    } else {
        info!("Scheduler auto-start disabled");
    }

    let state = AppState {
        service: MessageService::new(engine),
        scheduler: scheduler.clone(),
        start_defaults,
        clock,
    };
    let app = create_router(state, &config);
    let addr = config.parse_server_addr()?;

    let server_result = start_server(app, addr, {
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    })
    .await;
    if let Err(e) = &server_result {
        error!(error = %e, "HTTP server failed");
    }

    shutdown.cancel();
    if tokio::time::timeout(SCHEDULER_STOP_TIMEOUT, scheduler.stop()).await.is_err() {
        warn!(timeout_secs = SCHEDULER_STOP_TIMEOUT.as_secs(), "Scheduler did not stop in time");
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("Courier shutdown complete");
    server_result.context("HTTP server error")
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,courier=debug,tower_http=debug"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("Failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Creates the messages table and its indexes if missing.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id BIGSERIAL PRIMARY KEY,
            content TEXT NOT NULL,
            phone_number VARCHAR(20) NOT NULL,
            status VARCHAR(20) NOT NULL DEFAULT 'pending',
            message_id VARCHAR(100),
            sent_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CONSTRAINT messages_status_check CHECK (status IN ('pending', 'sent', 'failed'))
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create messages table")?;

    for (name, statement) in [
        (
            "idx_messages_status_created_at",
            "CREATE INDEX IF NOT EXISTS idx_messages_status_created_at ON messages (status, created_at)",
        ),
        (
            "idx_messages_created_at",
            "CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages (created_at)",
        ),
        (
            "idx_messages_sent_at",
            "CREATE INDEX IF NOT EXISTS idx_messages_sent_at ON messages (sent_at)",
        ),
    ] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to create index {name}"))?;
    }

    Ok(())
}

/// Inserts sample messages into an empty table.
async fn seed_messages(store: &dyn MessageStore) -> Result<()> {
    let stats = store.stats().await.context("Failed to count messages")?;
    if stats.total > 0 {
        info!(existing = stats.total, "Messages already present, skipping seed");
        return Ok(());
    }

    for (content, phone_number) in SEED_MESSAGES {
        store
            .create((*content).to_string(), (*phone_number).to_string())
            .await
            .context("Failed to insert seed message")?;
    }
    info!(count = SEED_MESSAGES.len(), "Seeded sample messages");
    Ok(())
}
