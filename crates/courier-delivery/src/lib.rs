//! Scheduled message delivery.
//!
//! This crate turns queued messages into delivery attempts against an
//! external webhook, records each outcome in the message store and raises
//! an alert when whole batches keep failing.
//!
//! # Architecture
//!
//! A single scheduler task wakes on a fixed interval and hands one bounded
//! batch to the delivery engine:
//!
//! 1. **Fetch** - up to `batch_size` pending messages, oldest first
//! 2. **Inject** - optionally fail a delivery on purpose before sending
//! 3. **Send** - post the (possibly truncated) content to the webhook
//! 4. **Record** - conditionally mark the message sent or failed
//! 5. **Cache** - best-effort receipt write after a confirmed send
//!
//! Failed messages stay failed until an operator replays them, which moves
//! them back to pending for the next pass.
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use courier_core::RealClock;
//! use courier_delivery::{
//!     storage::mock::MockMessageStore, AlertNotifier, ClientConfig, DeliveryEngine,
//!     EngineConfig, Scheduler, SchedulerConfig, StartParams, WebhookClient,
//! };
//!
//! # async fn example() -> courier_delivery::Result<()> {
//! let clock = Arc::new(RealClock::new());
//! let transport = WebhookClient::new(ClientConfig::default())?;
//! let engine = DeliveryEngine::new(
//!     Arc::new(MockMessageStore::new()),
//!     Arc::new(transport),
//!     EngineConfig::default(),
//!     clock.clone(),
//! );
//! let scheduler =
//!     Scheduler::new(Arc::new(engine), AlertNotifier::new()?, SchedulerConfig::default(), clock);
//!
//! scheduler.start(StartParams::new(Duration::from_secs(120), 0.0)).await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alert;
pub mod cache;
pub mod client;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod service;
pub mod storage;

pub use alert::{AlertNotifier, AlertPayload};
pub use cache::{MessageCache, RedisMessageCache};
pub use client::{ClientConfig, Transport, WebhookClient};
pub use engine::{DeliveryEngine, DeliveryOutcome, EngineConfig, FailureInjector};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use scheduler::{
    ControlOutcome, PassSummary, Scheduler, SchedulerConfig, SchedulerStatus, StartParams,
};
pub use service::MessageService;
pub use storage::{MessageStore, PostgresMessageStore};

/// Default number of messages delivered per pass.
pub const DEFAULT_BATCH_SIZE: usize = 2;

/// Default webhook request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Default longest content, in characters.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 1000;

/// Default minutes between scheduler passes.
pub const DEFAULT_INTERVAL_MINUTES: u64 = 2;
