//! Periodic delivery scheduler.
//!
//! A single background task runs one pass immediately on start and then one
//! pass per interval until stopped. Run statistics and alert state live
//! behind one `RwLock`; no I/O happens while it is held.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{models::MessageId, Clock};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    alert::{AlertNotifier, AlertPayload},
    engine::DeliveryEngine,
    error::Result,
};

/// Scheduler defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval used when a start request carries none.
    pub default_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { default_interval: Duration::from_secs(crate::DEFAULT_INTERVAL_MINUTES * 60) }
    }
}

/// Parameters for one scheduler run.
#[derive(Debug, Clone, PartialEq)]
pub struct StartParams {
    /// Time between passes. Zero selects the configured default.
    pub interval: Duration,
    /// Probability in `[0, 1]` that a delivery is failed on purpose.
    pub failure_probability: f64,
    /// Where degradation alerts are posted.
    pub alert_endpoint: Option<String>,
    /// Consecutive fully failed passes before alerting. Zero disables.
    pub alert_threshold: u32,
}

impl StartParams {
    /// Parameters without alerting.
    pub fn new(interval: Duration, failure_probability: f64) -> Self {
        Self { interval, failure_probability, alert_endpoint: None, alert_threshold: 0 }
    }

    /// Enables alerting after `threshold` fully failed passes.
    #[must_use]
    pub fn with_alert(mut self, endpoint: impl Into<String>, threshold: u32) -> Self {
        self.alert_endpoint = Some(endpoint.into());
        self.alert_threshold = threshold;
        self
    }
}

#[derive(Debug)]
struct SchedulerState {
    running: bool,
    interval: Duration,
    failure_probability: f64,
    alert_endpoint: Option<String>,
    alert_threshold: u32,
    last_alert_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    messages_sent: u64,
    runs: u64,
    consecutive_all_fail: u32,
}

impl SchedulerState {
    fn new(interval: Duration) -> Self {
        Self {
            running: false,
            interval,
            failure_probability: 0.0,
            alert_endpoint: None,
            alert_threshold: 0,
            last_alert_at: None,
            last_run_at: None,
            messages_sent: 0,
            runs: 0,
            consecutive_all_fail: 0,
        }
    }

    fn snapshot(&self) -> SchedulerStatus {
        let next_run_at = if self.running {
            self.last_run_at.and_then(|last| {
                chrono::Duration::from_std(self.interval).ok().map(|interval| last + interval)
            })
        } else {
            None
        };

        SchedulerStatus {
            running: self.running,
            last_run_at: self.last_run_at,
            next_run_at,
            messages_sent: self.messages_sent,
            runs_count: self.runs,
            interval_seconds: self.interval.as_secs(),
            failure_rate: self.failure_probability,
            consecutive_all_fail_count: self.consecutive_all_fail,
            last_alert_sent_at: self.last_alert_at,
        }
    }

    /// Alert target when alerting is enabled.
    fn alert_target(&self) -> Option<(String, u32)> {
        match &self.alert_endpoint {
            Some(endpoint) if !endpoint.is_empty() && self.alert_threshold > 0 => {
                Some((endpoint.clone(), self.alert_threshold))
            },
            _ => None,
        }
    }
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    /// Whether the loop is active.
    pub running: bool,
    /// Start of the most recent pass.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Expected start of the next pass while running.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Deliveries confirmed since the process started.
    pub messages_sent: u64,
    /// Passes executed since the process started.
    pub runs_count: u64,
    /// Current interval in seconds.
    pub interval_seconds: u64,
    /// Current failure injection probability.
    pub failure_rate: f64,
    /// Current streak of passes where every delivery failed.
    pub consecutive_all_fail_count: u32,
    /// Last acknowledged alert.
    pub last_alert_sent_at: Option<DateTime<Utc>>,
}

/// Result of a start or stop request.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlOutcome {
    /// False when the scheduler was already in the requested state.
    pub changed: bool,
    /// Status after the request.
    pub status: SchedulerStatus,
}

/// What one pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    /// Run counter value assigned to this pass.
    pub run_number: u64,
    /// Messages fetched.
    pub batch_size: usize,
    /// Deliveries confirmed by the store.
    pub sent: usize,
    /// Deliveries that ended failed.
    pub failed: usize,
    /// Streak after this pass.
    pub consecutive_all_fail: u32,
    /// Whether an alert was dispatched.
    pub alert_triggered: bool,
}

struct LoopHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Shared between the scheduler handle and its loop task.
struct SchedulerCore {
    engine: Arc<DeliveryEngine>,
    state: Arc<RwLock<SchedulerState>>,
    notifier: AlertNotifier,
    clock: Arc<dyn Clock>,
}

impl SchedulerCore {
    async fn run(&self, cancel: CancellationToken) {
        info!("scheduler loop started");

        loop {
            self.process_once().await;

            let interval = self.state.read().await.interval;
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = self.clock.sleep(interval) => {}
            }
        }

        self.state.write().await.running = false;
        info!("scheduler loop stopped");
    }

    async fn process_once(&self) -> PassSummary {
        let (run_number, failure_probability, alert_target) = {
            let mut state = self.state.write().await;
            state.runs += 1;
            state.last_run_at = Some(self.clock.now_utc());
            (state.runs, state.failure_probability, state.alert_target())
        };

        let mut summary = PassSummary {
            run_number,
            batch_size: 0,
            sent: 0,
            failed: 0,
            consecutive_all_fail: 0,
            alert_triggered: false,
        };

        let outcomes = match self.engine.process_pending(failure_probability).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                error!(run_number, error = %e, "failed to fetch pending messages");
                summary.consecutive_all_fail = self.state.read().await.consecutive_all_fail;
                return summary;
            },
        };

        if outcomes.is_empty() {
            debug!(run_number, "no pending messages");
            summary.consecutive_all_fail = self.state.read().await.consecutive_all_fail;
            return summary;
        }

        summary.batch_size = outcomes.len();
        summary.sent = outcomes.iter().filter(|outcome| outcome.success).count();
        summary.failed = summary.batch_size - summary.sent;

        summary.consecutive_all_fail = {
            let mut state = self.state.write().await;
            state.messages_sent += summary.sent as u64;
            if summary.sent == 0 {
                state.consecutive_all_fail += 1;
            } else {
                state.consecutive_all_fail = 0;
            }
            state.consecutive_all_fail
        };

        info!(
            run_number,
            batch_size = summary.batch_size,
            sent = summary.sent,
            failed = summary.failed,
            consecutive_all_fail = summary.consecutive_all_fail,
            "scheduler pass completed"
        );

        if let Some((endpoint, threshold)) = alert_target {
            if summary.consecutive_all_fail >= threshold {
                warn!(
                    run_number,
                    consecutive_all_fail = summary.consecutive_all_fail,
                    threshold,
                    "alert threshold reached"
                );
                self.dispatch_alert(endpoint, &summary);
                summary.alert_triggered = true;
            }
        }

        summary
    }

    fn dispatch_alert(&self, endpoint: String, summary: &PassSummary) {
        let payload = AlertPayload::consecutive_all_fail(
            summary.run_number,
            summary.consecutive_all_fail,
            summary.batch_size,
            self.clock.now_utc(),
        );
        let notifier = self.notifier.clone();
        let state = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        let span = info_span!("alert", run_number = summary.run_number);

        tokio::spawn(
            async move {
                match notifier.notify(&endpoint, &payload).await {
                    Ok(()) => {
                        state.write().await.last_alert_at = Some(clock.now_utc());
                        info!("alert acknowledged");
                    },
                    Err(e) => warn!(error = %e, "alert was not acknowledged"),
                }
            }
            .instrument(span),
        );
    }
}

/// Drives the delivery engine on a fixed interval.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    config: SchedulerConfig,
    task: Mutex<Option<LoopHandle>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Creates a stopped scheduler.
    pub fn new(
        engine: Arc<DeliveryEngine>,
        notifier: AlertNotifier,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = SchedulerState::new(config.default_interval);
        Self {
            core: Arc::new(SchedulerCore {
                engine,
                state: Arc::new(RwLock::new(state)),
                notifier,
                clock,
            }),
            config,
            task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Ties the loop to an external shutdown signal.
    ///
    /// Cancelling `token` ends the loop after its current pass without
    /// waiting for it.
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Starts the loop. Does nothing if it is already running.
    ///
    /// A zero interval is replaced by the configured default and the failure
    /// probability is clamped to `[0, 1]`. The first pass runs right away.
    pub async fn start(&self, params: StartParams) -> ControlOutcome {
        let mut task = self.task.lock().await;

        {
            let mut state = self.core.state.write().await;
            if state.running {
                debug!("scheduler already running");
                return ControlOutcome { changed: false, status: state.snapshot() };
            }

            state.running = true;
            state.interval = if params.interval.is_zero() {
                self.config.default_interval
            } else {
                params.interval
            };
            state.failure_probability = if params.failure_probability.is_nan() {
                0.0
            } else {
                params.failure_probability.clamp(0.0, 1.0)
            };
            state.alert_endpoint = params.alert_endpoint;
            state.alert_threshold = params.alert_threshold;
            state.consecutive_all_fail = 0;

            info!(
                interval_seconds = state.interval.as_secs(),
                failure_rate = state.failure_probability,
                alert_threshold = state.alert_threshold,
                "starting scheduler"
            );
        }

        // A loop that exited on shutdown leaves a finished handle behind.
        if let Some(previous) = task.take() {
            previous.cancel.cancel();
            if let Err(e) = previous.handle.await {
                error!(error = %e, "previous scheduler task panicked");
            }
        }

        let cancel = self.shutdown.child_token();
        let core = Arc::clone(&self.core);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(
            async move { core.run(loop_cancel).await }.instrument(info_span!("scheduler")),
        );
        *task = Some(LoopHandle { cancel, handle });

        ControlOutcome { changed: true, status: self.core.state.read().await.snapshot() }
    }

    /// Stops the loop and waits for the in-flight pass to finish.
    pub async fn stop(&self) -> ControlOutcome {
        let mut task = self.task.lock().await;
        let was_running = self.core.state.read().await.running;

        if let Some(LoopHandle { cancel, handle }) = task.take() {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler task panicked");
            }
        }

        let status = {
            let mut state = self.core.state.write().await;
            state.running = false;
            state.snapshot()
        };

        if was_running {
            info!(runs = status.runs_count, sent = status.messages_sent, "scheduler stopped");
        } else {
            debug!("scheduler already stopped");
        }

        ControlOutcome { changed: was_running, status }
    }

    /// Returns a consistent snapshot of the scheduler state.
    pub async fn status(&self) -> SchedulerStatus {
        self.core.state.read().await.snapshot()
    }

    /// Whether the loop is active.
    pub async fn is_running(&self) -> bool {
        self.core.state.read().await.running
    }

    /// Runs a single pass using the current parameters.
    pub async fn process_once(&self) -> PassSummary {
        self.core.process_once().await
    }

    /// Returns one failed message to the pending queue.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ReplayNotFound` if the message is absent or
    /// not failed.
    pub async fn replay_one(&self, id: MessageId) -> Result<()> {
        self.core.engine.replay_one(id).await
    }

    /// Returns every failed message to the pending queue.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StoreError` if the update fails.
    pub async fn replay_all(&self) -> Result<u64> {
        self.core.engine.replay_all().await
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{MessageStatus, RealClock};

    use super::*;
    use crate::{
        client::mock::MockTransport,
        engine::{EngineConfig, FailureInjector},
        storage::mock::MockMessageStore,
    };

    const LONG_INTERVAL: Duration = Duration::from_secs(3600);

    fn scheduler(store: &MockMessageStore, transport: &MockTransport, batch: usize) -> Scheduler {
        let engine = DeliveryEngine::new(
            Arc::new(store.clone()),
            Arc::new(transport.clone()),
            EngineConfig { batch_size: batch, ..Default::default() },
            Arc::new(RealClock::new()),
        )
        .with_injector(FailureInjector::seeded(3));

        Scheduler::new(
            Arc::new(engine),
            AlertNotifier::new().unwrap(),
            SchedulerConfig::default(),
            Arc::new(RealClock::new()),
        )
    }

    #[tokio::test]
    async fn initial_status_is_stopped() {
        let s = scheduler(&MockMessageStore::new(), &MockTransport::accepting(), 2);

        let status = s.status().await;

        assert!(!status.running);
        assert_eq!(status.runs_count, 0);
        assert_eq!(status.next_run_at, None);
        assert_eq!(status.interval_seconds, 120);
    }

    #[tokio::test]
    async fn mixed_batch_resets_streak() {
        let store = MockMessageStore::new();
        let transport = MockTransport::accepting();
        transport.push_accept("a").push_reject(500).push_accept("b");
        store.add_pending_batch(3).await;
        let s = scheduler(&store, &transport, 3);

        let summary = s.process_once().await;

        assert_eq!(summary.sent, 2);
        assert_eq!(summary.failed, 1);
        let status = s.status().await;
        assert_eq!(status.messages_sent, 2);
        assert_eq!(status.runs_count, 1);
        assert_eq!(status.consecutive_all_fail_count, 0);
    }

    #[tokio::test]
    async fn empty_batch_only_counts_the_run() {
        let s = scheduler(&MockMessageStore::new(), &MockTransport::rejecting(), 2);

        let summary = s.process_once().await;

        assert_eq!(summary.batch_size, 0);
        let status = s.status().await;
        assert_eq!(status.runs_count, 1);
        assert_eq!(status.consecutive_all_fail_count, 0);
        assert!(status.last_run_at.is_some());
    }

    #[tokio::test]
    async fn fetch_error_is_absorbed() {
        let store = MockMessageStore::new();
        store.add_pending_batch(2).await;
        store.inject_fetch_error("connection reset").await;
        let s = scheduler(&store, &MockTransport::accepting(), 2);

        let summary = s.process_once().await;

        assert_eq!(summary.batch_size, 0);
        assert_eq!(s.status().await.runs_count, 1);
        assert_eq!(store.count_with_status(MessageStatus::Pending).await, 2);
    }

    #[tokio::test]
    async fn start_runs_first_pass_immediately() {
        let store = MockMessageStore::new();
        store.add_pending_batch(2).await;
        let s = scheduler(&store, &MockTransport::accepting(), 2);

        let outcome = s.start(StartParams::new(LONG_INTERVAL, 0.0)).await;
        assert!(outcome.changed);
        assert!(outcome.status.running);

        s.stop().await;

        assert_eq!(store.count_with_status(MessageStatus::Sent).await, 2);
        let status = s.status().await;
        assert_eq!(status.runs_count, 1);
        assert_eq!(status.messages_sent, 2);
        assert!(!status.running);
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let store = MockMessageStore::new();
        let s = scheduler(&store, &MockTransport::accepting(), 2);

        s.start(StartParams::new(LONG_INTERVAL, 0.0)).await;
        let again = s.start(StartParams::new(Duration::from_secs(60), 1.0)).await;

        assert!(!again.changed);
        assert!(again.status.running);
        assert_eq!(again.status.interval_seconds, 3600);
        assert!(again.status.failure_rate.abs() < f64::EPSILON);
        s.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let s = scheduler(&MockMessageStore::new(), &MockTransport::accepting(), 2);

        s.start(StartParams::new(LONG_INTERVAL, 0.0)).await;
        let first = s.stop().await;
        let second = s.stop().await;

        assert!(first.changed);
        assert!(!second.changed);
        assert!(!second.status.running);
        assert!(!s.is_running().await);
    }

    #[tokio::test]
    async fn start_normalizes_parameters() {
        let s = scheduler(&MockMessageStore::new(), &MockTransport::accepting(), 2);

        let outcome = s.start(StartParams::new(Duration::ZERO, 7.5)).await;

        assert_eq!(outcome.status.interval_seconds, 120);
        assert!((outcome.status.failure_rate - 1.0).abs() < f64::EPSILON);
        s.stop().await;
    }

    #[tokio::test]
    async fn external_shutdown_ends_loop() {
        let token = CancellationToken::new();
        let s = scheduler(&MockMessageStore::new(), &MockTransport::accepting(), 2)
            .with_shutdown(token.clone());

        s.start(StartParams::new(LONG_INTERVAL, 0.0)).await;
        token.cancel();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while s.is_running().await && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!s.is_running().await);
        assert!(!s.stop().await.changed);
    }
}
