//! Per-message delivery.
//!
//! The engine turns one pending message into exactly one terminal store
//! transition. Forced failures short-circuit before the transport, long
//! content is truncated on the in-flight copy, and a receipt is cached only
//! after the store has confirmed the send.

use std::{borrow::Cow, sync::Arc, sync::Mutex, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{
    models::{Message, MessageId, SentMessageCache},
    Clock,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    cache::{MessageCache, DEFAULT_CACHE_TTL},
    client::Transport,
    error::{DeliveryError, ErrorCategory, Result},
    storage::MessageStore,
};

/// Marker appended to truncated content.
pub const TRUNCATION_MARKER: &str = "...";

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum messages fetched per pass.
    pub batch_size: usize,
    /// Longest content sent downstream, in characters.
    pub max_content_length: usize,
    /// Expiry for cached receipts.
    pub cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: crate::DEFAULT_BATCH_SIZE,
            max_content_length: crate::DEFAULT_MAX_CONTENT_LENGTH,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    /// Message the attempt was for.
    pub message_id: MessageId,
    /// Identifier assigned downstream, present on success.
    pub delivery_id: Option<String>,
    /// True only once the store confirmed the sent transition.
    pub success: bool,
    /// Why the attempt failed.
    pub failure: Option<DeliveryError>,
    /// When the attempt started.
    pub attempted_at: DateTime<Utc>,
}

impl DeliveryOutcome {
    fn sent(message_id: MessageId, delivery_id: String, attempted_at: DateTime<Utc>) -> Self {
        Self { message_id, delivery_id: Some(delivery_id), success: true, failure: None, attempted_at }
    }

    fn failed(message_id: MessageId, cause: DeliveryError, attempted_at: DateTime<Utc>) -> Self {
        Self { message_id, delivery_id: None, success: false, failure: Some(cause), attempted_at }
    }
}

/// Uniform random source deciding forced failures.
///
/// Seed it in tests to make failure patterns reproducible.
#[derive(Debug)]
pub struct FailureInjector {
    rng: Mutex<StdRng>,
}

impl FailureInjector {
    /// Injector seeded from the thread-local generator.
    pub fn from_entropy() -> Self {
        Self { rng: Mutex::new(StdRng::from_rng(&mut rand::rng())) }
    }

    /// Injector with a fixed seed.
    pub fn seeded(seed: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }

    /// Draws one value in `[0, 1)` and reports whether it falls below
    /// `probability`.
    pub fn should_fail(&self, probability: f64) -> bool {
        let draw: f64 = match self.rng.lock() {
            Ok(mut rng) => rng.random(),
            Err(poisoned) => poisoned.into_inner().random(),
        };
        draw < probability
    }
}

impl Default for FailureInjector {
    fn default() -> Self {
        Self::from_entropy()
    }
}

/// Truncates `content` to at most `max_length` characters.
///
/// When truncation is needed and `max_length` leaves room, the last three
/// characters become [`TRUNCATION_MARKER`]. Otherwise the content is cut to
/// exactly `max_length` characters.
pub fn truncate_content(content: &str, max_length: usize) -> Cow<'_, str> {
    let length = content.chars().count();
    if length <= max_length {
        return Cow::Borrowed(content);
    }

    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_length > marker_len {
        let prefix: String = content.chars().take(max_length - marker_len).collect();
        Cow::Owned(prefix + TRUNCATION_MARKER)
    } else {
        Cow::Owned(content.chars().take(max_length).collect())
    }
}

/// Delivers messages and records their terminal state.
pub struct DeliveryEngine {
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn Transport>,
    cache: Option<Arc<dyn MessageCache>>,
    config: EngineConfig,
    injector: FailureInjector,
    clock: Arc<dyn Clock>,
}

impl DeliveryEngine {
    /// Creates an engine without a cache and with an entropy-seeded injector.
    pub fn new(
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            transport,
            cache: None,
            config,
            injector: FailureInjector::from_entropy(),
            clock,
        }
    }

    /// Attaches a receipt cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn MessageCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replaces the failure injector.
    #[must_use]
    pub fn with_injector(mut self, injector: FailureInjector) -> Self {
        self.injector = injector;
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Store the engine writes to.
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Receipt cache, if one is attached.
    pub fn cache(&self) -> Option<&Arc<dyn MessageCache>> {
        self.cache.as_ref()
    }

    /// Fetches one batch of pending messages and delivers each in order.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StoreError` if the batch cannot be fetched.
    /// Per-message failures are reported in the outcomes, never as errors.
    pub async fn process_pending(&self, failure_probability: f64) -> Result<Vec<DeliveryOutcome>> {
        let messages = self.store.fetch_pending(self.config.batch_size).await.map_err(|e| {
            DeliveryError::store(format!("failed to fetch pending messages: {e}"))
        })?;

        if messages.is_empty() {
            debug!("no pending messages to process");
            return Ok(Vec::new());
        }

        info!(batch_size = messages.len(), "processing pending messages");

        let mut outcomes = Vec::with_capacity(messages.len());
        for message in &messages {
            outcomes.push(self.deliver(message, failure_probability).await);
        }
        Ok(outcomes)
    }

    /// Delivers one pending message.
    pub async fn deliver(&self, message: &Message, failure_probability: f64) -> DeliveryOutcome {
        let attempted_at = self.clock.now_utc();
        let id = message.id;

        if self.injector.should_fail(failure_probability) {
            warn!(message_id = %id, "simulated delivery failure");
            return self.fail(id, DeliveryError::ForcedFailure, attempted_at).await;
        }

        let content = truncate_content(&message.content, self.config.max_content_length);
        if let Cow::Owned(_) = content {
            warn!(
                message_id = %id,
                length = message.content.chars().count(),
                max_length = self.config.max_content_length,
                "message exceeds max content length, truncating"
            );
        }

        let receipt = match self.transport.send(&message.phone_number, &content).await {
            Ok(receipt) => receipt,
            Err(e) => {
                error!(
                    message_id = %id,
                    category = %ErrorCategory::from(&e),
                    error = %e,
                    "failed to send message"
                );
                return self.fail(id, e, attempted_at).await;
            },
        };

        if let Err(e) =
            self.store.mark_sent(id, receipt.message_id.clone(), attempted_at).await
        {
            error!(message_id = %id, error = %e, "failed to mark message as sent");
            return DeliveryOutcome::failed(id, DeliveryError::from(e), attempted_at);
        }

        if let Some(cache) = &self.cache {
            let entry =
                SentMessageCache { message_id: receipt.message_id.clone(), sent_at: attempted_at };
            if let Err(e) = cache.put(id, entry, self.config.cache_ttl).await {
                warn!(message_id = %id, error = %e, "failed to cache delivery receipt");
            }
        }

        info!(message_id = %id, delivery_id = %receipt.message_id, "message sent");
        DeliveryOutcome::sent(id, receipt.message_id, attempted_at)
    }

    async fn fail(
        &self,
        id: MessageId,
        cause: DeliveryError,
        attempted_at: DateTime<Utc>,
    ) -> DeliveryOutcome {
        if let Err(e) = self.store.mark_failed(id).await {
            error!(message_id = %id, error = %e, "failed to mark message as failed");
        }
        DeliveryOutcome::failed(id, cause, attempted_at)
    }

    /// Returns one failed message to the pending queue.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ReplayNotFound` if the message is absent or
    /// not failed.
    pub async fn replay_one(&self, id: MessageId) -> Result<()> {
        match self.store.replay_one(id).await {
            Ok(()) => {
                info!(message_id = %id, "replayed failed message");
                Ok(())
            },
            Err(e) if e.is_not_found() => Err(DeliveryError::ReplayNotFound { id: id.0 }),
            Err(e) => Err(DeliveryError::from(e)),
        }
    }

    /// Returns every failed message to the pending queue.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StoreError` if the update fails.
    pub async fn replay_all(&self) -> Result<u64> {
        let count = self.store.replay_all().await?;
        info!(count, "replayed failed messages");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{MessageStatus, TestClock};

    use super::*;
    use crate::{
        cache::mock::MockMessageCache, client::mock::MockTransport, storage::mock::MockMessageStore,
    };

    struct Harness {
        store: MockMessageStore,
        transport: MockTransport,
        cache: MockMessageCache,
        engine: DeliveryEngine,
    }

    fn harness(transport: MockTransport, max_content_length: usize) -> Harness {
        let store = MockMessageStore::new();
        let cache = MockMessageCache::new();
        let config = EngineConfig { batch_size: 2, max_content_length, ..Default::default() };
        let engine = DeliveryEngine::new(
            Arc::new(store.clone()),
            Arc::new(transport.clone()),
            config,
            Arc::new(TestClock::new()),
        )
        .with_cache(Arc::new(cache.clone()))
        .with_injector(FailureInjector::seeded(7));
        Harness { store, transport, cache, engine }
    }

    #[test]
    fn truncation_keeps_prefix_and_marker() {
        assert_eq!(truncate_content("0123456789ABCDEFGHIJ", 10), "0123456...");
        assert_eq!(truncate_content("short", 10), "short");
        assert_eq!(truncate_content("exactly10!", 10), "exactly10!");
    }

    #[test]
    fn truncation_without_room_for_marker() {
        assert_eq!(truncate_content("abcdef", 3), "abc");
        assert_eq!(truncate_content("abcdef", 2), "ab");
        assert_eq!(truncate_content("abcdef", 0), "");
    }

    #[test]
    fn truncation_respects_character_boundaries() {
        assert_eq!(truncate_content("çğüşöıÇĞÜŞ", 5), "çğ...");
    }

    #[test]
    fn injector_bounds() {
        let injector = FailureInjector::seeded(1);
        assert!((0..1000).all(|_| injector.should_fail(1.0)));
        assert!((0..1000).all(|_| !injector.should_fail(0.0)));
    }

    #[test]
    fn seeded_injectors_agree() {
        let a = FailureInjector::seeded(99);
        let b = FailureInjector::seeded(99);
        let left: Vec<bool> = (0..64).map(|_| a.should_fail(0.5)).collect();
        let right: Vec<bool> = (0..64).map(|_| b.should_fail(0.5)).collect();
        assert_eq!(left, right);
    }

    #[tokio::test]
    async fn forced_failure_skips_transport() {
        let h = harness(MockTransport::accepting(), 1000);
        let message = h.store.add_pending("hello", "+905551111111").await;

        let outcome = h.engine.deliver(&message, 1.0).await;

        assert!(!outcome.success);
        assert!(matches!(outcome.failure, Some(DeliveryError::ForcedFailure)));
        assert_eq!(h.transport.call_count(), 0);
        assert_eq!(h.store.message(message.id).await.unwrap().status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn successful_send_marks_sent_once_with_transport_id() {
        let h = harness(MockTransport::accepting(), 1000);
        h.transport.push_accept("wh-123");
        let message = h.store.add_pending("hello", "+905551111111").await;

        let outcome = h.engine.deliver(&message, 0.0).await;

        assert!(outcome.success);
        assert_eq!(outcome.delivery_id.as_deref(), Some("wh-123"));
        assert_eq!(h.store.mark_sent_calls().await, vec![(message.id, "wh-123".to_string())]);

        let stored = h.store.message(message.id).await.unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert!(stored.is_consistent());

        let (entry, ttl) = h.cache.entry(message.id).await.unwrap();
        assert_eq!(entry.message_id, "wh-123");
        assert_eq!(ttl, DEFAULT_CACHE_TTL);
    }

    #[tokio::test]
    async fn transport_receives_truncated_copy() {
        let h = harness(MockTransport::accepting(), 10);
        let message = h.store.add_pending("0123456789ABCDEFGHIJ", "+905551111111").await;

        h.engine.deliver(&message, 0.0).await;

        assert_eq!(h.transport.calls()[0].1, "0123456...");
        let stored = h.store.message(message.id).await.unwrap();
        assert_eq!(stored.content, "0123456789ABCDEFGHIJ");
    }

    #[tokio::test]
    async fn rejected_send_marks_failed() {
        let h = harness(MockTransport::rejecting(), 1000);
        let message = h.store.add_pending("hello", "+905551111111").await;

        let outcome = h.engine.deliver(&message, 0.0).await;

        assert!(!outcome.success);
        assert_eq!(h.store.mark_failed_calls().await, vec![message.id]);
        assert!(h.cache.is_empty().await);
    }

    #[tokio::test]
    async fn store_rejection_downgrades_success() {
        let h = harness(MockTransport::accepting(), 1000);
        let message = h.store.add_pending("hello", "+905551111111").await;
        h.store.inject_mark_sent_error("deadlock detected").await;

        let outcome = h.engine.deliver(&message, 0.0).await;

        assert!(!outcome.success);
        assert!(matches!(outcome.failure, Some(DeliveryError::StoreError { .. })));
        assert!(h.cache.is_empty().await);
        assert_eq!(h.store.message(message.id).await.unwrap().status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn mark_failed_error_still_reports_failure() {
        let h = harness(MockTransport::rejecting(), 1000);
        let message = h.store.add_pending("hello", "+905551111111").await;
        h.store.inject_mark_failed_error("connection reset").await;

        let outcome = h.engine.deliver(&message, 0.0).await;

        assert!(!outcome.success);
        assert!(matches!(outcome.failure, Some(DeliveryError::UnexpectedStatus { .. })));
    }

    #[tokio::test]
    async fn cache_failure_does_not_change_outcome() {
        let h = harness(MockTransport::accepting(), 1000);
        h.cache.fail_writes(true);
        let message = h.store.add_pending("hello", "+905551111111").await;

        let outcome = h.engine.deliver(&message, 0.0).await;

        assert!(outcome.success);
        assert_eq!(h.store.message(message.id).await.unwrap().status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn process_pending_is_bounded_by_batch_size() {
        let h = harness(MockTransport::accepting(), 1000);
        h.store.add_pending_batch(5).await;

        let outcomes = h.engine.process_pending(0.0).await.unwrap();

        assert_eq!(outcomes.len(), 2);
        assert_eq!(h.store.count_with_status(MessageStatus::Pending).await, 3);
        assert_eq!(outcomes[0].message_id, MessageId(1));
        assert_eq!(outcomes[1].message_id, MessageId(2));
    }

    #[tokio::test]
    async fn fetch_error_surfaces_as_store_error() {
        let h = harness(MockTransport::accepting(), 1000);
        h.store.inject_fetch_error("pool timed out").await;

        let err = h.engine.process_pending(0.0).await.unwrap_err();

        assert!(matches!(err, DeliveryError::StoreError { .. }));
    }

    #[tokio::test]
    async fn replay_one_rejects_sent_message() {
        let h = harness(MockTransport::accepting(), 1000);
        let message = h.store.add_pending("hello", "+905551111111").await;
        h.engine.deliver(&message, 0.0).await;

        let err = h.engine.replay_one(message.id).await.unwrap_err();

        assert!(matches!(err, DeliveryError::ReplayNotFound { id } if id == message.id.0));
        assert_eq!(h.store.message(message.id).await.unwrap().status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn replay_one_resets_failed_message() {
        let h = harness(MockTransport::accepting(), 1000);
        let message = h.store.add_pending("hello", "+905551111111").await;
        h.engine.deliver(&message, 1.0).await;

        h.engine.replay_one(message.id).await.unwrap();

        let stored = h.store.message(message.id).await.unwrap();
        assert_eq!(stored.status, MessageStatus::Pending);
        assert!(stored.is_consistent());
    }

    #[tokio::test]
    async fn replay_all_with_nothing_failed_is_zero() {
        let h = harness(MockTransport::accepting(), 1000);
        h.store.add_pending_batch(2).await;

        assert_eq!(h.engine.replay_all().await.unwrap(), 0);
        assert_eq!(h.store.count_with_status(MessageStatus::Pending).await, 2);
    }
}
