//! Message operations used by the HTTP API.

use std::{collections::HashMap, sync::Arc};

use courier_core::models::{
    Message, MessageId, MessageStats, MessageStatus, Page, PageRequest, SentMessageCache,
};
use tracing::{debug, info};

use crate::{
    engine::DeliveryEngine,
    error::{DeliveryError, Result},
};

/// Application-level message operations.
///
/// Reads and replays go through the same store and cache as the delivery
/// engine, so a replayed message is picked up by the next scheduler pass.
#[derive(Clone)]
pub struct MessageService {
    engine: Arc<DeliveryEngine>,
}

impl MessageService {
    /// Creates a service sharing the engine's store and cache.
    pub fn new(engine: Arc<DeliveryEngine>) -> Self {
        Self { engine }
    }

    /// Longest accepted content, in characters.
    pub fn max_content_length(&self) -> usize {
        self.engine.config().max_content_length
    }

    /// Validates and queues a new message.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidInput` for empty fields or content
    /// longer than the configured maximum.
    pub async fn create(&self, content: String, phone_number: String) -> Result<Message> {
        if content.trim().is_empty() {
            return Err(DeliveryError::invalid_input("content is required"));
        }
        if phone_number.trim().is_empty() {
            return Err(DeliveryError::invalid_input("phone number is required"));
        }
        let max = self.max_content_length();
        if content.chars().count() > max {
            return Err(DeliveryError::invalid_input(format!(
                "content exceeds maximum length of {max} characters"
            )));
        }

        let message = self.engine.store().create(content, phone_number).await?;
        info!(message_id = %message.id, "message created");
        Ok(message)
    }

    /// Lists messages newest first.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StoreError` if the query fails.
    pub async fn list(
        &self,
        status: Option<MessageStatus>,
        page: PageRequest,
    ) -> Result<Page<Message>> {
        Ok(self.engine.store().find_all(status, page).await?)
    }

    /// Lists sent messages, most recently sent first.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StoreError` if the query fails.
    pub async fn sent(&self, page: PageRequest) -> Result<Page<Message>> {
        Ok(self.engine.store().find_sent(page).await?)
    }

    /// Counts messages per status.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StoreError` if the query fails.
    pub async fn stats(&self) -> Result<MessageStats> {
        Ok(self.engine.store().stats().await?)
    }

    /// Returns every cached delivery receipt.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::CacheNotConfigured` when no cache is attached
    /// and `DeliveryError::CacheError` when it cannot be read.
    pub async fn cached(&self) -> Result<HashMap<MessageId, SentMessageCache>> {
        let cache = self.engine.cache().ok_or(DeliveryError::CacheNotConfigured)?;
        let entries = cache.get_all().await?;
        debug!(count = entries.len(), "read cached receipts");
        Ok(entries)
    }

    /// Returns one failed message to the pending queue.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ReplayNotFound` if the message is absent or
    /// not failed.
    pub async fn replay_one(&self, id: MessageId) -> Result<()> {
        self.engine.replay_one(id).await
    }

    /// Returns every failed message to the pending queue.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StoreError` if the update fails.
    pub async fn replay_all(&self) -> Result<u64> {
        self.engine.replay_all().await
    }

    /// Checks the store, returning the failure text if it is down.
    pub async fn store_health(&self) -> std::result::Result<(), String> {
        self.engine.store().health_check().await.map_err(|e| e.to_string())
    }

    /// Checks the cache. `None` when no cache is attached.
    pub async fn cache_health(&self) -> Option<std::result::Result<(), String>> {
        let cache = self.engine.cache()?;
        Some(cache.ping().await.map_err(|e| e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use courier_core::TestClock;

    use super::*;
    use crate::{
        cache::{mock::MockMessageCache, MessageCache},
        client::mock::MockTransport,
        engine::EngineConfig,
        storage::mock::MockMessageStore,
    };

    fn service(store: &MockMessageStore, cache: Option<MockMessageCache>) -> MessageService {
        let mut engine = DeliveryEngine::new(
            Arc::new(store.clone()),
            Arc::new(MockTransport::accepting()),
            EngineConfig { max_content_length: 10, ..Default::default() },
            Arc::new(TestClock::new()),
        );
        if let Some(cache) = cache {
            engine = engine.with_cache(Arc::new(cache));
        }
        MessageService::new(Arc::new(engine))
    }

    #[tokio::test]
    async fn create_queues_pending_message() {
        let store = MockMessageStore::new();
        let svc = service(&store, None);

        let message = svc.create("hi".into(), "+905551111111".into()).await.unwrap();

        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(store.all_messages().await.len(), 1);
    }

    #[tokio::test]
    async fn create_validates_input() {
        let store = MockMessageStore::new();
        let svc = service(&store, None);

        let too_long = svc.create("x".repeat(11), "+90".into()).await.unwrap_err();
        assert_eq!(
            too_long.to_string(),
            "invalid input: content exceeds maximum length of 10 characters"
        );
        assert!(svc.create("   ".into(), "+90".into()).await.is_err());
        assert!(svc.create("hi".into(), String::new()).await.is_err());
        assert!(store.all_messages().await.is_empty());
    }

    #[tokio::test]
    async fn cached_without_cache_is_not_configured() {
        let svc = service(&MockMessageStore::new(), None);

        assert!(matches!(svc.cached().await, Err(DeliveryError::CacheNotConfigured)));
        assert!(svc.cache_health().await.is_none());
    }

    #[tokio::test]
    async fn cached_returns_entries() {
        let cache = MockMessageCache::new();
        let entry = SentMessageCache { message_id: "abc".into(), sent_at: chrono::Utc::now() };
        cache
            .put(MessageId(4), entry.clone(), std::time::Duration::from_secs(60))
            .await
            .unwrap();
        let svc = service(&MockMessageStore::new(), Some(cache));

        let entries = svc.cached().await.unwrap();

        assert_eq!(entries.get(&MessageId(4)), Some(&entry));
    }

    #[tokio::test]
    async fn stats_counts_by_status() {
        let store = MockMessageStore::new();
        store.add_pending_batch(3).await;
        let svc = service(&store, None);

        let stats = svc.stats().await.unwrap();

        assert_eq!(stats.pending, 3);
        assert_eq!(stats.total, 3);
    }
}
