//! Storage abstraction layer for the delivery engine.
//!
//! Provides a trait over message persistence so delivery, scheduling and
//! replay logic can be tested without a database. Production code wraps
//! `courier_core::storage::Storage`; tests use the in-memory [`mock`] store.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result,
    models::{Message, MessageId, MessageStats, MessageStatus, Page, PageRequest},
};

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Message persistence operations used by the delivery pipeline and API.
///
/// Every status transition is atomic and conditional on the expected prior
/// status. Implementations must be safe for concurrent use: the scheduler
/// loop and request handlers call into the same store.
pub trait MessageStore: Send + Sync + 'static {
    /// Fetches up to `limit` pending messages, oldest first.
    fn fetch_pending(&self, limit: usize) -> StoreFuture<'_, Vec<Message>>;

    /// Transitions a pending message to sent with its delivery receipt.
    fn mark_sent(
        &self,
        id: MessageId,
        delivery_id: String,
        sent_at: DateTime<Utc>,
    ) -> StoreFuture<'_, ()>;

    /// Transitions a pending message to failed.
    fn mark_failed(&self, id: MessageId) -> StoreFuture<'_, ()>;

    /// Transitions one failed message back to pending.
    ///
    /// Fails with `CoreError::NotFound` when the message is absent or not
    /// failed, leaving all rows untouched.
    fn replay_one(&self, id: MessageId) -> StoreFuture<'_, ()>;

    /// Transitions every failed message back to pending, returning the count.
    fn replay_all(&self) -> StoreFuture<'_, u64>;

    /// Inserts a new pending message.
    fn create(&self, content: String, phone_number: String) -> StoreFuture<'_, Message>;

    /// Finds a message by id.
    fn find_by_id(&self, id: MessageId) -> StoreFuture<'_, Option<Message>>;

    /// Lists messages newest first, optionally filtered by status.
    fn find_all(
        &self,
        status: Option<MessageStatus>,
        page: PageRequest,
    ) -> StoreFuture<'_, Page<Message>>;

    /// Lists sent messages, most recently sent first.
    fn find_sent(&self, page: PageRequest) -> StoreFuture<'_, Page<Message>>;

    /// Counts messages per status.
    fn stats(&self) -> StoreFuture<'_, MessageStats>;

    /// Verifies the backing store is reachable.
    fn health_check(&self) -> StoreFuture<'_, ()>;
}

/// Production store backed by PostgreSQL.
pub struct PostgresMessageStore {
    storage: Arc<courier_core::storage::Storage>,
}

impl PostgresMessageStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(storage: Arc<courier_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl MessageStore for PostgresMessageStore {
    fn fetch_pending(&self, limit: usize) -> StoreFuture<'_, Vec<Message>> {
        Box::pin(async move { self.storage.messages.fetch_pending(limit).await })
    }

    fn mark_sent(
        &self,
        id: MessageId,
        delivery_id: String,
        sent_at: DateTime<Utc>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.messages.mark_sent(id, &delivery_id, sent_at).await })
    }

    fn mark_failed(&self, id: MessageId) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.messages.mark_failed(id).await })
    }

    fn replay_one(&self, id: MessageId) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.messages.replay_failed(id).await })
    }

    fn replay_all(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move { self.storage.messages.replay_all_failed().await })
    }

    fn create(&self, content: String, phone_number: String) -> StoreFuture<'_, Message> {
        Box::pin(async move { self.storage.messages.create(&content, &phone_number).await })
    }

    fn find_by_id(&self, id: MessageId) -> StoreFuture<'_, Option<Message>> {
        Box::pin(async move { self.storage.messages.find_by_id(id).await })
    }

    fn find_all(
        &self,
        status: Option<MessageStatus>,
        page: PageRequest,
    ) -> StoreFuture<'_, Page<Message>> {
        Box::pin(async move {
            let (items, total_count) = self.storage.messages.find_all(status, page).await?;
            Ok(Page { items, request: page, total_count })
        })
    }

    fn find_sent(&self, page: PageRequest) -> StoreFuture<'_, Page<Message>> {
        Box::pin(async move {
            let (items, total_count) = self.storage.messages.find_sent(page).await?;
            Ok(Page { items, request: page, total_count })
        })
    }

    fn stats(&self) -> StoreFuture<'_, MessageStats> {
        Box::pin(async move { self.storage.messages.stats().await })
    }

    fn health_check(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.health_check().await })
    }
}

pub mod mock {
    //! In-memory store for tests.
    //!
    //! Mirrors the conditional-update semantics of the PostgreSQL repository
    //! and records every status transition for verification. Errors can be
    //! injected per operation.

    use std::{
        collections::BTreeMap,
        sync::{
            atomic::{AtomicBool, AtomicI64, Ordering},
            Arc,
        },
    };

    use chrono::{DateTime, Duration, Utc};
    use courier_core::{error::CoreError, models::MessageStats};
    use tokio::sync::RwLock;

    use super::{Message, MessageId, MessageStatus, MessageStore, Page, PageRequest, StoreFuture};

    /// Mock store holding messages in memory.
    #[derive(Clone)]
    pub struct MockMessageStore {
        messages: Arc<RwLock<BTreeMap<MessageId, Message>>>,
        next_id: Arc<AtomicI64>,
        epoch: DateTime<Utc>,
        fetch_error: Arc<RwLock<Option<String>>>,
        mark_sent_error: Arc<RwLock<Option<String>>>,
        mark_failed_error: Arc<RwLock<Option<String>>>,
        sent_calls: Arc<RwLock<Vec<(MessageId, String)>>>,
        failed_calls: Arc<RwLock<Vec<MessageId>>>,
        unhealthy: Arc<AtomicBool>,
    }

    impl MockMessageStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self {
                messages: Arc::new(RwLock::new(BTreeMap::new())),
                next_id: Arc::new(AtomicI64::new(1)),
                epoch: Utc::now(),
                fetch_error: Arc::new(RwLock::new(None)),
                mark_sent_error: Arc::new(RwLock::new(None)),
                mark_failed_error: Arc::new(RwLock::new(None)),
                sent_calls: Arc::new(RwLock::new(Vec::new())),
                failed_calls: Arc::new(RwLock::new(Vec::new())),
                unhealthy: Arc::new(AtomicBool::new(false)),
            }
        }

        /// Inserts a pending message and returns it.
        ///
        /// Creation times increase with every insert so fetch order matches
        /// insertion order.
        pub async fn add_pending(&self, content: &str, phone_number: &str) -> Message {
            let raw_id = self.next_id.fetch_add(1, Ordering::AcqRel);
            let created_at = self.epoch + Duration::seconds(raw_id);
            let message = Message {
                id: MessageId(raw_id),
                content: content.to_string(),
                phone_number: phone_number.to_string(),
                status: MessageStatus::Pending,
                message_id: None,
                sent_at: None,
                created_at,
                updated_at: created_at,
            };
            self.messages.write().await.insert(message.id, message.clone());
            message
        }

        /// Inserts `count` pending messages with generated content.
        pub async fn add_pending_batch(&self, count: usize) -> Vec<Message> {
            let mut added = Vec::with_capacity(count);
            for i in 0..count {
                added.push(self.add_pending(&format!("message {i}"), "+905550000000").await);
            }
            added
        }

        /// Inserts a message in an arbitrary state, keeping its id.
        pub async fn insert(&self, message: Message) {
            self.next_id.fetch_max(message.id.0 + 1, Ordering::AcqRel);
            self.messages.write().await.insert(message.id, message);
        }

        /// Returns a snapshot of one message.
        pub async fn message(&self, id: MessageId) -> Option<Message> {
            self.messages.read().await.get(&id).cloned()
        }

        /// Returns a snapshot of every message ordered by id.
        pub async fn all_messages(&self) -> Vec<Message> {
            self.messages.read().await.values().cloned().collect()
        }

        /// Returns the number of messages in a status.
        pub async fn count_with_status(&self, status: MessageStatus) -> usize {
            self.messages.read().await.values().filter(|m| m.status == status).count()
        }

        /// Injects an error for the next fetch.
        pub async fn inject_fetch_error(&self, error: impl Into<String>) {
            *self.fetch_error.write().await = Some(error.into());
        }

        /// Injects an error for the next mark-sent.
        pub async fn inject_mark_sent_error(&self, error: impl Into<String>) {
            *self.mark_sent_error.write().await = Some(error.into());
        }

        /// Injects an error for the next mark-failed.
        pub async fn inject_mark_failed_error(&self, error: impl Into<String>) {
            *self.mark_failed_error.write().await = Some(error.into());
        }

        /// Makes health checks fail.
        pub fn set_unhealthy(&self, unhealthy: bool) {
            self.unhealthy.store(unhealthy, Ordering::Release);
        }

        /// Every mark-sent call received, successful or not.
        pub async fn mark_sent_calls(&self) -> Vec<(MessageId, String)> {
            self.sent_calls.read().await.clone()
        }

        /// Every mark-failed call received, successful or not.
        pub async fn mark_failed_calls(&self) -> Vec<MessageId> {
            self.failed_calls.read().await.clone()
        }

        fn paginate(mut rows: Vec<Message>, page: PageRequest) -> Page<Message> {
            let total_count = i64::try_from(rows.len()).unwrap_or(i64::MAX);
            let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
            let limit = usize::try_from(page.limit()).unwrap_or(usize::MAX);
            let items = if offset >= rows.len() {
                Vec::new()
            } else {
                rows.drain(offset..).take(limit).collect()
            };
            Page { items, request: page, total_count }
        }

        fn transition(
            message: &mut Message,
            from: MessageStatus,
            to: MessageStatus,
            receipt: Option<(String, DateTime<Utc>)>,
        ) -> bool {
            if message.status != from {
                return false;
            }
            message.status = to;
            match receipt {
                Some((delivery_id, sent_at)) => {
                    message.message_id = Some(delivery_id);
                    message.sent_at = Some(sent_at);
                },
                None => {
                    message.message_id = None;
                    message.sent_at = None;
                },
            }
            message.updated_at = Utc::now();
            true
        }
    }

    impl Default for MockMessageStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MessageStore for MockMessageStore {
        fn fetch_pending(&self, limit: usize) -> StoreFuture<'_, Vec<Message>> {
            Box::pin(async move {
                if let Some(error) = self.fetch_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }

                let mut pending: Vec<Message> = self
                    .messages
                    .read()
                    .await
                    .values()
                    .filter(|m| m.status == MessageStatus::Pending)
                    .cloned()
                    .collect();
                pending.sort_by_key(|m| (m.created_at, m.id));
                pending.truncate(limit);
                Ok(pending)
            })
        }

        fn mark_sent(
            &self,
            id: MessageId,
            delivery_id: String,
            sent_at: DateTime<Utc>,
        ) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.sent_calls.write().await.push((id, delivery_id.clone()));

                if let Some(error) = self.mark_sent_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }

                let mut messages = self.messages.write().await;
                let updated = messages.get_mut(&id).is_some_and(|m| {
                    Self::transition(
                        m,
                        MessageStatus::Pending,
                        MessageStatus::Sent,
                        Some((delivery_id, sent_at)),
                    )
                });
                if updated {
                    Ok(())
                } else {
                    Err(CoreError::NotFound(format!("no pending message found with id {id}")))
                }
            })
        }

        fn mark_failed(&self, id: MessageId) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.failed_calls.write().await.push(id);

                if let Some(error) = self.mark_failed_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }

                let mut messages = self.messages.write().await;
                let updated = messages.get_mut(&id).is_some_and(|m| {
                    Self::transition(m, MessageStatus::Pending, MessageStatus::Failed, None)
                });
                if updated {
                    Ok(())
                } else {
                    Err(CoreError::NotFound(format!("no pending message found with id {id}")))
                }
            })
        }

        fn replay_one(&self, id: MessageId) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                let mut messages = self.messages.write().await;
                let updated = messages.get_mut(&id).is_some_and(|m| {
                    Self::transition(m, MessageStatus::Failed, MessageStatus::Pending, None)
                });
                if updated {
                    Ok(())
                } else {
                    Err(CoreError::NotFound(format!("no failed message found with id {id}")))
                }
            })
        }

        fn replay_all(&self) -> StoreFuture<'_, u64> {
            Box::pin(async move {
                let mut messages = self.messages.write().await;
                let mut count = 0;
                for message in messages.values_mut() {
                    if Self::transition(message, MessageStatus::Failed, MessageStatus::Pending, None)
                    {
                        count += 1;
                    }
                }
                Ok(count)
            })
        }

        fn create(&self, content: String, phone_number: String) -> StoreFuture<'_, Message> {
            Box::pin(async move { Ok(self.add_pending(&content, &phone_number).await) })
        }

        fn find_by_id(&self, id: MessageId) -> StoreFuture<'_, Option<Message>> {
            Box::pin(async move { Ok(self.message(id).await) })
        }

        fn find_all(
            &self,
            status: Option<MessageStatus>,
            page: PageRequest,
        ) -> StoreFuture<'_, Page<Message>> {
            Box::pin(async move {
                let mut rows: Vec<Message> = self
                    .messages
                    .read()
                    .await
                    .values()
                    .filter(|m| status.is_none_or(|s| m.status == s))
                    .cloned()
                    .collect();
                rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
                Ok(Self::paginate(rows, page))
            })
        }

        fn find_sent(&self, page: PageRequest) -> StoreFuture<'_, Page<Message>> {
            Box::pin(async move {
                let mut rows: Vec<Message> = self
                    .messages
                    .read()
                    .await
                    .values()
                    .filter(|m| m.status == MessageStatus::Sent)
                    .cloned()
                    .collect();
                rows.sort_by(|a, b| (b.sent_at, b.id).cmp(&(a.sent_at, a.id)));
                Ok(Self::paginate(rows, page))
            })
        }

        fn stats(&self) -> StoreFuture<'_, MessageStats> {
            Box::pin(async move {
                let messages = self.messages.read().await;
                let count = |status: MessageStatus| {
                    let n = messages.values().filter(|m| m.status == status).count();
                    i64::try_from(n).unwrap_or(i64::MAX)
                };
                Ok(MessageStats::new(
                    count(MessageStatus::Pending),
                    count(MessageStatus::Sent),
                    count(MessageStatus::Failed),
                ))
            })
        }

        fn health_check(&self) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                if self.unhealthy.load(Ordering::Acquire) {
                    return Err(CoreError::Database("connection refused".to_string()));
                }
                Ok(())
            })
        }
    }
}
