//! Post-delivery receipt cache.
//!
//! After a confirmed send the engine stores `{messageId, sentAt}` under
//! `sent_message:{id}` with a fixed expiry. The cache is optional and best
//! effort: nothing in the delivery path depends on a write succeeding.

use std::{collections::HashMap, future::Future, pin::Pin, time::Duration};

use courier_core::models::{MessageId, SentMessageCache};
use redis::aio::MultiplexedConnection;
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// Key prefix for cached delivery receipts.
pub const KEY_PREFIX: &str = "sent_message:";

/// Expiry applied to cached receipts.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const SCAN_BATCH: usize = 100;

/// Boxed future returned by cache operations.
pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Receipt cache operations.
pub trait MessageCache: Send + Sync + 'static {
    /// Stores a receipt for `id` that expires after `ttl`.
    fn put(&self, id: MessageId, entry: SentMessageCache, ttl: Duration) -> CacheFuture<'_, ()>;

    /// Returns every unexpired receipt.
    fn get_all(&self) -> CacheFuture<'_, HashMap<MessageId, SentMessageCache>>;

    /// Verifies the cache is reachable.
    fn ping(&self) -> CacheFuture<'_, ()>;
}

/// Builds the cache key for a message.
pub fn cache_key(id: MessageId) -> String {
    format!("{KEY_PREFIX}{id}")
}

/// Extracts the message id from a cache key.
pub fn parse_cache_key(key: &str) -> Option<MessageId> {
    key.strip_prefix(KEY_PREFIX)?.parse::<i64>().ok().map(MessageId)
}

/// Redis-backed receipt cache.
#[derive(Clone)]
pub struct RedisMessageCache {
    connection: MultiplexedConnection,
}

impl RedisMessageCache {
    /// Connects to Redis and verifies the connection with `PING`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::CacheError` if the URL is invalid or the
    /// server is unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| DeliveryError::cache(format!("invalid redis url: {e}")))?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| DeliveryError::cache(format!("failed to connect to redis: {e}")))?;

        let cache = Self { connection };
        cache.ping().await?;
        Ok(cache)
    }

    async fn scan_keys(&self) -> Result<Vec<String>> {
        let mut connection = self.connection.clone();
        let pattern = format!("{KEY_PREFIX}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, mut batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut connection)
                .await
                .map_err(|e| DeliveryError::cache(format!("scan failed: {e}")))?;
            keys.append(&mut batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }
}

impl MessageCache for RedisMessageCache {
    fn put(&self, id: MessageId, entry: SentMessageCache, ttl: Duration) -> CacheFuture<'_, ()> {
        Box::pin(async move {
            let value = serde_json::to_string(&entry)
                .map_err(|e| DeliveryError::cache(format!("failed to encode entry: {e}")))?;
            let mut connection = self.connection.clone();

            redis::cmd("SET")
                .arg(cache_key(id))
                .arg(value)
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async::<_, ()>(&mut connection)
                .await
                .map_err(|e| DeliveryError::cache(format!("set failed: {e}")))?;

            debug!(message_id = %id, "cached delivery receipt");
            Ok(())
        })
    }

    fn get_all(&self) -> CacheFuture<'_, HashMap<MessageId, SentMessageCache>> {
        Box::pin(async move {
            let keys = self.scan_keys().await?;
            let mut entries = HashMap::with_capacity(keys.len());
            if keys.is_empty() {
                return Ok(entries);
            }

            let mut connection = self.connection.clone();
            let values: Vec<Option<String>> = redis::cmd("MGET")
                .arg(&keys)
                .query_async(&mut connection)
                .await
                .map_err(|e| DeliveryError::cache(format!("mget failed: {e}")))?;

            for (key, value) in keys.iter().zip(values) {
                let (Some(id), Some(raw)) = (parse_cache_key(key), value) else {
                    continue;
                };
                match serde_json::from_str::<SentMessageCache>(&raw) {
                    Ok(entry) => {
                        entries.insert(id, entry);
                    },
                    Err(e) => warn!(key = %key, error = %e, "skipping malformed cache entry"),
                }
            }

            Ok(entries)
        })
    }

    fn ping(&self) -> CacheFuture<'_, ()> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            redis::cmd("PING")
                .query_async::<_, String>(&mut connection)
                .await
                .map(|_| ())
                .map_err(|e| DeliveryError::cache(format!("ping failed: {e}")))
        })
    }
}

pub mod mock {
    //! In-memory cache for tests.

    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use tokio::sync::RwLock;

    use super::{CacheFuture, MessageCache, MessageId, SentMessageCache};
    use crate::error::DeliveryError;

    /// Mock cache storing entries in a map and remembering each TTL.
    #[derive(Clone, Default)]
    pub struct MockMessageCache {
        entries: Arc<RwLock<HashMap<MessageId, (SentMessageCache, Duration)>>>,
        fail_writes: Arc<AtomicBool>,
        unreachable: Arc<AtomicBool>,
    }

    impl MockMessageCache {
        /// Creates an empty cache.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes every subsequent `put` fail.
        pub fn fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::Release);
        }

        /// Makes `ping` and `get_all` fail.
        pub fn set_unreachable(&self, unreachable: bool) {
            self.unreachable.store(unreachable, Ordering::Release);
        }

        /// Returns the entry and TTL stored for `id`.
        pub async fn entry(&self, id: MessageId) -> Option<(SentMessageCache, Duration)> {
            self.entries.read().await.get(&id).cloned()
        }

        /// Number of cached entries.
        pub async fn len(&self) -> usize {
            self.entries.read().await.len()
        }

        /// Returns true when nothing is cached.
        pub async fn is_empty(&self) -> bool {
            self.entries.read().await.is_empty()
        }
    }

    impl MessageCache for MockMessageCache {
        fn put(
            &self,
            id: MessageId,
            entry: SentMessageCache,
            ttl: Duration,
        ) -> CacheFuture<'_, ()> {
            Box::pin(async move {
                if self.fail_writes.load(Ordering::Acquire) {
                    return Err(DeliveryError::cache("write refused"));
                }
                self.entries.write().await.insert(id, (entry, ttl));
                Ok(())
            })
        }

        fn get_all(&self) -> CacheFuture<'_, HashMap<MessageId, SentMessageCache>> {
            Box::pin(async move {
                if self.unreachable.load(Ordering::Acquire) {
                    return Err(DeliveryError::cache("connection refused"));
                }
                Ok(self
                    .entries
                    .read()
                    .await
                    .iter()
                    .map(|(id, (entry, _))| (*id, entry.clone()))
                    .collect())
            })
        }

        fn ping(&self) -> CacheFuture<'_, ()> {
            Box::pin(async move {
                if self.unreachable.load(Ordering::Acquire) {
                    return Err(DeliveryError::cache("connection refused"));
                }
                Ok(())
            })
        }
    }
}
