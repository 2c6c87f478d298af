//! Repository for message database operations.
//!
//! Status transitions are expressed as conditional updates on the expected
//! prior status. A transition that matches no row reports
//! `CoreError::NotFound` instead of silently succeeding.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres};

use crate::{
    error::{CoreError, Result},
    models::{Message, MessageId, MessageStats, MessageStatus, PageRequest},
};

const MESSAGE_COLUMNS: &str =
    "id, content, phone_number, status, message_id, sent_at, created_at, updated_at";

/// Repository for message database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Fetches up to `limit` pending messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn fetch_pending(&self, limit: usize) -> Result<Vec<Message>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let messages = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(messages)
    }

    /// Records a confirmed delivery.
    ///
    /// Only a pending message can become sent.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no pending message has this id.
    pub async fn mark_sent(
        &self,
        id: MessageId,
        delivery_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'sent', message_id = $1, sent_at = $2, updated_at = NOW()
            WHERE id = $3 AND status = 'pending'
            "#,
        )
        .bind(delivery_id)
        .bind(sent_at)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("no pending message found with id {id}")));
        }

        Ok(())
    }

    /// Records a failed delivery.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no pending message has this id.
    pub async fn mark_failed(&self, id: MessageId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'failed', message_id = NULL, sent_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("no pending message found with id {id}")));
        }

        Ok(())
    }

    /// Returns one failed message to the pending queue.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the message does not exist or is not
    /// currently failed.
    pub async fn replay_failed(&self, id: MessageId) -> Result<()> {
        let affected = self.replay_impl(&*self.pool, Some(id)).await?;

        if affected == 0 {
            return Err(CoreError::NotFound(format!("no failed message found with id {id}")));
        }

        Ok(())
    }

    /// Returns every failed message to the pending queue.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn replay_all_failed(&self) -> Result<u64> {
        self.replay_impl(&*self.pool, None).await
    }

    /// Shared replay statement; `None` targets every failed row.
    async fn replay_impl<'e, E>(&self, executor: E, id: Option<MessageId>) -> Result<u64>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'pending', message_id = NULL, sent_at = NULL, updated_at = NOW()
            WHERE status = 'failed' AND ($1::BIGINT IS NULL OR id = $1)
            "#,
        )
        .bind(id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected())
    }

    /// Inserts a new pending message.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create(&self, content: &str, phone_number: &str) -> Result<Message> {
        let message = sqlx::query_as::<_, Message>(&format!(
            r#"
            INSERT INTO messages (content, phone_number, status)
            VALUES ($1, $2, 'pending')
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(content)
        .bind(phone_number)
        .fetch_one(&*self.pool)
        .await?;

        Ok(message)
    }

    /// Finds a message by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(message)
    }

    /// Lists messages newest first, optionally filtered by status.
    ///
    /// Returns the page together with the unpaged row count.
    ///
    /// # Errors
    ///
    /// Returns error if either query fails.
    pub async fn find_all(
        &self,
        status: Option<MessageStatus>,
        page: PageRequest,
    ) -> Result<(Vec<Message>, i64)> {
        let status = status.map(|s| s.as_str());

        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE ($1::TEXT IS NULL OR status = $1)
            "#,
        )
        .bind(status)
        .fetch_one(&*self.pool)
        .await?;

        let messages = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(status)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&*self.pool)
        .await?;

        Ok((messages, total))
    }

    /// Lists sent messages, most recently sent first.
    ///
    /// # Errors
    ///
    /// Returns error if either query fails.
    pub async fn find_sent(&self, page: PageRequest) -> Result<(Vec<Message>, i64)> {
        let (total,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE status = 'sent'")
                .fetch_one(&*self.pool)
                .await?;

        let messages = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE status = 'sent'
            ORDER BY sent_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#
        ))
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&*self.pool)
        .await?;

        Ok((messages, total))
    }

    /// Counts messages per status in a single statement.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn stats(&self) -> Result<MessageStats> {
        let (pending, sent, failed): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending'),
                COUNT(*) FILTER (WHERE status = 'sent'),
                COUNT(*) FILTER (WHERE status = 'failed')
            FROM messages
            "#,
        )
        .fetch_one(&*self.pool)
        .await?;

        Ok(MessageStats::new(pending, sent, failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool));
    }

    #[test]
    fn column_list_matches_model_fields() {
        for column in
            ["id", "content", "phone_number", "status", "message_id", "sent_at", "created_at"]
        {
            assert!(MESSAGE_COLUMNS.contains(column), "missing column {column}");
        }
    }
}
