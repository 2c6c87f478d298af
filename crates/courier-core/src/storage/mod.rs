//! Database access layer implementing the repository pattern for message
//! persistence.
//!
//! The repository translates between domain models and the `messages` table.
//! Every status transition is a single conditional `UPDATE`, so concurrent
//! replays and scheduler passes cannot interleave into an inconsistent row.

use std::sync::Arc;

use sqlx::PgPool;

pub mod messages;

use crate::error::Result;

/// Container for repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for message operations.
    pub messages: Arc<messages::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self { messages: Arc::new(messages::Repository::new(pool)) }
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.messages.pool()).await?;

        Ok(())
    }
}
