//! Dead-letter storage for vote events that could not be settled.
//!
//! A consumer worker that exhausts its retry budget on an event records it
//! here before advancing the offset, so the partition keeps moving and the
//! vote is recoverable by hand instead of silently lost.

use async_trait::async_trait;
use sqlx::mysql::MySqlPool;
use tracing::error;
use voteflow_core::model::VoteEvent;
use voteflow_core::{DeadLetterSink, StoreError};

/// MySQL-backed dead-letter queue for failed vote events.
#[derive(Clone)]
pub struct MySqlDeadLetterQueue {
    pool: MySqlPool,
}

impl MySqlDeadLetterQueue {
    /// Use the given pool (normally the durable store's master pool).
    #[must_use]
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterSink for MySqlDeadLetterQueue {
    async fn record(
        &self,
        event: &VoteEvent,
        error_message: &str,
        attempts: u32,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            "INSERT INTO vote_event_dlq (payload, error, retry_count) VALUES (?, ?, ?)",
        )
        .bind(&payload)
        .bind(error_message)
        .bind(attempts)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            // This is the path of last resort; make the loss loud.
            error!(ticket_version = %event.ticket_version, error = %e, "dead-letter insert failed");
            StoreError::Transport(e.to_string())
        })?;
        Ok(())
    }
}
