//! Event bus seams: publishing, handling, and the dead-letter sink.
//!
//! The bus carries [`VoteEvent`]s with at-least-once delivery and per-key
//! ordering. Publishing failures are survivable (the vote service falls back
//! to synchronous settlement); handling failures are retried a bounded
//! number of times and then handed to the [`DeadLetterSink`] so the
//! partition keeps moving.

use crate::error::{BusError, StoreError, VoteError};
use crate::model::VoteEvent;
use async_trait::async_trait;

/// Producer side of the vote-event log.
#[async_trait]
pub trait VotePublisher: Send + Sync {
    /// Append `event` to the log, keyed by [`VoteEvent::partition_key`].
    ///
    /// # Errors
    ///
    /// [`BusError::Publish`] when the record did not reach the log; callers
    /// treat this as the trigger for synchronous settlement.
    async fn publish(&self, event: &VoteEvent) -> Result<(), BusError>;
}

/// Consumer-side processing of one delivered vote event.
#[async_trait]
pub trait VoteEventHandler: Send + Sync {
    /// Settle one event. Must tolerate duplicate delivery.
    ///
    /// # Errors
    ///
    /// Any error is retried by the worker per its policy, then dead-lettered.
    async fn handle(&self, event: &VoteEvent) -> Result<(), VoteError>;
}

/// Terminal parking lot for events whose settlement exhausted its retries.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Record the failed event with its final error and the attempt count.
    ///
    /// # Errors
    ///
    /// Propagates the sink's storage failure; the caller logs it (there is
    /// nowhere further to escalate).
    async fn record(&self, event: &VoteEvent, error: &str, attempts: u32)
        -> Result<(), StoreError>;
}
