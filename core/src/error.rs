//! Error types shared across the voteflow crates.
//!
//! One enum per layer: locks, stores, bus, and the service-level
//! [`VoteError`] that the API surface reports. Lock contention is not an
//! error anywhere; `acquire` returns `Ok(false)` and callers skip the tick.

use thiserror::Error;

/// Errors from a distributed lock backend.
#[derive(Debug, Clone, Error)]
pub enum LockError {
    /// The caller already holds this lock; double-acquire is a bug in the
    /// caller, not contention.
    #[error("lock '{0}' is already held by this instance")]
    AlreadyHeld(String),

    /// A refresh was issued for a lock this instance does not hold.
    #[error("lock '{0}' is not held by this instance")]
    NotHeld(String),

    /// Transport or coordination-store failure.
    #[error("lock transport error: {0}")]
    Transport(String),
}

/// Errors from the fast or durable storage tiers.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A ticket record exists but is missing required fields.
    #[error("ticket record corrupt: {0}")]
    Corrupt(String),

    /// The ticket has no remaining usages.
    #[error("ticket {version} has no remaining usages")]
    Exhausted {
        /// The exhausted ticket's version.
        version: String,
    },

    /// A tally increment named a user with no `user_votes` row.
    #[error("unknown user: {0}")]
    UnknownUser(String),

    /// A stored blob failed to encode or decode.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Timeout or transport failure talking to the store.
    #[error("store transport error: {0}")]
    Transport(String),
}

impl StoreError {
    /// Whether this error is transient and worth a bounded retry, as opposed
    /// to a permanent rejection of the operation.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Errors from the event bus.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// A publish did not reach the log.
    #[error("publish to '{topic}' failed: {reason}")]
    Publish {
        /// Target topic.
        topic: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// Consumer setup failed.
    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe {
        /// Target topic.
        topic: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// A consumed payload was not a valid vote event.
    #[error("event decode failed: {0}")]
    Decode(String),

    /// Transport failure talking to the brokers.
    #[error("bus transport error: {0}")]
    Transport(String),
}

/// Service-level error surfaced by the vote and ticket operations.
#[derive(Debug, Error)]
pub enum VoteError {
    /// Bad request input; never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The presented ticket version is no longer the latest.
    #[error("ticket version {presented} superseded by {latest}")]
    TicketExpired {
        /// Version the client presented.
        presented: String,
        /// Current latest version.
        latest: String,
    },

    /// The presented ticket value does not match the stored record.
    #[error("ticket value does not match the stored ticket")]
    TicketRejected,

    /// No ticket has been minted yet.
    #[error("no ticket is currently available")]
    NoTicket,

    /// Failure in one of the storage tiers.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failure on the event bus.
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl VoteError {
    /// Whether this error belongs in the client-facing `VoteResponse`
    /// (`success = false` with a message) rather than a protocol error.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_)
                | Self::TicketExpired { .. }
                | Self::TicketRejected
                | Self::NoTicket
                | Self::Store(StoreError::Exhausted { .. })
                | Self::Store(StoreError::Corrupt(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_is_a_rejection_not_a_protocol_error() {
        let err = VoteError::from(StoreError::Exhausted {
            version: "1".to_string(),
        });
        assert!(err.is_rejection());
    }

    #[test]
    fn transport_failures_are_not_rejections() {
        let err = VoteError::from(StoreError::Transport("timeout".to_string()));
        assert!(!err.is_rejection());
    }

    #[test]
    fn only_transport_store_errors_are_transient() {
        assert!(StoreError::Transport("t".to_string()).is_transient());
        assert!(!StoreError::NotFound("x".to_string()).is_transient());
        assert!(!StoreError::Exhausted {
            version: "1".to_string()
        }
        .is_transient());
    }
}
