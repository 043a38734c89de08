//! Domain types for tickets, tallies, and vote events.
//!
//! Field names serialize in camelCase so the cached JSON blobs and the bus
//! payloads match the shapes the HTTP API exposes. All timestamps are UTC
//! and render as RFC 3339.

use crate::error::VoteError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A short-lived voting credential with bounded usage.
///
/// Tickets are minted by the elected producer on a fixed cadence. A ticket
/// is spendable iff its `version` equals the latest-version pointer, its
/// `value` matches the stored record, and `remaining_usages > 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    /// 16 bytes of cryptographic randomness, hex-encoded.
    pub value: String,
    /// Nanosecond-timestamp version string; unique and monotone, the
    /// primary key everywhere.
    pub version: String,
    /// Uses left on this ticket; non-increasing over its lifetime.
    pub remaining_usages: i32,
    /// Instant after which the ticket is no longer current.
    pub expires_at: DateTime<Utc>,
    /// Mint instant.
    pub created_at: DateTime<Utc>,
}

/// Durable per-user tally row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserVote {
    /// Single uppercase letter A-Z.
    pub username: String,
    /// Number of successfully settled vote events naming this user.
    pub votes: i64,
    /// Last settlement instant.
    pub updated_at: DateTime<Utc>,
}

/// Archive row written when a mint supersedes the previous ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketHistory {
    /// Version of the superseded ticket.
    pub version: String,
    /// Its hex value.
    pub ticket_value: String,
    /// When it was minted.
    pub created_at: DateTime<Utc>,
    /// When it was superseded.
    pub expired_at: DateTime<Utc>,
}

/// A vote spent against a ticket, published to the event bus.
///
/// Immutable once emitted. The first username doubles as the partition key
/// so all events for a voter settle in publication order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteEvent {
    /// Voters named by this event; non-empty, each a single A-Z letter.
    pub usernames: Vec<String>,
    /// Version of the ticket this vote spent.
    pub ticket_version: String,
    /// Emission instant.
    pub voted_at: DateTime<Utc>,
}

impl VoteEvent {
    /// The bus partition key: the first username, or the ticket version when
    /// the username list is empty.
    #[must_use]
    pub fn partition_key(&self) -> &str {
        self.usernames
            .first()
            .map_or(self.ticket_version.as_str(), String::as_str)
    }
}

/// An incoming vote: the voters plus the ticket that pays for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    /// Voters to credit.
    pub usernames: Vec<String>,
    /// The ticket presented by the client.
    pub ticket: Ticket,
}

/// Outcome of a vote attempt as surfaced to clients.
///
/// Validation failures are reported here with `success = false` rather than
/// as a protocol error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    /// Whether the vote was accepted.
    pub success: bool,
    /// Human-readable outcome.
    pub message: String,
    /// The usernames the client attempted to credit.
    pub usernames: Vec<String>,
    /// Response instant.
    pub timestamp: DateTime<Utc>,
}

impl VoteResponse {
    /// An accepted vote.
    #[must_use]
    pub fn accepted(usernames: Vec<String>) -> Self {
        Self {
            success: true,
            message: "vote accepted".to_string(),
            usernames,
            timestamp: Utc::now(),
        }
    }

    /// A rejected vote carrying the failure reason.
    #[must_use]
    pub fn rejected(usernames: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            usernames,
            timestamp: Utc::now(),
        }
    }
}

/// Whether `username` is a valid voter name: one character, A through Z.
#[must_use]
pub fn is_valid_username(username: &str) -> bool {
    matches!(username.as_bytes(), [b'A'..=b'Z'])
}

/// Validate a vote's username list: non-empty, every entry A-Z.
///
/// # Errors
///
/// Returns [`VoteError::InvalidInput`] naming the first offending entry.
pub fn validate_usernames(usernames: &[String]) -> Result<(), VoteError> {
    if usernames.is_empty() {
        return Err(VoteError::InvalidInput(
            "username list must not be empty".to_string(),
        ));
    }
    for username in usernames {
        if !is_valid_username(username) {
            return Err(VoteError::InvalidInput(format!(
                "invalid username {username:?}: must be a single letter A-Z"
            )));
        }
    }
    Ok(())
}
