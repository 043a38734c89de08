//! Redis fast tier for voteflow.
//!
//! Holds the hot side of both stores:
//!
//! - Ticket records as hashes under `ticket:<version>` with a 10 second
//!   record TTL, plus the single-slot latest-version pointer at
//!   `ticket:newest:version`. The usage decrement runs as a pre-loaded
//!   server-side Lua script so concurrent spends from every replica
//!   serialize at the Redis server.
//! - The per-user tally cache as JSON blobs under `user:vote:<username>`
//!   with a 1 hour TTL.
//!
//! The quorum lock lives in [`redlock`].

#![forbid(unsafe_code)]

pub mod redlock;

pub use redlock::RedLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;
use voteflow_core::model::{Ticket, UserVote};
use voteflow_core::{StoreError, TicketFastTier, VoteCacheTier};

/// Single-slot pointer to the most recently minted ticket version.
const TICKET_VERSION_KEY: &str = "ticket:newest:version";

/// Record TTL for fast-tier ticket hashes, in seconds. Stale tickets
/// self-evict well after they have been superseded (refresh cadence is 2 s).
const TICKET_TTL_SECS: i64 = 10;

/// Cache TTL for user tally blobs, in seconds.
const USER_VOTE_TTL_SECS: u64 = 3600;

/// Atomic usage decrement, executed server-side.
///
/// Returns a two-element reply `[status, payload]`:
/// - `{0, remaining}` after a successful decrement,
/// - `{-1, message}` when the record or its count field is absent,
/// - `{-2, message}` when the count is already zero.
///
/// Callers branch on the status code, never on the payload type.
const DECREMENT_USAGE_SCRIPT: &str = r"
local remaining = tonumber(redis.call('HGET', KEYS[1], 'remainingUsages'))
if not remaining then
    return {-1, 'ticket record corrupt'}
end
if remaining <= 0 then
    return {-2, 'ticket usages exhausted'}
end
remaining = remaining - 1
redis.call('HSET', KEYS[1], 'remainingUsages', remaining)
return {0, remaining}
";

fn ticket_key(version: &str) -> String {
    format!("ticket:{version}")
}

fn user_vote_key(username: &str) -> String {
    format!("user:vote:{username}")
}

fn transport(error: redis::RedisError) -> StoreError {
    StoreError::Transport(error.to_string())
}

/// Build the connection URL for a Redis endpoint.
#[must_use]
pub fn connection_url(address: &str, password: &str, db: i64) -> String {
    if password.is_empty() {
        format!("redis://{address}/{db}")
    } else {
        format!("redis://:{password}@{address}/{db}")
    }
}

/// The Redis-backed fast tier: ticket records, the latest-version pointer,
/// and the user tally cache.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    decrement_script: Script,
}

impl RedisStore {
    /// Connect and pre-load the decrement script.
    ///
    /// Script pre-loading is part of initialization on purpose: a replica
    /// that cannot install the script must not serve spends, so the failure
    /// is fatal here rather than surfacing on the first vote.
    ///
    /// # Errors
    ///
    /// [`StoreError::Transport`] when the connection or the script load
    /// fails.
    pub async fn connect(
        url: &str,
        response_timeout: Duration,
        max_retries: usize,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(transport)?;
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(response_timeout)
            .set_response_timeout(response_timeout)
            .set_number_of_retries(max_retries);
        let mut conn = ConnectionManager::new_with_config(client, config)
            .await
            .map_err(transport)?;

        let decrement_script = Script::new(DECREMENT_USAGE_SCRIPT);
        decrement_script
            .prepare_invoke()
            .load_async(&mut conn)
            .await
            .map_err(transport)?;

        info!("redis fast tier connected, decrement script loaded");
        Ok(Self {
            conn,
            decrement_script,
        })
    }
}

fn parse_rfc3339(field: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad {field} timestamp: {e}")))
}

#[async_trait]
impl TicketFastTier for RedisStore {
    async fn create_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        let key = ticket_key(&ticket.version);
        let fields = [
            ("value", ticket.value.clone()),
            ("remainingUsages", ticket.remaining_usages.to_string()),
            ("expiresAt", ticket.expires_at.to_rfc3339()),
            ("createdAt", ticket.created_at.to_rfc3339()),
        ];

        // Field map and record TTL in one round trip.
        let mut conn = self.conn.clone();
        redis::pipe()
            .hset_multiple(&key, &fields)
            .ignore()
            .expire(&key, TICKET_TTL_SECS)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn get_ticket(&self, version: &str) -> Result<Ticket, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(ticket_key(version))
            .await
            .map_err(transport)?;

        if fields.is_empty() {
            return Err(StoreError::NotFound(format!("ticket {version}")));
        }

        let value = fields
            .get("value")
            .ok_or_else(|| StoreError::Corrupt(format!("ticket {version} missing value")))?
            .clone();
        let remaining_usages = fields
            .get("remainingUsages")
            .ok_or_else(|| StoreError::Corrupt(format!("ticket {version} missing usage count")))?
            .parse::<i32>()
            .map_err(|e| StoreError::Corrupt(format!("bad usage count: {e}")))?;
        let expires_at = parse_rfc3339(
            "expiresAt",
            fields
                .get("expiresAt")
                .ok_or_else(|| StoreError::Corrupt(format!("ticket {version} missing expiresAt")))?,
        )?;
        let created_at = parse_rfc3339(
            "createdAt",
            fields
                .get("createdAt")
                .ok_or_else(|| StoreError::Corrupt(format!("ticket {version} missing createdAt")))?,
        )?;

        Ok(Ticket {
            value,
            version: version.to_string(),
            remaining_usages,
            expires_at,
            created_at,
        })
    }

    async fn set_newest_version(&self, version: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(TICKET_VERSION_KEY, version)
            .await
            .map_err(transport)
    }

    async fn get_newest_version(&self) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(TICKET_VERSION_KEY).await.map_err(transport)
    }

    async fn decrement_usage(&self, version: &str) -> Result<i32, StoreError> {
        let mut conn = self.conn.clone();
        // EVALSHA against the pre-loaded script; the Script wrapper reloads
        // and retries exactly once if the server answers NOSCRIPT.
        let (status, payload): (i64, redis::Value) = self
            .decrement_script
            .key(ticket_key(version))
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;

        match status {
            0 => redis::from_redis_value::<i64>(&payload)
                .map(|remaining| remaining as i32)
                .map_err(|e| StoreError::Corrupt(format!("bad script payload: {e}"))),
            -1 => {
                let message = redis::from_redis_value::<String>(&payload)
                    .unwrap_or_else(|_| "ticket record corrupt".to_string());
                Err(StoreError::Corrupt(format!("ticket {version}: {message}")))
            }
            -2 => Err(StoreError::Exhausted {
                version: version.to_string(),
            }),
            other => Err(StoreError::Corrupt(format!(
                "decrement script returned unknown status {other}"
            ))),
        }
    }
}

#[async_trait]
impl VoteCacheTier for RedisStore {
    async fn get_user_vote(&self, username: &str) -> Result<Option<UserVote>, StoreError> {
        let mut conn = self.conn.clone();
        let blob: Option<String> = conn
            .get(user_vote_key(username))
            .await
            .map_err(transport)?;
        match blob {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn set_user_vote(&self, vote: &UserVote) -> Result<(), StoreError> {
        let json =
            serde_json::to_string(vote).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(user_vote_key(&vote.username), json, USER_VOTE_TTL_SECS)
            .await
            .map_err(transport)
    }

    async fn delete_user_vote(&self, username: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(user_vote_key(username))
            .await
            .map_err(transport)
    }
}
