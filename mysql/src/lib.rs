//! MySQL durable tier for voteflow.
//!
//! Authoritative storage: ticket rows, per-user tallies, the append-only
//! vote log, and the ticket history archive. Reads go to the replica pool,
//! writes to the master. The tally increment and the usage decrement are
//! the two transactional paths; everything else is single statements.
//!
//! `schema.sql` beside this crate holds the reference DDL, including the
//! A..Z seed for `user_votes`.

#![forbid(unsafe_code)]

pub mod dead_letter;

pub use dead_letter::MySqlDeadLetterQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{info, warn};
use voteflow_core::model::{Ticket, TicketHistory, UserVote};
use voteflow_core::{StoreError, TicketDurableTier, VoteDurableTier};

fn transport(error: sqlx::Error) -> StoreError {
    StoreError::Transport(error.to_string())
}

fn user_vote_from_row(row: &MySqlRow) -> Result<UserVote, StoreError> {
    Ok(UserVote {
        username: row.try_get("username").map_err(transport)?,
        votes: row.try_get("votes").map_err(transport)?,
        updated_at: row
            .try_get::<DateTime<Utc>, _>("updated_at")
            .map_err(transport)?,
    })
}

fn ticket_from_row(row: &MySqlRow) -> Result<Ticket, StoreError> {
    Ok(Ticket {
        version: row.try_get("version").map_err(transport)?,
        value: row.try_get("value").map_err(transport)?,
        remaining_usages: row.try_get("remaining_usages").map_err(transport)?,
        expires_at: row
            .try_get::<DateTime<Utc>, _>("expires_at")
            .map_err(transport)?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(transport)?,
    })
}

/// Durable store over a master pool for writes and a replica pool for reads.
#[derive(Clone)]
pub struct MySqlStore {
    master: MySqlPool,
    replica: MySqlPool,
}

impl MySqlStore {
    /// Connect both pools. A failed replica connection degrades to reading
    /// from the master rather than failing startup.
    ///
    /// # Errors
    ///
    /// [`StoreError::Transport`] when the master is unreachable.
    pub async fn connect(
        master_url: &str,
        replica_url: &str,
        max_open: u32,
        max_idle: u32,
    ) -> Result<Self, StoreError> {
        let master = MySqlPoolOptions::new()
            .max_connections(max_open)
            .min_connections(max_idle.min(max_open))
            .max_lifetime(Duration::from_secs(3600))
            .connect(master_url)
            .await
            .map_err(transport)?;

        let replica = match MySqlPoolOptions::new()
            .max_connections(max_open)
            .min_connections(max_idle.min(max_open))
            .max_lifetime(Duration::from_secs(3600))
            .connect(replica_url)
            .await
        {
            Ok(pool) => pool,
            Err(error) => {
                warn!(%error, "replica connection failed, reads will use the master");
                master.clone()
            }
        };

        info!("mysql durable tier connected");
        Ok(Self { master, replica })
    }

    /// Handle on the master pool, for sinks that share it.
    #[must_use]
    pub fn master_pool(&self) -> &MySqlPool {
        &self.master
    }
}

#[async_trait]
impl VoteDurableTier for MySqlStore {
    async fn get_user_vote(&self, username: &str) -> Result<UserVote, StoreError> {
        let row = sqlx::query("SELECT username, votes, updated_at FROM user_votes WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.replica)
            .await
            .map_err(transport)?
            .ok_or_else(|| StoreError::UnknownUser(username.to_string()))?;
        user_vote_from_row(&row)
    }

    async fn get_all_user_votes(&self) -> Result<Vec<UserVote>, StoreError> {
        let rows = sqlx::query("SELECT username, votes, updated_at FROM user_votes ORDER BY username")
            .fetch_all(&self.replica)
            .await
            .map_err(transport)?;
        rows.iter().map(user_vote_from_row).collect()
    }

    async fn increment(
        &self,
        usernames: &[String],
        ticket_version: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.master.begin().await.map_err(transport)?;

        for username in usernames {
            let updated = sqlx::query("UPDATE user_votes SET votes = votes + 1 WHERE username = ?")
                .bind(username)
                .execute(&mut *tx)
                .await
                .map_err(transport)?;
            if updated.rows_affected() == 0 {
                // Dropping the transaction rolls back the earlier updates.
                return Err(StoreError::UnknownUser(username.clone()));
            }

            sqlx::query("INSERT INTO vote_logs (username, ticket_version) VALUES (?, ?)")
                .bind(username)
                .bind(ticket_version)
                .execute(&mut *tx)
                .await
                .map_err(transport)?;
        }

        tx.commit().await.map_err(transport)
    }
}

#[async_trait]
impl TicketDurableTier for MySqlStore {
    async fn save_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tickets (version, value, remaining_usages, expires_at, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
             value = VALUES(value), \
             remaining_usages = VALUES(remaining_usages), \
             expires_at = VALUES(expires_at)",
        )
        .bind(&ticket.version)
        .bind(&ticket.value)
        .bind(ticket.remaining_usages)
        .bind(ticket.expires_at)
        .bind(ticket.created_at)
        .execute(&self.master)
        .await
        .map_err(transport)?;
        Ok(())
    }

    async fn get_ticket(&self, version: &str) -> Result<Ticket, StoreError> {
        let row = sqlx::query(
            "SELECT version, value, remaining_usages, expires_at, created_at \
             FROM tickets WHERE version = ?",
        )
        .bind(version)
        .fetch_optional(&self.replica)
        .await
        .map_err(transport)?
        .ok_or_else(|| StoreError::NotFound(format!("ticket {version}")))?;
        ticket_from_row(&row)
    }

    async fn get_newest_version(&self) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT version FROM tickets \
             WHERE expires_at > NOW() \
             ORDER BY created_at DESC \
             LIMIT 1",
        )
        .fetch_optional(&self.replica)
        .await
        .map_err(transport)?;
        row.map(|r| r.try_get("version").map_err(transport)).transpose()
    }

    async fn decrement_usage(&self, version: &str) -> Result<i32, StoreError> {
        let mut tx = self.master.begin().await.map_err(transport)?;

        let row = sqlx::query("SELECT remaining_usages FROM tickets WHERE version = ? FOR UPDATE")
            .bind(version)
            .fetch_optional(&mut *tx)
            .await
            .map_err(transport)?
            .ok_or_else(|| StoreError::NotFound(format!("ticket {version}")))?;
        let remaining: i32 = row.try_get("remaining_usages").map_err(transport)?;

        if remaining <= 0 {
            return Err(StoreError::Exhausted {
                version: version.to_string(),
            });
        }

        let remaining = remaining - 1;
        sqlx::query("UPDATE tickets SET remaining_usages = ? WHERE version = ?")
            .bind(remaining)
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(transport)?;

        tx.commit().await.map_err(transport)?;
        Ok(remaining)
    }

    async fn save_history(&self, history: &TicketHistory) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ticket_history (version, ticket_value, created_at, expired_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&history.version)
        .bind(&history.ticket_value)
        .bind(history.created_at)
        .bind(history.expired_at)
        .execute(&self.master)
        .await
        .map_err(transport)?;
        Ok(())
    }
}
