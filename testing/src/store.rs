//! Fake storage tiers with the production error semantics.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use voteflow_core::model::{Ticket, TicketHistory, UserVote};
use voteflow_core::{
    StoreError, TicketDurableTier, TicketFastTier, VoteCacheTier, VoteDurableTier,
};

/// Fast-tier fake: ticket hashes, the latest-version pointer, and an
/// atomic decrement with the script's error semantics (absent record is
/// corrupt, zero count is exhausted).
#[derive(Clone, Default)]
pub struct InMemoryTicketFastTier {
    state: Arc<Mutex<FastState>>,
}

#[derive(Default)]
struct FastState {
    tickets: HashMap<String, Ticket>,
    newest: Option<String>,
}

impl InMemoryTicketFastTier {
    /// A fresh, empty tier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a ticket record, as the 10 second TTL would.
    pub fn evict(&self, version: &str) {
        self.state.lock().unwrap().tickets.remove(version);
    }

    /// Current latest-version pointer, for assertions.
    #[must_use]
    pub fn newest(&self) -> Option<String> {
        self.state.lock().unwrap().newest.clone()
    }
}

#[async_trait]
impl TicketFastTier for InMemoryTicketFastTier {
    async fn create_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        self.state
            .lock()
            .unwrap()
            .tickets
            .insert(ticket.version.clone(), ticket.clone());
        Ok(())
    }

    async fn get_ticket(&self, version: &str) -> Result<Ticket, StoreError> {
        self.state
            .lock()
            .unwrap()
            .tickets
            .get(version)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("ticket {version}")))
    }

    async fn set_newest_version(&self, version: &str) -> Result<(), StoreError> {
        self.state.lock().unwrap().newest = Some(version.to_string());
        Ok(())
    }

    async fn get_newest_version(&self) -> Result<Option<String>, StoreError> {
        Ok(self.state.lock().unwrap().newest.clone())
    }

    async fn decrement_usage(&self, version: &str) -> Result<i32, StoreError> {
        let mut state = self.state.lock().unwrap();
        let ticket = state
            .tickets
            .get_mut(version)
            .ok_or_else(|| StoreError::Corrupt(format!("ticket {version}: record absent")))?;
        if ticket.remaining_usages <= 0 {
            return Err(StoreError::Exhausted {
                version: version.to_string(),
            });
        }
        ticket.remaining_usages -= 1;
        Ok(ticket.remaining_usages)
    }
}

/// Durable-tier fake: authoritative rows plus the history archive.
#[derive(Clone, Default)]
pub struct InMemoryTicketDurableTier {
    state: Arc<Mutex<DurableTicketState>>,
}

#[derive(Default)]
struct DurableTicketState {
    tickets: HashMap<String, Ticket>,
    history: Vec<TicketHistory>,
}

impl InMemoryTicketDurableTier {
    /// A fresh, empty tier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Authoritative remaining count, for assertions.
    #[must_use]
    pub fn remaining(&self, version: &str) -> Option<i32> {
        self.state
            .lock()
            .unwrap()
            .tickets
            .get(version)
            .map(|t| t.remaining_usages)
    }

    /// Whether a durable row exists for `version`.
    #[must_use]
    pub fn contains(&self, version: &str) -> bool {
        self.state.lock().unwrap().tickets.contains_key(version)
    }

    /// Archived history rows, for assertions.
    #[must_use]
    pub fn history(&self) -> Vec<TicketHistory> {
        self.state.lock().unwrap().history.clone()
    }
}

#[async_trait]
impl TicketDurableTier for InMemoryTicketDurableTier {
    async fn save_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        self.state
            .lock()
            .unwrap()
            .tickets
            .insert(ticket.version.clone(), ticket.clone());
        Ok(())
    }

    async fn get_ticket(&self, version: &str) -> Result<Ticket, StoreError> {
        self.state
            .lock()
            .unwrap()
            .tickets
            .get(version)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("ticket {version}")))
    }

    async fn get_newest_version(&self) -> Result<Option<String>, StoreError> {
        let now = Utc::now();
        let state = self.state.lock().unwrap();
        let newest = state
            .tickets
            .values()
            .filter(|t| t.expires_at > now)
            .max_by_key(|t| t.created_at)
            .map(|t| t.version.clone());
        Ok(newest)
    }

    async fn decrement_usage(&self, version: &str) -> Result<i32, StoreError> {
        let mut state = self.state.lock().unwrap();
        let ticket = state
            .tickets
            .get_mut(version)
            .ok_or_else(|| StoreError::NotFound(format!("ticket {version}")))?;
        if ticket.remaining_usages <= 0 {
            return Err(StoreError::Exhausted {
                version: version.to_string(),
            });
        }
        ticket.remaining_usages -= 1;
        Ok(ticket.remaining_usages)
    }

    async fn save_history(&self, history: &TicketHistory) -> Result<(), StoreError> {
        self.state.lock().unwrap().history.push(history.clone());
        Ok(())
    }
}

/// Tally cache fake.
#[derive(Clone, Default)]
pub struct InMemoryVoteCacheTier {
    entries: Arc<Mutex<HashMap<String, UserVote>>>,
}

impl InMemoryVoteCacheTier {
    /// A fresh, empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an entry is cached for `username`.
    #[must_use]
    pub fn contains(&self, username: &str) -> bool {
        self.entries.lock().unwrap().contains_key(username)
    }
}

#[async_trait]
impl VoteCacheTier for InMemoryVoteCacheTier {
    async fn get_user_vote(&self, username: &str) -> Result<Option<UserVote>, StoreError> {
        Ok(self.entries.lock().unwrap().get(username).cloned())
    }

    async fn set_user_vote(&self, vote: &UserVote) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert(vote.username.clone(), vote.clone());
        Ok(())
    }

    async fn delete_user_vote(&self, username: &str) -> Result<(), StoreError> {
        self.entries.lock().unwrap().remove(username);
        Ok(())
    }
}

/// Durable tally fake, pre-seeded A..Z with zero votes like the production
/// schema, with the transaction's all-or-nothing behavior.
#[derive(Clone)]
pub struct InMemoryVoteDurableTier {
    state: Arc<Mutex<DurableVoteState>>,
}

#[derive(Default)]
struct DurableVoteState {
    votes: HashMap<String, i64>,
    log: Vec<(String, String)>,
}

impl Default for InMemoryVoteDurableTier {
    fn default() -> Self {
        let mut votes = HashMap::new();
        for letter in b'A'..=b'Z' {
            votes.insert((letter as char).to_string(), 0);
        }
        Self {
            state: Arc::new(Mutex::new(DurableVoteState {
                votes,
                log: Vec::new(),
            })),
        }
    }
}

impl InMemoryVoteDurableTier {
    /// A tier seeded with the 26 voters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current tally, for assertions.
    #[must_use]
    pub fn votes(&self, username: &str) -> i64 {
        self.state
            .lock()
            .unwrap()
            .votes
            .get(username)
            .copied()
            .unwrap_or(0)
    }

    /// The append-only (username, ticket_version) log, for assertions.
    #[must_use]
    pub fn log(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().log.clone()
    }

    /// Sum of all tallies, for the soundness invariant.
    #[must_use]
    pub fn total_votes(&self) -> i64 {
        self.state.lock().unwrap().votes.values().sum()
    }
}

#[async_trait]
impl VoteDurableTier for InMemoryVoteDurableTier {
    async fn get_user_vote(&self, username: &str) -> Result<UserVote, StoreError> {
        let state = self.state.lock().unwrap();
        let count = state
            .votes
            .get(username)
            .ok_or_else(|| StoreError::UnknownUser(username.to_string()))?;
        Ok(UserVote {
            username: username.to_string(),
            votes: *count,
            updated_at: Utc::now(),
        })
    }

    async fn get_all_user_votes(&self) -> Result<Vec<UserVote>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut all: Vec<UserVote> = state
            .votes
            .iter()
            .map(|(username, count)| UserVote {
                username: username.clone(),
                votes: *count,
                updated_at: Utc::now(),
            })
            .collect();
        all.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(all)
    }

    async fn increment(
        &self,
        usernames: &[String],
        ticket_version: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for username in usernames {
            if !state.votes.contains_key(username) {
                return Err(StoreError::UnknownUser(username.clone()));
            }
        }
        for username in usernames {
            *state.votes.get_mut(username).unwrap() += 1;
            state.log.push((username.clone(), ticket_version.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(version: &str, remaining: i32) -> Ticket {
        Ticket {
            value: "cafe".repeat(8),
            version: version.to_string(),
            remaining_usages: remaining,
            expires_at: Utc::now() + chrono::Duration::seconds(2),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn fast_tier_decrement_hits_zero_then_exhausts() {
        let tier = InMemoryTicketFastTier::new();
        tier.create_ticket(&ticket("1", 2)).await.unwrap();

        assert_eq!(tier.decrement_usage("1").await.unwrap(), 1);
        assert_eq!(tier.decrement_usage("1").await.unwrap(), 0);
        assert!(matches!(
            tier.decrement_usage("1").await,
            Err(StoreError::Exhausted { .. })
        ));
    }

    #[tokio::test]
    async fn fast_tier_decrement_of_absent_record_is_corrupt() {
        let tier = InMemoryTicketFastTier::new();
        assert!(matches!(
            tier.decrement_usage("zzz").await,
            Err(StoreError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_spends_never_exceed_the_budget() {
        let tier = Arc::new(InMemoryTicketFastTier::new());
        tier.create_ticket(&ticket("1", 3)).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let tier = tier.clone();
            tasks.push(tokio::spawn(async move {
                tier.decrement_usage("1").await.is_ok()
            }));
        }

        let mut successes = 0;
        for task in tasks {
            if task.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 3);
    }

    #[tokio::test]
    async fn durable_votes_are_seeded_a_through_z() {
        let tier = InMemoryVoteDurableTier::new();
        let all = tier.get_all_user_votes().await.unwrap();
        assert_eq!(all.len(), 26);
        assert_eq!(all[0].username, "A");
        assert_eq!(all[25].username, "Z");
        assert!(all.iter().all(|v| v.votes == 0));
    }
}
