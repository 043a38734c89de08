//! Per-user tally storage: durable rows fronted by a TTL cache.
//!
//! The cache is strictly read-through. Settlement never writes it; after a
//! successful durable increment the affected entries are deleted so the next
//! read observes authority. A cache entry is therefore never newer than the
//! durable row behind it.

use crate::error::StoreError;
use crate::model::UserVote;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Durable tally operations.
#[async_trait]
pub trait VoteDurableTier: Send + Sync {
    /// One user's tally row.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownUser`] when no row exists.
    async fn get_user_vote(&self, username: &str) -> Result<UserVote, StoreError>;

    /// All tally rows, ordered by username.
    async fn get_all_user_votes(&self) -> Result<Vec<UserVote>, StoreError>;

    /// Credit one vote to each username and append the audit log rows, all
    /// in a single transaction. A username without a tally row aborts the
    /// whole transaction with [`StoreError::UnknownUser`].
    async fn increment(&self, usernames: &[String], ticket_version: &str)
        -> Result<(), StoreError>;
}

/// Cache-tier tally operations (JSON blob per username, 1-hour TTL).
#[async_trait]
pub trait VoteCacheTier: Send + Sync {
    /// Cached tally, `None` on miss.
    async fn get_user_vote(&self, username: &str) -> Result<Option<UserVote>, StoreError>;

    /// Populate the cache after a durable read.
    async fn set_user_vote(&self, vote: &UserVote) -> Result<(), StoreError>;

    /// Drop a cache entry so the next read goes to the durable tier.
    async fn delete_user_vote(&self, username: &str) -> Result<(), StoreError>;
}

/// The single interface over the tally tiers.
#[derive(Clone)]
pub struct VoteStore {
    cache: Arc<dyn VoteCacheTier>,
    durable: Arc<dyn VoteDurableTier>,
}

impl VoteStore {
    /// Front the given tiers.
    #[must_use]
    pub fn new(cache: Arc<dyn VoteCacheTier>, durable: Arc<dyn VoteDurableTier>) -> Self {
        Self { cache, durable }
    }

    /// Cache-aside read of one user's tally. Cache errors degrade to a
    /// durable read; the durable result repopulates the cache.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownUser`] or durable transport failures.
    pub async fn get(&self, username: &str) -> Result<UserVote, StoreError> {
        match self.cache.get_user_vote(username).await {
            Ok(Some(vote)) => return Ok(vote),
            Ok(None) => {}
            Err(error) => {
                warn!(%username, %error, "vote cache read failed, falling back to durable");
            }
        }

        let vote = self.durable.get_user_vote(username).await?;
        if let Err(error) = self.cache.set_user_vote(&vote).await {
            warn!(%username, %error, "vote cache populate failed");
        }
        Ok(vote)
    }

    /// All tallies, straight from the durable tier.
    ///
    /// # Errors
    ///
    /// Propagates durable transport failures.
    pub async fn get_all(&self) -> Result<Vec<UserVote>, StoreError> {
        self.durable.get_all_user_votes().await
    }

    /// Durable increment for a settled vote event.
    ///
    /// # Errors
    ///
    /// Propagates the transactional outcome; on error nothing was written.
    pub async fn increment(
        &self,
        usernames: &[String],
        ticket_version: &str,
    ) -> Result<(), StoreError> {
        self.durable.increment(usernames, ticket_version).await
    }

    /// Invalidate the cache entries for the given users after settlement.
    /// Delete failures are logged, not returned: the entry will age out on
    /// its TTL and the durable tier already holds the truth.
    pub async fn invalidate(&self, usernames: &[String]) {
        for username in usernames {
            if let Err(error) = self.cache.delete_user_vote(username).await {
                warn!(%username, %error, "vote cache invalidation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MapCache {
        entries: Mutex<HashMap<String, UserVote>>,
    }

    #[async_trait]
    impl VoteCacheTier for MapCache {
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

    #[derive(Default)]
    struct MapDurable {
        votes: Mutex<HashMap<String, i64>>,
        log: Mutex<Vec<(String, String)>>,
    }

    impl MapDurable {
        fn seeded(usernames: &[&str]) -> Self {
            let store = Self::default();
            {
                let mut votes = store.votes.lock().unwrap();
                for name in usernames {
                    votes.insert((*name).to_string(), 0);
                }
            }
            store
        }
    }

    #[async_trait]
    impl VoteDurableTier for MapDurable {
        async fn get_user_vote(&self, username: &str) -> Result<UserVote, StoreError> {
            let votes = self.votes.lock().unwrap();
            let count = votes
                .get(username)
                .ok_or_else(|| StoreError::UnknownUser(username.to_string()))?;
            Ok(UserVote {
                username: username.to_string(),
                votes: *count,
                updated_at: Utc::now(),
            })
        }

        async fn get_all_user_votes(&self) -> Result<Vec<UserVote>, StoreError> {
            let votes = self.votes.lock().unwrap();
            let mut all: Vec<UserVote> = votes
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
            let mut votes = self.votes.lock().unwrap();
            // All-or-nothing, like the real transaction.
            for username in usernames {
                if !votes.contains_key(username) {
                    return Err(StoreError::UnknownUser(username.clone()));
                }
            }
            let mut log = self.log.lock().unwrap();
            for username in usernames {
                *votes.get_mut(username).unwrap() += 1;
                log.push((username.clone(), ticket_version.to_string()));
            }
            Ok(())
        }
    }

    fn seeded_store() -> (Arc<MapCache>, Arc<MapDurable>, VoteStore) {
        let cache = Arc::new(MapCache::default());
        let durable = Arc::new(MapDurable::seeded(&["A", "B"]));
        let store = VoteStore::new(cache.clone(), durable.clone());
        (cache, durable, store)
    }

    #[tokio::test]
    async fn read_miss_populates_cache() {
        let (cache, _, store) = seeded_store();

        let vote = store.get("A").await.unwrap();
        assert_eq!(vote.votes, 0);
        assert!(cache.entries.lock().unwrap().contains_key("A"));
    }

    #[tokio::test]
    async fn unknown_user_aborts_the_whole_increment() {
        let (_, durable, store) = seeded_store();

        let names = vec!["A".to_string(), "Q9".to_string()];
        let err = store.increment(&names, "100").await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownUser(_)));
        assert_eq!(durable.votes.lock().unwrap()["A"], 0);
        assert!(durable.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn settlement_invalidates_rather_than_writes_the_cache() {
        let (cache, durable, store) = seeded_store();

        // Warm the cache at votes = 0.
        store.get("A").await.unwrap();

        let names = vec!["A".to_string()];
        store.increment(&names, "100").await.unwrap();
        store.invalidate(&names).await;

        assert!(!cache.entries.lock().unwrap().contains_key("A"));
        assert_eq!(durable.votes.lock().unwrap()["A"], 1);

        // The next read observes authority and repopulates.
        assert_eq!(store.get("A").await.unwrap().votes, 1);
        assert_eq!(cache.entries.lock().unwrap()["A"].votes, 1);
    }

    #[tokio::test]
    async fn increment_appends_one_log_row_per_username() {
        let (_, durable, store) = seeded_store();

        let names = vec!["A".to_string(), "B".to_string()];
        store.increment(&names, "100").await.unwrap();

        let log = durable.log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.contains(&("A".to_string(), "100".to_string())));
    }
}
