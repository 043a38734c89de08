//! Fake coordination store for lock tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use voteflow_core::{DistributedLock, LockError};

/// The shared "cluster" state: which replica holds which lock, plus each
/// replica's local record of its holdings (so a lapsed lease is observable
/// as `refresh -> Ok(false)`, like the real backends).
#[derive(Default)]
struct NetworkState {
    holders: HashMap<String, u64>,
    beliefs: HashMap<u64, HashSet<String>>,
    next_replica: u64,
}

/// A simulated coordination store shared by any number of fake replicas.
///
/// Create one network per test, hand each simulated replica its own
/// [`InMemoryLock`] via [`LockNetwork::client`], and use
/// [`LockNetwork::kill`] to model a crashed holder whose leases expired.
#[derive(Clone, Default)]
pub struct LockNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LockNetwork {
    /// A fresh, empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A lock client for a new simulated replica.
    #[must_use]
    pub fn client(&self) -> InMemoryLock {
        let replica_id = {
            let mut state = self.state.lock().unwrap();
            state.next_replica += 1;
            state.next_replica
        };
        InMemoryLock {
            state: self.state.clone(),
            replica_id,
        }
    }

    /// Lapse every lease a replica holds, as its crash would.
    pub fn kill(&self, client: &InMemoryLock) {
        let mut state = self.state.lock().unwrap();
        state.holders.retain(|_, holder| *holder != client.replica_id);
    }

    /// Currently held lock count, for assertions.
    #[must_use]
    pub fn held_locks(&self) -> usize {
        self.state.lock().unwrap().holders.len()
    }
}

/// One replica's view of the [`LockNetwork`].
#[derive(Clone)]
pub struct InMemoryLock {
    state: Arc<Mutex<NetworkState>>,
    replica_id: u64,
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire(&self, name: &str, _timeout: Duration) -> Result<bool, LockError> {
        let mut state = self.state.lock().unwrap();
        let believed = state
            .beliefs
            .get(&self.replica_id)
            .is_some_and(|held| held.contains(name));
        if believed {
            return Err(LockError::AlreadyHeld(name.to_string()));
        }
        match state.holders.get(name) {
            Some(_) => Ok(false),
            None => {
                state.holders.insert(name.to_string(), self.replica_id);
                state
                    .beliefs
                    .entry(self.replica_id)
                    .or_default()
                    .insert(name.to_string());
                Ok(true)
            }
        }
    }

    async fn refresh(&self, name: &str, _timeout: Duration) -> Result<bool, LockError> {
        let mut state = self.state.lock().unwrap();
        let believed = state
            .beliefs
            .get(&self.replica_id)
            .is_some_and(|held| held.contains(name));
        if !believed {
            return Err(LockError::NotHeld(name.to_string()));
        }

        if state.holders.get(name) == Some(&self.replica_id) {
            Ok(true)
        } else {
            // The lease lapsed behind our back; forget the entry.
            if let Some(held) = state.beliefs.get_mut(&self.replica_id) {
                held.remove(name);
            }
            Ok(false)
        }
    }

    async fn release(&self, name: &str) -> Result<(), LockError> {
        let mut state = self.state.lock().unwrap();
        if state.holders.get(name) == Some(&self.replica_id) {
            state.holders.remove(name);
        }
        if let Some(held) = state.beliefs.get_mut(&self.replica_id) {
            held.remove(name);
        }
        Ok(())
    }

    async fn release_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.holders.retain(|_, holder| *holder != self.replica_id);
        state.beliefs.remove(&self.replica_id);
    }

    async fn close(&self) {
        self.release_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn exclusive_across_replicas() {
        let network = LockNetwork::new();
        let first = network.client();
        let second = network.client();

        assert!(first.acquire("producer", WAIT).await.unwrap());
        assert!(!second.acquire("producer", WAIT).await.unwrap());

        first.release("producer").await.unwrap();
        assert!(second.acquire("producer", WAIT).await.unwrap());
    }

    #[tokio::test]
    async fn double_acquire_is_an_error_not_contention() {
        let network = LockNetwork::new();
        let client = network.client();

        assert!(client.acquire("producer", WAIT).await.unwrap());
        assert!(matches!(
            client.acquire("producer", WAIT).await,
            Err(LockError::AlreadyHeld(_))
        ));
    }

    #[tokio::test]
    async fn killing_a_holder_frees_its_locks() {
        let network = LockNetwork::new();
        let first = network.client();
        let second = network.client();

        assert!(first.acquire("start", WAIT).await.unwrap());
        assert!(first.acquire("producer", WAIT).await.unwrap());
        network.kill(&first);

        assert_eq!(network.held_locks(), 0);
        assert!(second.acquire("start", WAIT).await.unwrap());
    }

    #[tokio::test]
    async fn refresh_reports_whether_the_lease_survives() {
        let network = LockNetwork::new();
        let holder = network.client();
        let other = network.client();

        assert!(holder.acquire("producer", WAIT).await.unwrap());
        assert!(holder.refresh("producer", WAIT).await.unwrap());

        // Refreshing a never-held lock is a caller bug, not lease loss.
        assert!(matches!(
            other.refresh("producer", WAIT).await,
            Err(LockError::NotHeld(_))
        ));

        // Once the lease lapses, refresh reports the loss and the holder
        // can acquire again.
        network.kill(&holder);
        assert!(!holder.refresh("producer", WAIT).await.unwrap());
        assert!(holder.acquire("producer", WAIT).await.unwrap());
    }

    #[tokio::test]
    async fn releasing_an_unheld_lock_is_a_noop() {
        let network = LockNetwork::new();
        let first = network.client();
        let second = network.client();

        assert!(first.acquire("producer", WAIT).await.unwrap());
        second.release("producer").await.unwrap();
        // Still held by the first replica.
        assert!(!second.acquire("producer", WAIT).await.unwrap());
    }
}
