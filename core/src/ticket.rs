//! Dual-tier ticket storage.
//!
//! Tickets live in two places: a fast keyed tier (the arbiter of spend,
//! holding the latest-version pointer and the atomic decrement script) and a
//! durable relational tier (the authoritative record and audit copy).
//! [`TicketStore`] fronts both and encodes the two ordering rules the rest
//! of the system leans on:
//!
//! - **Create ordering**: durable first, then fast tier, then the pointer.
//!   A reader that observes the pointer therefore always finds the record,
//!   and a ticket that failed its durable write never exists anywhere.
//! - **Spend asymmetry**: `spend` decrements the fast tier only; the durable
//!   count is reconciled later by settlement (`settle_usage`).

use crate::error::StoreError;
use crate::model::{Ticket, TicketHistory};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Fast-tier ticket operations (keyed records with TTL, single-slot
/// latest-version pointer, atomic server-side decrement).
#[async_trait]
pub trait TicketFastTier: Send + Sync {
    /// Write the ticket's field map and its record TTL in one round trip.
    async fn create_ticket(&self, ticket: &Ticket) -> Result<(), StoreError>;

    /// Fetch a ticket record.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when the record is absent (expired or never
    /// written), [`StoreError::Corrupt`] when it is present but missing
    /// required fields.
    async fn get_ticket(&self, version: &str) -> Result<Ticket, StoreError>;

    /// Point the latest-version slot at `version`.
    async fn set_newest_version(&self, version: &str) -> Result<(), StoreError>;

    /// Read the latest-version slot; `None` before the first mint.
    async fn get_newest_version(&self) -> Result<Option<String>, StoreError>;

    /// Atomically decrement `remaining_usages`, returning the new count.
    ///
    /// # Errors
    ///
    /// [`StoreError::Exhausted`] at zero, [`StoreError::Corrupt`] when the
    /// record or its count field is missing.
    async fn decrement_usage(&self, version: &str) -> Result<i32, StoreError>;
}

/// Durable-tier ticket operations (authoritative rows, audit history).
#[async_trait]
pub trait TicketDurableTier: Send + Sync {
    /// Insert or update the row for `ticket.version`.
    async fn save_ticket(&self, ticket: &Ticket) -> Result<(), StoreError>;

    /// Fetch the authoritative row.
    async fn get_ticket(&self, version: &str) -> Result<Ticket, StoreError>;

    /// Most recent unexpired version by creation time; `None` when none.
    async fn get_newest_version(&self) -> Result<Option<String>, StoreError>;

    /// Decrement under `SELECT ... FOR UPDATE`; rejects at zero.
    async fn decrement_usage(&self, version: &str) -> Result<i32, StoreError>;

    /// Archive a superseded ticket.
    async fn save_history(&self, history: &TicketHistory) -> Result<(), StoreError>;
}

/// The single interface over both ticket tiers.
#[derive(Clone)]
pub struct TicketStore {
    fast: Arc<dyn TicketFastTier>,
    durable: Arc<dyn TicketDurableTier>,
}

impl TicketStore {
    /// Front the given tiers.
    #[must_use]
    pub fn new(fast: Arc<dyn TicketFastTier>, durable: Arc<dyn TicketDurableTier>) -> Self {
        Self { fast, durable }
    }

    /// Publish a freshly minted ticket.
    ///
    /// Durable write first: if it fails the ticket does not exist and the
    /// error aborts the mint. The fast-tier record and the pointer update
    /// follow; failures there are logged and tolerated, because the durable
    /// row repopulates the fast tier on the first read miss.
    ///
    /// # Errors
    ///
    /// Only the durable-tier write propagates.
    pub async fn publish(&self, ticket: &Ticket) -> Result<(), StoreError> {
        self.durable.save_ticket(ticket).await?;

        if let Err(error) = self.fast.create_ticket(ticket).await {
            warn!(version = %ticket.version, %error, "fast-tier ticket write failed");
        }
        if let Err(error) = self.fast.set_newest_version(&ticket.version).await {
            warn!(version = %ticket.version, %error, "latest-version pointer update failed");
        }
        Ok(())
    }

    /// Current latest version: the fast-tier pointer, with the durable
    /// tier's most-recent-unexpired row as fallback when the pointer is
    /// missing or unreadable. A recovered version is written back into the
    /// pointer slot.
    ///
    /// # Errors
    ///
    /// Propagates the durable lookup when the fallback is needed and fails.
    pub async fn newest_version(&self) -> Result<Option<String>, StoreError> {
        match self.fast.get_newest_version().await {
            Ok(Some(version)) => return Ok(Some(version)),
            Ok(None) => {}
            Err(error) => {
                warn!(%error, "latest-version pointer read failed, consulting durable tier");
            }
        }

        let Some(version) = self.durable.get_newest_version().await? else {
            return Ok(None);
        };
        if let Err(error) = self.fast.set_newest_version(&version).await {
            warn!(%version, %error, "latest-version pointer repopulation failed");
        }
        Ok(Some(version))
    }

    /// Read a ticket: fast tier first, durable fallback on miss, with
    /// opportunistic repopulation of the fast tier.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when neither tier has the version.
    pub async fn current(&self, version: &str) -> Result<Ticket, StoreError> {
        match self.fast.get_ticket(version).await {
            Ok(ticket) => Ok(ticket),
            Err(fast_error) => {
                let ticket = self.durable.get_ticket(version).await.map_err(|e| {
                    warn!(%version, %fast_error, "fast tier miss and durable lookup failed");
                    e
                })?;
                if let Err(error) = self.fast.create_ticket(&ticket).await {
                    warn!(%version, %error, "fast-tier repopulation failed");
                }
                Ok(ticket)
            }
        }
    }

    /// Spend one use: the fast-tier atomic decrement. Returns the remaining
    /// count after this spend.
    ///
    /// # Errors
    ///
    /// [`StoreError::Exhausted`] / [`StoreError::Corrupt`] from the script.
    pub async fn spend(&self, version: &str) -> Result<i32, StoreError> {
        self.fast.decrement_usage(version).await
    }

    /// Reconcile the durable usage count after settlement.
    ///
    /// # Errors
    ///
    /// Propagates the durable-tier decrement outcome.
    pub async fn settle_usage(&self, version: &str) -> Result<i32, StoreError> {
        self.durable.decrement_usage(version).await
    }

    /// Stored ticket for validation (fast tier, durable fallback).
    ///
    /// # Errors
    ///
    /// As for [`TicketStore::current`].
    pub async fn stored(&self, version: &str) -> Result<Ticket, StoreError> {
        self.current(version).await
    }

    /// Archive a superseded ticket into the durable history table.
    ///
    /// # Errors
    ///
    /// Propagates the durable-tier write outcome.
    pub async fn archive(&self, history: &TicketHistory) -> Result<(), StoreError> {
        self.durable.save_history(history).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn ticket(version: &str) -> Ticket {
        Ticket {
            value: "aa".repeat(16),
            version: version.to_string(),
            remaining_usages: 5,
            expires_at: Utc::now() + chrono::Duration::seconds(2),
            created_at: Utc::now(),
        }
    }

    /// Fast tier over a plain map, with switchable write failures.
    #[derive(Default)]
    struct MapFastTier {
        tickets: Mutex<HashMap<String, Ticket>>,
        newest: Mutex<Option<String>>,
        fail_writes: std::sync::atomic::AtomicBool,
    }

    impl MapFastTier {
        fn fail_writes(&self, fail: bool) {
            self.fail_writes
                .store(fail, std::sync::atomic::Ordering::SeqCst);
        }

        fn writes_failing(&self) -> bool {
            self.fail_writes.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TicketFastTier for MapFastTier {
        async fn create_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
            if self.writes_failing() {
                return Err(StoreError::Transport("injected".to_string()));
            }
            self.tickets
                .lock()
                .unwrap()
                .insert(ticket.version.clone(), ticket.clone());
            Ok(())
        }

        async fn get_ticket(&self, version: &str) -> Result<Ticket, StoreError> {
            self.tickets
                .lock()
                .unwrap()
                .get(version)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(version.to_string()))
        }

        async fn set_newest_version(&self, version: &str) -> Result<(), StoreError> {
            if self.writes_failing() {
                return Err(StoreError::Transport("injected".to_string()));
            }
            *self.newest.lock().unwrap() = Some(version.to_string());
            Ok(())
        }

        async fn get_newest_version(&self) -> Result<Option<String>, StoreError> {
            Ok(self.newest.lock().unwrap().clone())
        }

        async fn decrement_usage(&self, version: &str) -> Result<i32, StoreError> {
            let mut tickets = self.tickets.lock().unwrap();
            let ticket = tickets
                .get_mut(version)
                .ok_or_else(|| StoreError::Corrupt(version.to_string()))?;
            if ticket.remaining_usages <= 0 {
                return Err(StoreError::Exhausted {
                    version: version.to_string(),
                });
            }
            ticket.remaining_usages -= 1;
            Ok(ticket.remaining_usages)
        }
    }

    #[derive(Default)]
    struct MapDurableTier {
        tickets: Mutex<HashMap<String, Ticket>>,
        history: Mutex<Vec<TicketHistory>>,
        fail_saves: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl TicketDurableTier for MapDurableTier {
        async fn save_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
            if self.fail_saves.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StoreError::Transport("injected".to_string()));
            }
            self.tickets
                .lock()
                .unwrap()
                .insert(ticket.version.clone(), ticket.clone());
            Ok(())
        }

        async fn get_ticket(&self, version: &str) -> Result<Ticket, StoreError> {
            self.tickets
                .lock()
                .unwrap()
                .get(version)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(version.to_string()))
        }

        async fn get_newest_version(&self) -> Result<Option<String>, StoreError> {
            let tickets = self.tickets.lock().unwrap();
            let newest = tickets
                .values()
                .max_by_key(|t| t.created_at)
                .map(|t| t.version.clone());
            Ok(newest)
        }

        async fn decrement_usage(&self, version: &str) -> Result<i32, StoreError> {
            let mut tickets = self.tickets.lock().unwrap();
            let ticket = tickets
                .get_mut(version)
                .ok_or_else(|| StoreError::NotFound(version.to_string()))?;
            if ticket.remaining_usages <= 0 {
                return Err(StoreError::Exhausted {
                    version: version.to_string(),
                });
            }
            ticket.remaining_usages -= 1;
            Ok(ticket.remaining_usages)
        }

        async fn save_history(&self, history: &TicketHistory) -> Result<(), StoreError> {
            self.history.lock().unwrap().push(history.clone());
            Ok(())
        }
    }

    fn store() -> (Arc<MapFastTier>, Arc<MapDurableTier>, TicketStore) {
        let fast = Arc::new(MapFastTier::default());
        let durable = Arc::new(MapDurableTier::default());
        let store = TicketStore::new(fast.clone(), durable.clone());
        (fast, durable, store)
    }

    #[tokio::test]
    async fn publish_writes_durable_then_fast_then_pointer() {
        let (fast, durable, store) = store();
        store.publish(&ticket("100")).await.unwrap();

        assert!(durable.tickets.lock().unwrap().contains_key("100"));
        assert!(fast.tickets.lock().unwrap().contains_key("100"));
        assert_eq!(store.newest_version().await.unwrap().as_deref(), Some("100"));
    }

    #[tokio::test]
    async fn durable_failure_aborts_publish_entirely() {
        let (fast, durable, store) = store();
        durable
            .fail_saves
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let result = store.publish(&ticket("100")).await;
        assert!(result.is_err());
        assert!(fast.tickets.lock().unwrap().is_empty());
        assert_eq!(store.newest_version().await.unwrap(), None);
    }

    #[tokio::test]
    async fn fast_failure_does_not_abort_publish() {
        let (fast, durable, store) = store();
        fast.fail_writes(true);

        store.publish(&ticket("100")).await.unwrap();
        assert!(durable.tickets.lock().unwrap().contains_key("100"));
        // The pointer write failed too, but readers recover the version
        // from the durable tier.
        assert_eq!(store.newest_version().await.unwrap().as_deref(), Some("100"));

        // Once the fast tier is healthy again, the read path heals the
        // pointer slot.
        fast.fail_writes(false);
        store.newest_version().await.unwrap();
        assert_eq!(fast.newest.lock().unwrap().as_deref(), Some("100"));
    }

    #[tokio::test]
    async fn read_miss_falls_back_and_repopulates() {
        let (fast, durable, store) = store();
        durable.save_ticket(&ticket("100")).await.unwrap();

        let found = store.current("100").await.unwrap();
        assert_eq!(found.version, "100");
        // Opportunistic repopulation put it back in the fast tier.
        assert!(fast.tickets.lock().unwrap().contains_key("100"));
    }

    #[tokio::test]
    async fn read_missing_everywhere_is_not_found() {
        let (_, _, store) = store();
        assert!(matches!(
            store.current("100").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn spend_only_touches_the_fast_tier() {
        let (fast, durable, store) = store();
        store.publish(&ticket("100")).await.unwrap();

        assert_eq!(store.spend("100").await.unwrap(), 4);
        assert_eq!(fast.tickets.lock().unwrap()["100"].remaining_usages, 4);
        assert_eq!(durable.tickets.lock().unwrap()["100"].remaining_usages, 5);
    }

    #[tokio::test]
    async fn settle_usage_reconciles_the_durable_tier() {
        let (_, durable, store) = store();
        store.publish(&ticket("100")).await.unwrap();

        assert_eq!(store.settle_usage("100").await.unwrap(), 4);
        assert_eq!(durable.tickets.lock().unwrap()["100"].remaining_usages, 4);
    }

    #[tokio::test]
    async fn decrement_boundary_at_one_then_exhausted() {
        let (fast, _, store) = store();
        let mut t = ticket("100");
        t.remaining_usages = 1;
        fast.create_ticket(&t).await.unwrap();

        assert_eq!(store.spend("100").await.unwrap(), 0);
        assert!(matches!(
            store.spend("100").await,
            Err(StoreError::Exhausted { .. })
        ));
    }
}
