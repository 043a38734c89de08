//! Ticket lifecycle: the leader-elected producer and the spender.
//!
//! Every replica runs the producer scaffolding, but only the replica that
//! won the service-start lock at boot ever mints; the losers are followers
//! for the life of the process. The designated producer still contends for
//! the producer lock on every tick, so at most one new version is in flight
//! across the fleet at any time.
//!
//! Two tickers drive the producer:
//!
//! - the refresh ticker (every `refresh_interval`) runs the mint sequence,
//! - the maintainer ticker (every `refresh_interval / 2`) opportunistically
//!   re-takes the producer lock and deposits a signal in a single-slot
//!   mailbox, sparing the next refresh tick its own acquire round trip.

use chrono::{DateTime, Utc};
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};
use voteflow_core::model::{Ticket, TicketHistory};
use voteflow_core::{DistributedLock, StoreError, TicketStore, VoteError};

/// Held for the process lifetime by the replica that mints.
pub const SERVICE_START_LOCK: &str = "voteflow:service:start:lock";

/// Serializes individual mints across the fleet.
pub const PRODUCER_LOCK: &str = "ticket:producer:lock";

/// How long a replica waits for the service-start lock at boot.
pub const SERVICE_START_WAIT: Duration = Duration::from_secs(30);

/// Whether this replica won the service-start election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Never mints; serves reads and spends only.
    Follower,
    /// Designated producer; contends for the producer lock each tick.
    Producer,
}

/// Ticket producer and spender.
pub struct TicketService {
    store: TicketStore,
    lock: Arc<dyn DistributedLock>,
    role: Role,
    refresh_interval: Duration,
    lock_timeout: Duration,
    max_usage_count: i32,
}

impl TicketService {
    /// Assemble the service. `role` comes from the service-start election
    /// in the bootstrap path.
    #[must_use]
    pub fn new(
        store: TicketStore,
        lock: Arc<dyn DistributedLock>,
        role: Role,
        refresh_interval: Duration,
        lock_timeout: Duration,
        max_usage_count: i32,
    ) -> Self {
        Self {
            store,
            lock,
            role,
            refresh_interval,
            lock_timeout,
            max_usage_count,
        }
    }

    /// This replica's election outcome.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Start the producer tasks. Followers get the refresh scaffolding only;
    /// the designated producer additionally runs the lock maintainer.
    pub fn start_producer(
        self: &Arc<Self>,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        // Single-slot mailbox from the maintainer to the refresh loop.
        let (lock_signal_tx, lock_signal_rx) = mpsc::channel::<()>(1);

        let mut handles = vec![self.clone().refresh_loop(shutdown.subscribe(), lock_signal_rx)];
        if self.role == Role::Producer {
            handles.push(self.clone().maintainer_loop(shutdown.subscribe(), lock_signal_tx));
        }
        info!(role = ?self.role, interval_ms = self.refresh_interval.as_millis() as u64, "ticket producer started");
        handles
    }

    fn refresh_loop(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
        mut lock_signal: mpsc::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.refresh_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("ticket refresh loop stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if self.role == Role::Producer {
                            self.refresh_ticket(&mut lock_signal).await;
                        }
                    }
                }
            }
        })
    }

    fn maintainer_loop(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
        lock_signal: mpsc::Sender<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.refresh_interval / 2;
            let mut ticker = interval_at(Instant::now() + period, period);
            self.try_reacquire_producer_lock(&lock_signal).await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("producer lock maintainer stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.try_reacquire_producer_lock(&lock_signal).await;
                    }
                }
            }
        })
    }

    /// Opportunistically take the producer lock; on success leave a signal
    /// for the next refresh tick. The send is non-blocking: a full mailbox
    /// means an earlier signal is still unconsumed, which is fine.
    async fn try_reacquire_producer_lock(&self, lock_signal: &mpsc::Sender<()>) {
        match self.lock.acquire(PRODUCER_LOCK, self.lock_timeout).await {
            Ok(true) => {
                let _ = lock_signal.try_send(());
                debug!("producer lock reacquired by maintainer");
            }
            Ok(false) => {}
            Err(error) => {
                debug!(%error, "maintainer could not take the producer lock");
            }
        }
    }

    /// One refresh tick: get the producer lock (from the maintainer's
    /// signal if possible), mint, release.
    async fn refresh_ticket(&self, lock_signal: &mut mpsc::Receiver<()>) {
        let already_held = lock_signal.try_recv().is_ok();
        if !already_held {
            match self.lock.acquire(PRODUCER_LOCK, self.lock_timeout).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("producer lock contended, skipping this tick");
                    return;
                }
                Err(error) => {
                    warn!(%error, "producer lock acquire failed, skipping this tick");
                    return;
                }
            }
        }

        self.mint().await;

        if let Err(error) = self.lock.release(PRODUCER_LOCK).await {
            warn!(%error, "producer lock release failed");
        }
    }

    /// Run one mint sequence. The write order carries the correctness: the
    /// durable save aborts the mint on failure; fast-tier and pointer
    /// failures are logged and survived (the durable row repopulates on the
    /// first read miss); the history archive is last and best-effort.
    pub async fn mint(&self) {
        let now = Utc::now();
        let ticket = Ticket {
            value: random_ticket_value(),
            version: version_for(now),
            remaining_usages: self.max_usage_count,
            expires_at: now + self.refresh_interval,
            created_at: now,
        };

        // The ticket being superseded, for the history archive.
        let previous = match self.store.newest_version().await {
            Ok(Some(version)) => self.store.current(&version).await.ok(),
            _ => None,
        };

        if let Err(error) = self.store.publish(&ticket).await {
            warn!(%error, version = %ticket.version, "mint aborted, durable save failed");
            return;
        }
        debug!(version = %ticket.version, expires_at = %ticket.expires_at, "ticket minted");

        if let Some(previous) = previous {
            if previous.version != ticket.version {
                let history = TicketHistory {
                    version: previous.version,
                    ticket_value: previous.value,
                    created_at: previous.created_at,
                    expired_at: now,
                };
                if let Err(error) = self.store.archive(&history).await {
                    warn!(%error, "ticket history archive failed");
                }
            }
        }
    }

    /// The currently spendable ticket.
    ///
    /// # Errors
    ///
    /// [`VoteError::NoTicket`] before the first mint, exhaustion when the
    /// current ticket has no usages left, store failures otherwise.
    pub async fn current_ticket(&self) -> Result<Ticket, VoteError> {
        let version = self
            .store
            .newest_version()
            .await?
            .ok_or(VoteError::NoTicket)?;
        let ticket = self.store.current(&version).await?;
        if ticket.remaining_usages <= 0 {
            return Err(VoteError::Store(StoreError::Exhausted { version }));
        }
        Ok(ticket)
    }

    /// Check that a presented ticket is the current one and untampered.
    ///
    /// # Errors
    ///
    /// [`VoteError::TicketExpired`] on a version mismatch,
    /// [`VoteError::TicketRejected`] on a value mismatch.
    pub async fn validate(&self, ticket: &Ticket) -> Result<(), VoteError> {
        let latest = self
            .store
            .newest_version()
            .await?
            .ok_or(VoteError::NoTicket)?;
        if ticket.version != latest {
            return Err(VoteError::TicketExpired {
                presented: ticket.version.clone(),
                latest,
            });
        }

        let stored = self.store.stored(&ticket.version).await?;
        if ticket.value != stored.value {
            return Err(VoteError::TicketRejected);
        }
        Ok(())
    }

    /// Spend one use of the presented ticket: validate, then the fast-tier
    /// atomic decrement. Lock-free across replicas; the fast tier's script
    /// serializes concurrent spends.
    ///
    /// # Errors
    ///
    /// Validation errors, or exhaustion from the decrement.
    pub async fn use_ticket(&self, ticket: &Ticket) -> Result<(), VoteError> {
        self.validate(ticket).await?;
        self.store.spend(&ticket.version).await?;
        Ok(())
    }
}

/// Versions are wall-clock nanoseconds, so they sort numerically in mint
/// order. (The nanosecond clock only overflows i64 in 2262; the microsecond
/// fallback keeps the ordering property regardless.)
fn version_for(now: DateTime<Utc>) -> String {
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1000))
        .to_string()
}

/// 16 bytes of randomness, hex-encoded.
fn random_ticket_value() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_sort_in_mint_order() {
        let earlier = version_for(Utc::now());
        std::thread::sleep(Duration::from_millis(2));
        let later = version_for(Utc::now());
        assert!(later.parse::<i128>().unwrap() > earlier.parse::<i128>().unwrap());
    }

    #[test]
    fn ticket_values_are_32_hex_chars() {
        let value = random_ticket_value();
        assert_eq!(value.len(), 32);
        assert!(value.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(value, random_ticket_value());
    }
}
