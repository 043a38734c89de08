//! Shared test harness: the full service stack over in-memory fakes.

#![allow(dead_code)] // Each test binary uses a different slice of the harness.

use std::sync::Arc;
use std::time::Duration;
use voteflow_core::{TicketStore, VoteStore};
use voteflow_server::services::{Role, TicketService, VoteService};
use voteflow_testing::{
    InMemoryLock, InMemoryTicketDurableTier, InMemoryTicketFastTier, InMemoryVoteCacheTier,
    InMemoryVoteDurableTier, LockNetwork, RecordingPublisher,
};

pub const REFRESH_INTERVAL: Duration = Duration::from_millis(50);
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(20);

/// One simulated replica plus handles on the shared backends.
pub struct Replica {
    pub fast: InMemoryTicketFastTier,
    pub durable: InMemoryTicketDurableTier,
    pub cache: InMemoryVoteCacheTier,
    pub tallies: InMemoryVoteDurableTier,
    pub network: LockNetwork,
    pub lock: InMemoryLock,
    pub publisher: RecordingPublisher,
    pub tickets: Arc<TicketService>,
    pub votes: Arc<VoteService>,
}

/// The backends shared by every replica of a simulated cluster.
#[derive(Clone)]
pub struct Cluster {
    pub fast: InMemoryTicketFastTier,
    pub durable: InMemoryTicketDurableTier,
    pub cache: InMemoryVoteCacheTier,
    pub tallies: InMemoryVoteDurableTier,
    pub network: LockNetwork,
    pub publisher: RecordingPublisher,
    pub max_usage_count: i32,
}

impl Cluster {
    pub fn new(max_usage_count: i32) -> Self {
        Self {
            fast: InMemoryTicketFastTier::new(),
            durable: InMemoryTicketDurableTier::new(),
            cache: InMemoryVoteCacheTier::new(),
            tallies: InMemoryVoteDurableTier::new(),
            network: LockNetwork::new(),
            publisher: RecordingPublisher::new(),
            max_usage_count,
        }
    }

    /// Boot one replica against the shared backends.
    pub fn replica(&self, role: Role) -> Replica {
        let lock = self.network.client();
        let ticket_store = TicketStore::new(Arc::new(self.fast.clone()), Arc::new(self.durable.clone()));
        let vote_store = VoteStore::new(Arc::new(self.cache.clone()), Arc::new(self.tallies.clone()));

        let tickets = Arc::new(TicketService::new(
            ticket_store.clone(),
            Arc::new(lock.clone()),
            role,
            REFRESH_INTERVAL,
            LOCK_TIMEOUT,
            self.max_usage_count,
        ));
        let votes = Arc::new(VoteService::new(
            tickets.clone(),
            ticket_store,
            vote_store,
            Arc::new(self.publisher.clone()),
        ));

        Replica {
            fast: self.fast.clone(),
            durable: self.durable.clone(),
            cache: self.cache.clone(),
            tallies: self.tallies.clone(),
            network: self.network.clone(),
            lock,
            publisher: self.publisher.clone(),
            tickets,
            votes,
        }
    }

    /// Stand-in for the settlement consumer: feed every published event
    /// through the given replica's handler, in publication order.
    pub async fn drain_bus(&self, replica: &Replica) {
        for event in self.publisher.drain() {
            replica
                .votes
                .process_vote_event(&event)
                .await
                .expect("settlement failed");
        }
    }
}

/// A producer-role replica on a fresh single-replica cluster.
pub fn producer_replica(max_usage_count: i32) -> (Cluster, Replica) {
    let cluster = Cluster::new(max_usage_count);
    let replica = cluster.replica(Role::Producer);
    (cluster, replica)
}
