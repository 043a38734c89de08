//! End-to-end scenarios over the in-memory backends: the seeded suite from
//! the service contract plus the cluster-wide accounting invariants.

mod common;

use common::{producer_replica, Cluster, LOCK_TIMEOUT};
use voteflow_core::DistributedLock;
use voteflow_core::model::VoteRequest;
use voteflow_server::services::{Role, SERVICE_START_LOCK};

/// S1: a single happy vote settles into the tally, the audit log, and an
/// invalidated-then-repopulated cache.
#[tokio::test]
async fn happy_single_vote() {
    let (cluster, replica) = producer_replica(1000);
    replica.tickets.mint().await;

    let response = replica
        .votes
        .ticket_and_vote(vec!["A".to_string()])
        .await
        .unwrap();
    assert!(response.success, "unexpected rejection: {}", response.message);

    cluster.drain_bus(&replica).await;

    let vote = replica.votes.user_vote("A").await.unwrap();
    assert_eq!(vote.votes, 1);
    assert_eq!(cluster.tallies.votes("A"), 1);

    let log = cluster.tallies.log();
    assert_eq!(log.len(), 1);
    let version = cluster.fast.newest().unwrap();
    assert_eq!(log[0], ("A".to_string(), version));
}

/// S2: five concurrent votes against a budget of three; exactly three
/// succeed and the tally never exceeds the budget.
#[tokio::test]
async fn exhaustion_bounds_concurrent_votes() {
    let (cluster, replica) = producer_replica(3);
    replica.tickets.mint().await;

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let votes = replica.votes.clone();
        tasks.push(tokio::spawn(async move {
            votes.ticket_and_vote(vec!["B".to_string()]).await.unwrap()
        }));
    }

    let mut accepted = 0;
    let mut rejected = 0;
    for task in tasks {
        let response = task.await.unwrap();
        if response.success {
            accepted += 1;
        } else {
            rejected += 1;
            assert!(
                response.message.contains("no remaining usages")
                    || response.message.contains("exhausted"),
                "unexpected rejection message: {}",
                response.message
            );
        }
    }
    assert_eq!(accepted, 3);
    assert_eq!(rejected, 2);

    cluster.drain_bus(&replica).await;
    assert!(cluster.tallies.votes("B") <= 3);
    assert_eq!(cluster.tallies.votes("B"), 3);
}

/// S3: a ticket superseded by a newer mint is rejected with a version
/// mismatch and credits nothing.
#[tokio::test]
async fn superseded_ticket_is_rejected() {
    let (cluster, replica) = producer_replica(1000);
    replica.tickets.mint().await;
    let old_ticket = replica.tickets.current_ticket().await.unwrap();

    // The next refresh supersedes the ticket the client is still holding.
    replica.tickets.mint().await;

    let response = replica
        .votes
        .vote(&VoteRequest {
            usernames: vec!["C".to_string()],
            ticket: old_ticket,
        })
        .await
        .unwrap();
    assert!(!response.success);
    assert!(
        response.message.contains("superseded"),
        "message should name the version mismatch: {}",
        response.message
    );

    cluster.drain_bus(&replica).await;
    assert_eq!(cluster.tallies.votes("C"), 0);
}

/// S4 (failover): when the replica holding the service-start lock dies, its
/// locks lapse and the next replica to boot wins the election and resumes
/// minting.
#[tokio::test]
async fn producer_failover_resumes_minting() {
    let cluster = Cluster::new(1000);

    // First boot wins the election and mints.
    let first = cluster.replica(Role::Producer);
    assert!(first
        .lock
        .acquire(SERVICE_START_LOCK, LOCK_TIMEOUT)
        .await
        .unwrap());
    first.tickets.mint().await;
    let version_before = cluster.fast.newest().unwrap();

    // A late replica loses the election while the producer lives, and stays
    // a follower for its whole life.
    let standby = cluster.replica(Role::Follower);
    assert!(!standby
        .lock
        .acquire(SERVICE_START_LOCK, LOCK_TIMEOUT)
        .await
        .unwrap());

    // The producer dies; its leases lapse.
    cluster.network.kill(&first.lock);

    // The next boot wins the freed lock and resumes minting.
    let successor = cluster.replica(Role::Producer);
    assert!(successor
        .lock
        .acquire(SERVICE_START_LOCK, LOCK_TIMEOUT)
        .await
        .unwrap());
    successor.tickets.mint().await;

    let version_after = cluster.fast.newest().unwrap();
    assert!(
        version_after.parse::<i128>().unwrap() > version_before.parse::<i128>().unwrap(),
        "minting did not resume after failover"
    );
}

/// S5: a bus outage falls back to synchronous settlement; the vote still
/// succeeds and the durable tier plus cache reflect it immediately.
#[tokio::test]
async fn bus_outage_settles_synchronously() {
    let (cluster, replica) = producer_replica(1000);
    replica.tickets.mint().await;
    // Warm the cache so the invalidation is observable.
    let _ = replica.votes.user_vote("D").await.unwrap();
    cluster.publisher.fail_publishes(true);

    let response = replica
        .votes
        .ticket_and_vote(vec!["D".to_string()])
        .await
        .unwrap();
    assert!(response.success, "fallback should succeed: {}", response.message);

    // Settled without any consumer involvement.
    assert!(cluster.publisher.events().is_empty());
    assert_eq!(cluster.tallies.votes("D"), 1);
    let version = cluster.fast.newest().unwrap();
    assert_eq!(cluster.durable.remaining(&version), Some(999));
    assert!(!cluster.cache.contains("D"), "cache entry must be invalidated");
}

/// S6: every event for one voter carries the same partition key and settles
/// in publication order.
#[tokio::test]
async fn per_voter_events_settle_in_order() {
    let cluster = Cluster::new(1000);
    let first = cluster.replica(Role::Producer);
    let second = cluster.replica(Role::Follower);
    first.tickets.mint().await;

    for round in 0..5 {
        let replica = if round % 2 == 0 { &first } else { &second };
        let response = replica
            .votes
            .ticket_and_vote(vec!["E".to_string()])
            .await
            .unwrap();
        assert!(response.success);
        let response = replica
            .votes
            .ticket_and_vote(vec!["E".to_string()])
            .await
            .unwrap();
        assert!(response.success);
    }

    let events = cluster.publisher.events();
    assert_eq!(events.len(), 10);
    assert!(events.iter().all(|e| e.partition_key() == "E"));
    assert!(
        events.windows(2).all(|w| w[0].voted_at <= w[1].voted_at),
        "publication order must be monotone in voted_at"
    );

    cluster.drain_bus(&first).await;
    assert_eq!(cluster.tallies.votes("E"), 10);
    assert_eq!(cluster.tallies.log().len(), 10);
}

/// Bounded spend: across replicas and heavy concurrency, successful spends
/// never exceed the ticket budget.
#[tokio::test]
async fn bounded_spend_across_replicas() {
    let cluster = Cluster::new(5);
    let first = cluster.replica(Role::Producer);
    let second = cluster.replica(Role::Follower);
    first.tickets.mint().await;
    let ticket = first.tickets.current_ticket().await.unwrap();

    let mut tasks = Vec::new();
    for spender in 0..20 {
        let tickets = if spender % 2 == 0 {
            first.tickets.clone()
        } else {
            second.tickets.clone()
        };
        let ticket = ticket.clone();
        tasks.push(tokio::spawn(async move {
            tickets.use_ticket(&ticket).await.is_ok()
        }));
    }

    let mut successes = 0;
    for task in tasks {
        if task.await.unwrap() {
            successes += 1;
        }
    }
    assert_eq!(successes, 5);
}

/// The latest-version pointer only ever moves forward, numerically.
#[tokio::test]
async fn latest_version_is_strictly_monotone() {
    let (cluster, replica) = producer_replica(1000);

    let mut versions = Vec::new();
    for _ in 0..3 {
        replica.tickets.mint().await;
        versions.push(cluster.fast.newest().unwrap().parse::<i128>().unwrap());
    }
    assert!(versions.windows(2).all(|w| w[0] < w[1]), "versions: {versions:?}");
}

/// Authority: every version a client can observe has a durable row.
#[tokio::test]
async fn observed_versions_are_durably_recorded() {
    let (cluster, replica) = producer_replica(1000);

    for _ in 0..3 {
        replica.tickets.mint().await;
        let observed = replica.tickets.current_ticket().await.unwrap();
        assert!(cluster.durable.contains(&observed.version));
    }
}

/// Tally soundness: with a healthy bus, after the drain the tally total
/// equals the number of accepted votes.
#[tokio::test]
async fn tallies_match_accepted_votes_after_drain() {
    let (cluster, replica) = producer_replica(1000);
    replica.tickets.mint().await;

    let voters = ["A", "B", "C", "A", "F", "Z", "A"];
    let mut accepted = 0;
    for voter in voters {
        let response = replica
            .votes
            .ticket_and_vote(vec![voter.to_string()])
            .await
            .unwrap();
        if response.success {
            accepted += 1;
        }
    }

    cluster.drain_bus(&replica).await;
    assert_eq!(cluster.tallies.total_votes(), accepted);
    assert_eq!(cluster.tallies.votes("A"), 3);
}

/// A consumer redelivery (at-least-once) is absorbed without wedging:
/// the duplicate settles again and over-counts exactly once, never more.
#[tokio::test]
async fn duplicate_delivery_is_bounded_by_the_ticket_budget() {
    let (cluster, replica) = producer_replica(1000);
    replica.tickets.mint().await;

    let response = replica
        .votes
        .ticket_and_vote(vec!["G".to_string()])
        .await
        .unwrap();
    assert!(response.success);

    let events = cluster.publisher.drain();
    assert_eq!(events.len(), 1);
    replica.votes.process_vote_event(&events[0]).await.unwrap();
    // The bus redelivers the same event.
    replica.votes.process_vote_event(&events[0]).await.unwrap();

    // Documented at-least-once behavior: the duplicate increments again...
    assert_eq!(cluster.tallies.votes("G"), 2);
    // ...but the spend itself happened once, in the fast tier.
    let version = cluster.fast.newest().unwrap();
    assert_eq!(cluster.durable.remaining(&version), Some(998));
}

/// Mints archive the superseded ticket into the history table.
#[tokio::test]
async fn superseded_tickets_are_archived() {
    let (cluster, replica) = producer_replica(1000);
    replica.tickets.mint().await;
    let first_version = cluster.fast.newest().unwrap();
    replica.tickets.mint().await;

    let history = cluster.durable.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version, first_version);
}

/// Multi-user votes are all-or-nothing per event.
#[tokio::test]
async fn multi_user_vote_credits_every_name() {
    let (cluster, replica) = producer_replica(1000);
    replica.tickets.mint().await;

    let response = replica
        .votes
        .ticket_and_vote(vec!["X".to_string(), "Y".to_string(), "Z".to_string()])
        .await
        .unwrap();
    assert!(response.success);

    cluster.drain_bus(&replica).await;
    assert_eq!(cluster.tallies.votes("X"), 1);
    assert_eq!(cluster.tallies.votes("Y"), 1);
    assert_eq!(cluster.tallies.votes("Z"), 1);
    assert_eq!(cluster.tallies.log().len(), 3);
}

/// Invalid usernames are rejected before any ticket is spent.
#[tokio::test]
async fn invalid_usernames_spend_nothing() {
    let (cluster, replica) = producer_replica(5);
    replica.tickets.mint().await;

    for bad in [vec![], vec!["a".to_string()], vec!["AB".to_string()]] {
        let response = replica.votes.ticket_and_vote(bad).await.unwrap();
        assert!(!response.success);
    }

    let version = cluster.fast.newest().unwrap();
    let ticket = replica.tickets.current_ticket().await.unwrap();
    assert_eq!(ticket.version, version);
    assert_eq!(ticket.remaining_usages, 5, "budget must be untouched");
}

/// A tampered ticket value fails validation even at the right version.
#[tokio::test]
async fn tampered_ticket_value_is_rejected() {
    let (_cluster, replica) = producer_replica(1000);
    replica.tickets.mint().await;

    let mut forged = replica.tickets.current_ticket().await.unwrap();
    forged.value = "f".repeat(32);

    let response = replica
        .votes
        .vote(&VoteRequest {
            usernames: vec!["H".to_string()],
            ticket: forged,
        })
        .await
        .unwrap();
    assert!(!response.success);
    assert!(response.message.contains("does not match"));
}

/// Fast-tier eviction (the record TTL) degrades to the durable tier: the
/// ticket is still spendable because the durable row repopulates the cache.
#[tokio::test]
async fn evicted_fast_record_repopulates_from_durable() {
    let (cluster, replica) = producer_replica(1000);
    replica.tickets.mint().await;
    let version = cluster.fast.newest().unwrap();

    cluster.fast.evict(&version);

    let ticket = replica.tickets.current_ticket().await.unwrap();
    assert_eq!(ticket.version, version);

    let response = replica
        .votes
        .vote(&VoteRequest {
            usernames: vec!["K".to_string()],
            ticket,
        })
        .await
        .unwrap();
    assert!(response.success);
}
