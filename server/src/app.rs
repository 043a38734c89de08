//! Bootstrap and lifecycle: wire the backends, elect a role, run the HTTP
//! server, and coordinate graceful shutdown.
//!
//! Startup order mirrors the dependency graph: durable tier, fast tier,
//! lock backend, service-start election, bus producer, ticket producer
//! tasks, settlement workers, HTTP server. Any failure before the server is
//! listening is fatal and surfaces as a non-zero exit.
//!
//! On SIGINT/SIGTERM the HTTP server drains first, then one broadcast stops
//! the producer tickers and settlement workers, every held lock is
//! released, and the clients close.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use voteflow_core::{
    BusError, DistributedLock, LockError, StoreError, TicketStore, VoteStore,
};
use voteflow_etcd::EtcdLock;
use voteflow_kafka::{VoteEventConsumer, VoteEventProducer};
use voteflow_mysql::{MySqlDeadLetterQueue, MySqlStore};
use voteflow_redis::{connection_url, RedLock, RedisStore};

use crate::api::{build_router, build_schema};
use crate::config::{Config, LockBackend};
use crate::services::{Role, TicketService, VoteService, SERVICE_START_LOCK, SERVICE_START_WAIT};

/// Grace period for background tasks after the HTTP server stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Fatal initialization or runtime failures.
#[derive(Debug, Error)]
pub enum AppError {
    /// A storage tier could not be reached.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The lock backend could not be reached.
    #[error(transparent)]
    Lock(#[from] LockError),
    /// The event bus could not be set up.
    #[error(transparent)]
    Bus(#[from] BusError),
    /// The HTTP listener failed.
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Run the service until a shutdown signal.
///
/// # Errors
///
/// Any initialization failure, or an HTTP server failure while running.
pub async fn run(config: Config, instance: u16) -> Result<(), AppError> {
    // Durable tier first: everything authoritative lives here.
    let mysql = Arc::new(
        MySqlStore::connect(
            &config.mysql.master,
            &config.mysql.slave,
            config.mysql.max_open_conns,
            config.mysql.max_idle_conns,
        )
        .await?,
    );

    // Fast tier, including the decrement script preload.
    let redis_url = connection_url(
        &config.redis.data_address,
        &config.redis.password,
        config.redis.db,
    );
    info!(pool_size = config.redis.pool_size, "connecting redis fast tier");
    let redis = Arc::new(
        RedisStore::connect(&redis_url, config.redis.timeout(), config.redis.max_retries).await?,
    );

    let lock = build_lock(&config).await?;

    let ticket_store = TicketStore::new(redis.clone(), mysql.clone());
    let vote_store = VoteStore::new(redis.clone(), mysql.clone());

    // Service-start election: the winner mints for the process lifetime,
    // everyone else is a follower for the process lifetime.
    let role = match lock.acquire(SERVICE_START_LOCK, SERVICE_START_WAIT).await {
        Ok(true) => Role::Producer,
        Ok(false) => Role::Follower,
        Err(error) => {
            warn!(%error, "service-start lock unavailable, starting as follower");
            Role::Follower
        }
    };
    info!(instance, ?role, "service-start election settled");

    let (shutdown_tx, _) = broadcast::channel::<()>(8);

    let tickets = Arc::new(TicketService::new(
        ticket_store.clone(),
        lock.clone(),
        role,
        config.ticket.refresh_interval(),
        config.ticket.lock_timeout(),
        config.ticket.max_usage_count,
    ));
    let producer_handles = tickets.start_producer(&shutdown_tx);

    let publisher = Arc::new(VoteEventProducer::new(
        &config.kafka.broker_list(),
        &config.kafka.topic,
    )?);
    let votes = Arc::new(VoteService::new(
        tickets.clone(),
        ticket_store,
        vote_store,
        publisher,
    ));

    let dead_letters = Arc::new(MySqlDeadLetterQueue::new(mysql.master_pool().clone()));
    let consumer = VoteEventConsumer::new(
        &config.kafka.broker_list(),
        &config.kafka.topic,
        &config.kafka.group_id,
        votes.clone(),
        dead_letters,
    );
    let worker_handles = consumer.spawn(&shutdown_tx)?;

    let schema = build_schema(votes);
    let router = build_router(schema, &config.graphql.path);

    let port = config.effective_port(instance);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, path = %config.graphql.path, "voteflow listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("http server stopped, shutting down background tasks");
    let _ = shutdown_tx.send(());
    join_with_grace(producer_handles, "producer").await;
    join_with_grace(worker_handles, "settlement worker").await;

    lock.release_all().await;
    lock.close().await;
    info!("shutdown complete");
    Ok(())
}

/// Build the configured lock backend.
async fn build_lock(config: &Config) -> Result<Arc<dyn DistributedLock>, LockError> {
    match config.lock.backend {
        LockBackend::Etcd => {
            let lock = EtcdLock::connect(&config.etcd.endpoints, config.etcd.dial_timeout()).await?;
            Ok(Arc::new(lock))
        }
        LockBackend::Redlock => {
            let lock = RedLock::connect(
                &config.redis.lock_addresses,
                &config.redis.password,
                config.redis.db,
                config.ticket.lock_retry_count,
                config.redis.timeout(),
            )
            .await?;
            Ok(Arc::new(lock))
        }
    }
}

async fn join_with_grace(handles: Vec<JoinHandle<()>>, kind: &str) {
    for (index, handle) in handles.into_iter().enumerate() {
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(kind, index, %error, "background task failed"),
            Err(_) => warn!(kind, index, "background task shutdown timed out"),
        }
    }
}

/// Resolve on SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C"),
        () = terminate => info!("received SIGTERM"),
    }
}
