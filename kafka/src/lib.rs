//! Kafka event bus for voteflow: vote-event producer and the
//! partition-worker consumer.
//!
//! The producer keys every record by the event's first username so all votes
//! for one voter land on the same partition and settle in publication
//! order. The consumer enumerates the topic's partitions at startup and
//! spawns one worker per partition (capped), each owning its partition via
//! direct assignment; if enumeration fails or finds nothing it falls back
//! to a single consumer-group reader.
//!
//! Delivery is at-least-once. A worker commits an offset only after the
//! handler succeeded or the event was parked in the dead-letter sink, so a
//! poison event cannot wedge its partition but is never silently dropped.

#![forbid(unsafe_code)]

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use voteflow_core::model::VoteEvent;
use voteflow_core::retry::{retry_with_backoff, RetryPolicy};
use voteflow_core::{BusError, DeadLetterSink, VoteEventHandler, VotePublisher};

use async_trait::async_trait;

/// Worker cap: more partitions than this share nothing, they go unserved by
/// this replica (another replica's group reader picks up the slack).
const DEFAULT_MAX_WORKERS: usize = 8;

/// Pause after a read error before polling the partition again.
const READ_RETRY_PAUSE: Duration = Duration::from_secs(1);

fn metadata_timeout() -> Timeout {
    Timeout::After(Duration::from_secs(5))
}

/// Producer half of the bus.
pub struct VoteEventProducer {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl VoteEventProducer {
    /// Create the producer.
    ///
    /// # Errors
    ///
    /// [`BusError::Transport`] when the client cannot be constructed.
    pub fn new(brokers: &str, topic: &str) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| BusError::Transport(format!("producer create failed: {e}")))?;

        info!(topic, "vote-event producer created");
        Ok(Self {
            producer,
            topic: topic.to_string(),
            send_timeout: Duration::from_secs(5),
        })
    }
}

#[async_trait]
impl VotePublisher for VoteEventProducer {
    async fn publish(&self, event: &VoteEvent) -> Result<(), BusError> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| BusError::Decode(format!("event encode failed: {e}")))?;
        let key = event.partition_key().to_string();

        let record = FutureRecord::to(&self.topic).payload(&payload).key(&key);
        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok((partition, offset)) => {
                debug!(
                    key = %key,
                    partition,
                    offset,
                    ticket_version = %event.ticket_version,
                    "vote event published"
                );
                Ok(())
            }
            Err((kafka_error, _)) => Err(BusError::Publish {
                topic: self.topic.clone(),
                reason: kafka_error.to_string(),
            }),
        }
    }
}

/// Consumer half of the bus: settlement workers over the topic partitions.
pub struct VoteEventConsumer {
    brokers: String,
    topic: String,
    group_id: String,
    handler: Arc<dyn VoteEventHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry_policy: RetryPolicy,
    max_workers: usize,
}

impl VoteEventConsumer {
    /// Configure a consumer; nothing talks to the brokers until
    /// [`VoteEventConsumer::spawn`].
    #[must_use]
    pub fn new(
        brokers: &str,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn VoteEventHandler>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            brokers: brokers.to_string(),
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            handler,
            dead_letters,
            retry_policy: RetryPolicy::default(),
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }

    /// Override the worker cap.
    #[must_use]
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Override the settlement retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    fn base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false");
        config
    }

    /// Partition ids of the topic, from broker metadata.
    fn topic_partitions(&self) -> Result<Vec<i32>, BusError> {
        let probe: StreamConsumer = self
            .base_config()
            .create()
            .map_err(|e| BusError::Transport(format!("metadata client create failed: {e}")))?;
        let metadata = probe
            .fetch_metadata(Some(&self.topic), metadata_timeout())
            .map_err(|e| BusError::Transport(format!("metadata fetch failed: {e}")))?;

        let partitions = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.topic)
            .map(|t| t.partitions().iter().map(|p| p.id()).collect())
            .unwrap_or_default();
        Ok(partitions)
    }

    /// Start the settlement workers. Returns their join handles; each worker
    /// stops when `shutdown` fires.
    ///
    /// # Errors
    ///
    /// [`BusError::Subscribe`] when not even the fallback group reader can
    /// be created.
    pub fn spawn(
        &self,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<Vec<JoinHandle<()>>, BusError> {
        let partitions = match self.topic_partitions() {
            Ok(partitions) => partitions,
            Err(error) => {
                warn!(%error, "partition enumeration failed, using a consumer-group reader");
                Vec::new()
            }
        };

        if partitions.is_empty() {
            let worker = self.group_worker()?;
            info!(topic = %self.topic, group = %self.group_id, "settlement consumer started in group mode");
            return Ok(vec![worker_task(
                worker,
                0,
                self.handler.clone(),
                self.dead_letters.clone(),
                self.retry_policy.clone(),
                shutdown.subscribe(),
            )]);
        }

        let worker_count = effective_workers(partitions.len(), self.max_workers);
        if worker_count < partitions.len() {
            warn!(
                partitions = partitions.len(),
                workers = worker_count,
                "fewer workers than partitions, some partitions are unserved by this replica"
            );
        }

        let mut handles = Vec::with_capacity(worker_count);
        for (worker_id, partition) in partitions.into_iter().take(worker_count).enumerate() {
            let consumer = self.partition_worker(partition)?;
            info!(topic = %self.topic, partition, worker_id, "settlement worker assigned");
            handles.push(worker_task(
                consumer,
                worker_id,
                self.handler.clone(),
                self.dead_letters.clone(),
                self.retry_policy.clone(),
                shutdown.subscribe(),
            ));
        }
        Ok(handles)
    }

    /// A reader pinned to one partition, resuming from its stored offset.
    fn partition_worker(&self, partition: i32) -> Result<StreamConsumer, BusError> {
        let consumer: StreamConsumer = self.base_config().create().map_err(|e| {
            BusError::Subscribe {
                topic: self.topic.clone(),
                reason: format!("partition {partition} consumer create failed: {e}"),
            }
        })?;

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(&self.topic, partition, Offset::Stored)
            .map_err(|e| BusError::Subscribe {
                topic: self.topic.clone(),
                reason: format!("partition {partition} offset setup failed: {e}"),
            })?;
        consumer.assign(&assignment).map_err(|e| BusError::Subscribe {
            topic: self.topic.clone(),
            reason: format!("partition {partition} assign failed: {e}"),
        })?;
        Ok(consumer)
    }

    /// Fallback: one consumer-group reader over the whole topic.
    fn group_worker(&self) -> Result<StreamConsumer, BusError> {
        let consumer: StreamConsumer =
            self.base_config().create().map_err(|e| BusError::Subscribe {
                topic: self.topic.clone(),
                reason: format!("group consumer create failed: {e}"),
            })?;
        consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(|e| BusError::Subscribe {
                topic: self.topic.clone(),
                reason: format!("group subscribe failed: {e}"),
            })?;
        Ok(consumer)
    }
}

/// Number of workers actually spawned for `partitions` partitions under
/// `cap`.
#[must_use]
pub fn effective_workers(partitions: usize, cap: usize) -> usize {
    partitions.min(cap.max(1))
}

fn worker_task(
    consumer: StreamConsumer,
    worker_id: usize,
    handler: Arc<dyn VoteEventHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry_policy: RetryPolicy,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(worker_id, "settlement worker started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(worker_id, "settlement worker received shutdown signal");
                    break;
                }
                received = consumer.recv() => {
                    match received {
                        Err(error) => {
                            warn!(worker_id, %error, "read error, retrying shortly");
                            sleep(READ_RETRY_PAUSE).await;
                        }
                        Ok(message) => {
                            let settled = settle_message(
                                message.payload(),
                                worker_id,
                                handler.as_ref(),
                                dead_letters.as_ref(),
                                &retry_policy,
                            )
                            .await;
                            if settled {
                                if let Err(error) = consumer.commit_message(
                                    &message,
                                    rdkafka::consumer::CommitMode::Async,
                                ) {
                                    warn!(worker_id, %error, "offset commit failed");
                                }
                            }
                        }
                    }
                }
            }
        }
        info!(worker_id, "settlement worker stopped");
    })
}

/// Settle one delivery. Returns whether the offset may advance: `true` after
/// a successful handle, an unparseable payload (poison), or a successful
/// dead-letter record; `false` only when even the dead-letter write failed.
async fn settle_message(
    payload: Option<&[u8]>,
    worker_id: usize,
    handler: &dyn VoteEventHandler,
    dead_letters: &dyn DeadLetterSink,
    retry_policy: &RetryPolicy,
) -> bool {
    let Some(payload) = payload else {
        warn!(worker_id, "message with empty payload skipped");
        return true;
    };

    let event: VoteEvent = match serde_json::from_slice(payload) {
        Ok(event) => event,
        Err(error) => {
            warn!(worker_id, %error, "unparseable vote event skipped");
            return true;
        }
    };

    match retry_with_backoff(retry_policy, || handler.handle(&event)).await {
        Ok(()) => true,
        Err(error) => {
            error!(
                worker_id,
                ticket_version = %event.ticket_version,
                %error,
                "settlement failed after retries, dead-lettering"
            );
            match dead_letters
                .record(&event, &error.to_string(), retry_policy.total_attempts())
                .await
            {
                Ok(()) => true,
                Err(sink_error) => {
                    error!(worker_id, %sink_error, "dead-letter record failed, offset held back");
                    false
                }
            }
        }
    }
}
