//! rdkafka-backed implementations of the consumer group and publisher seams.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::{Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, ClientContext};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::consumer::{Acknowledge, GroupConsumer, GroupEvent, Record};
use crate::error::{ConsumerError, PublishError};
use crate::producer::Publish;

/// How long a join waits for topic metadata before calling the broker
/// unreachable.
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Counts revocations reported by librdkafka so the group loop can end the
/// generation they belong to.
pub struct GroupContext {
    revocations: watch::Sender<u64>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!(partitions = partitions.count(), "partitions revoked");
                self.revocations.send_modify(|count| *count += 1);
            }
            Rebalance::Assign(partitions) => {
                info!(partitions = partitions.count(), "partitions assigned");
            }
            Rebalance::Error(e) => warn!(error = %e, "rebalance error"),
        }
    }
}

/// A consumer group member for a single topic.
pub struct KafkaGroup {
    consumer: Arc<StreamConsumer<GroupContext>>,
    topic: String,
    revocations: watch::Receiver<u64>,
    seen_revocations: AtomicU64,
}

impl KafkaGroup {
    /// Creates a group member that stores offsets only after a record has
    /// been handled.
    ///
    /// # Arguments
    /// * `brokers` - A comma-separated list of Kafka broker addresses.
    /// * `group_id` - The consumer group to join.
    /// * `topic` - The topic subscribed to on the first join.
    pub fn new(brokers: &str, group_id: &str, topic: &str) -> Result<Self, ConsumerError> {
        let (revocations, receiver) = watch::channel(0);
        let consumer: StreamConsumer<GroupContext> = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("auto.offset.reset", "earliest")
            .set("partition.assignment.strategy", "roundrobin")
            // Offsets are stored once a record has been fully handled and
            // committed by the auto-commit timer.
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create_with_context(GroupContext { revocations })?;

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: topic.to_string(),
            revocations: receiver,
            seen_revocations: AtomicU64::new(0),
        })
    }

    fn is_subscribed(&self) -> bool {
        self.consumer
            .subscription()
            .map(|list| list.elements().iter().any(|element| element.topic() == self.topic))
            .unwrap_or(false)
    }
}

/// Copies a message out of the consumer. Headers without a value are skipped.
fn to_record<M: Message>(message: &M) -> Record {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|header| header.value.map(|value| (header.key.to_string(), value.to_vec())))
                .collect()
        })
        .unwrap_or_default();
    Record {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    }
}

/// The offset stored for a handled record: the next one to read.
fn next_offset(record: &Record) -> i64 {
    record.offset + 1
}

impl Acknowledge for KafkaGroup {
    fn acknowledge(&self, record: &Record) -> Result<(), ConsumerError> {
        self.consumer
            .store_offset(&record.topic, record.partition, next_offset(record))
            .map_err(ConsumerError::from)
    }
}

impl GroupConsumer for KafkaGroup {
    async fn join(&self) -> Result<(), ConsumerError> {
        // librdkafka keeps membership alive across rebalances on its own;
        // subscribing again would force another rebalance.
        if !self.is_subscribed() {
            self.consumer.subscribe(&[self.topic.as_str()])?;
            info!(topic = %self.topic, "subscribed");
        }

        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        let brokers = tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(Some(topic.as_str()), METADATA_TIMEOUT)
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| {
            warn!(error = %e, "metadata lookup did not complete");
            ConsumerError::Closed
        })??;
        debug!(brokers, "broker metadata fetched");
        Ok(())
    }

    async fn poll(&self) -> GroupEvent {
        let mut revocations = self.revocations.clone();
        let current = *revocations.borrow_and_update();
        if self.seen_revocations.swap(current, Ordering::SeqCst) != current {
            return GroupEvent::Revoked;
        }

        tokio::select! {
            changed = revocations.changed() => match changed {
                Ok(()) => {
                    let current = *revocations.borrow_and_update();
                    self.seen_revocations.store(current, Ordering::SeqCst);
                    GroupEvent::Revoked
                }
                Err(_) => GroupEvent::Closed,
            },
            message = self.consumer.recv() => match message {
                Ok(message) => GroupEvent::Record(to_record(&message)),
                Err(e) => GroupEvent::Error(e.into()),
            },
        }
    }

    fn close(&self) {
        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            debug!(error = %e, "final offset commit skipped");
        }
        self.consumer.unsubscribe();
    }
}

/// Creates `topic` unless it already exists.
///
/// # Arguments
/// * `brokers` - A comma-separated list of Kafka broker addresses.
/// * `topic` - The topic to create.
/// * `partitions` - Partition count used when the topic is created.
/// * `replication` - Replication factor used when the topic is created.
pub async fn ensure_topic(brokers: &str, topic: &str, partitions: i32, replication: i32) -> Result<(), PublishError> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new().set("bootstrap.servers", brokers).create()?;

    let new_topic = NewTopic::new(topic, partitions, TopicReplication::Fixed(replication));
    let options = AdminOptions::new().operation_timeout(Some(Duration::from_secs(10)));
    for result in admin.create_topics([&new_topic], &options).await? {
        match result {
            Ok(name) => info!(topic = %name, partitions, replication, "topic created"),
            Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => info!(topic = %name, "topic already exists"),
            Err((name, code)) => {
                return Err(PublishError::CreateTopic {
                    topic: name,
                    reason: code.to_string(),
                })
            }
        }
    }
    Ok(())
}

pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaPublisher {
    pub fn new(brokers: &str, topic: &str) -> Result<Self, PublishError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }
}

impl Publish for KafkaPublisher {
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), PublishError> {
        let record = FutureRecord::to(&self.topic).key(key).payload(payload);
        match self.producer.send(record, Duration::from_secs(0)).await {
            Ok((partition, offset)) => {
                debug!(topic = %self.topic, partition, offset, "message delivered");
                Ok(())
            }
            Err((e, _)) => Err(e.into()),
        }
    }

    fn flush(&self, timeout: Duration) -> Result<(), PublishError> {
        self.producer.flush(timeout)?;
        Ok(())
    }
}
