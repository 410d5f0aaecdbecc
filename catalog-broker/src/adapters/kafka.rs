use crate::in_flight::InFlightTasks;
use crate::lifecycle::{Lifecycle, ShutdownBudget};
use crate::{
    BrokerError, BrokerMessage, BrokerPort, MessageBody, MessageHeaders, MessageStream, RawRecord,
    RoutedMessageStream,
};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Connection and timing options for [`KafkaBroker`].
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub bootstrap_servers: Vec<String>,
    pub consumer_group_id: String,
    pub producer_acks: String,
    pub session_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub rebalance_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Passed verbatim to both clients, e.g. `security.protocol` or `sasl.*`.
    pub security: Vec<(String, String)>,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec!["localhost:9092".into()],
            consumer_group_id: "catalog".into(),
            producer_acks: "all".into(),
            session_timeout: Duration::from_millis(30_000),
            heartbeat_interval: Duration::from_millis(10_000),
            rebalance_timeout: Duration::from_millis(60_000),
            shutdown_timeout: Duration::from_secs(30),
            security: Vec::new(),
        }
    }
}

struct KafkaInner {
    settings: KafkaSettings,
    lifecycle: Lifecycle,
    producer: Mutex<Option<FutureProducer>>,
    consumer: Mutex<Option<Arc<StreamConsumer>>>,
    in_flight: InFlightTasks,
}

/// Kafka adapter: one producer per broker instance and one consumer per
/// `consume`/`consume_many` call, with offsets committed manually on ack.
#[derive(Clone)]
pub struct KafkaBroker {
    inner: Arc<KafkaInner>,
}

impl KafkaBroker {
    pub fn new(settings: KafkaSettings) -> Result<Self, BrokerError> {
        if settings.bootstrap_servers.iter().all(|server| server.trim().is_empty()) {
            return Err(BrokerError::Configuration(
                "bootstrap servers are empty".into(),
            ));
        }
        if settings.consumer_group_id.trim().is_empty() {
            return Err(BrokerError::Configuration(
                "consumer group id is empty".into(),
            ));
        }

        Ok(Self {
            inner: Arc::new(KafkaInner {
                settings,
                lifecycle: Lifecycle::new(),
                producer: Mutex::new(None),
                consumer: Mutex::new(None),
                in_flight: InFlightTasks::new(),
            }),
        })
    }

    pub fn settings(&self) -> &KafkaSettings {
        &self.inner.settings
    }

    /// Publishes on a tracked background task. The task is drained (or
    /// cancelled) by `close`; failures are logged.
    pub fn spawn_publish(
        &self,
        routing_key: String,
        body: MessageBody,
        headers: Option<MessageHeaders>,
    ) -> Result<(), BrokerError> {
        self.inner.lifecycle.ensure_running("publish")?;
        let producer = self.producer()?;
        self.inner.in_flight.spawn(async move {
            if let Err(err) = send(&producer, &routing_key, body, headers.as_ref()).await {
                error!("Background publish to {} failed: {}", routing_key, err);
            }
        });
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    fn producer(&self) -> Result<FutureProducer, BrokerError> {
        self.inner.producer.lock().clone().ok_or(BrokerError::NotRunning)
    }

    fn base_config(&self) -> ClientConfig {
        let settings = &self.inner.settings;
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", settings.bootstrap_servers.join(","));
        for (key, value) in &settings.security {
            config.set(key.as_str(), value.as_str());
        }
        config
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = self.base_config();
        config.set("acks", self.inner.settings.producer_acks.as_str());
        config
    }

    fn consumer_config(&self, topic_count: usize, prefetch_count: usize) -> ClientConfig {
        let settings = &self.inner.settings;
        let mut config = self.base_config();
        config
            .set("group.id", settings.consumer_group_id.as_str())
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", millis(settings.session_timeout))
            .set("heartbeat.interval.ms", millis(settings.heartbeat_interval))
            .set("max.poll.interval.ms", millis(settings.rebalance_timeout))
            .set(
                "queued.min.messages",
                (prefetch_count.max(1) * topic_count.max(1)).to_string(),
            );
        config
    }

    /// Commits final offsets, unsubscribes and drops the consumer on the
    /// blocking pool. The wait is bounded by `limit`; the blocking task keeps
    /// ownership of the consumer if it overruns.
    async fn stop_consumer(consumer: Arc<StreamConsumer>, limit: Duration) {
        let finalize = tokio::task::spawn_blocking(move || {
            match consumer.commit_consumer_state(CommitMode::Sync) {
                Ok(()) => debug!("Final offsets committed"),
                Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {
                    debug!("No offsets to commit on shutdown")
                }
                Err(err) => error!("Error committing offsets: {}", err),
            }
            consumer.unsubscribe();
            drop(consumer);
        });

        match tokio::time::timeout(limit, finalize).await {
            Ok(Ok(())) => info!("Kafka consumer stopped"),
            Ok(Err(err)) => error!("Kafka consumer shutdown task failed: {}", err),
            Err(_) => warn!("Consumer shutdown timeout, leaving it to finish in the background"),
        }
    }

    async fn stop_producer(producer: FutureProducer, limit: Duration) {
        let flushing = producer.clone();
        let flush = tokio::task::spawn_blocking(move || flushing.flush(Timeout::After(limit)));

        match tokio::time::timeout(limit, flush).await {
            Ok(Ok(Ok(()))) => info!("Kafka producer flushed"),
            Ok(Ok(Err(err))) => warn!("Producer shutdown timeout: {}", err),
            Ok(Err(err)) => error!("Kafka producer shutdown task failed: {}", err),
            Err(_) => warn!("Producer shutdown timeout"),
        }
    }
}

fn millis(duration: Duration) -> String {
    duration.as_millis().to_string()
}

fn to_kafka_headers(headers: &MessageHeaders) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new(), |owned, (key, value)| {
            owned.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            })
        })
}

async fn send(
    producer: &FutureProducer,
    topic: &str,
    body: MessageBody,
    headers: Option<&MessageHeaders>,
) -> Result<(), BrokerError> {
    let payload = body.into_bytes();
    let mut record = FutureRecord::<(), [u8]>::to(topic).payload(payload.as_slice());
    if let Some(headers) = headers {
        record = record.headers(to_kafka_headers(headers));
    }

    producer
        .send(record, Timeout::Never)
        .await
        .map(|_| ())
        .map_err(|(err, _)| BrokerError::transport("publish", err))
}

fn to_broker_message<M: Message>(message: &M) -> BrokerMessage {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    (
                        header.key.to_string(),
                        header.value.map(<[u8]>::to_vec).unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    BrokerMessage::from_record(RawRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
        headers,
        timestamp_ms: message.timestamp().to_millis(),
    })
}

/// Unsubscribes and drops a consumer off the async threads. Dropping the
/// last handle blocks until librdkafka has closed the consumer.
fn release_consumer(consumer: Arc<StreamConsumer>) {
    let release = move || {
        consumer.unsubscribe();
        drop(consumer);
        debug!("Kafka consumer released");
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(release);
        }
        Err(_) => release(),
    }
}

/// Holds a consumer for the lifetime of one stream. While the consumer is
/// still the adapter's active one, `close` owns its teardown; a superseded
/// consumer is released when its stream goes away.
struct ConsumerScope {
    consumer: Option<Arc<StreamConsumer>>,
    inner: Arc<KafkaInner>,
}

impl Drop for ConsumerScope {
    fn drop(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };
        let active = self.inner.consumer.lock();
        if active
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &consumer))
        {
            // the adapter's handle outlives this one
            drop(consumer);
            drop(active);
            debug!("Kafka consumer stream dropped, teardown deferred to close");
            return;
        }
        drop(active);
        release_consumer(consumer);
    }
}

struct ConsumeState {
    scope: ConsumerScope,
    shutdown: CancellationToken,
}

async fn next_record(state: ConsumeState) -> Option<((String, BrokerMessage), ConsumeState)> {
    let consumer = state.scope.consumer.as_ref()?;
    loop {
        let received = tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("Shutdown signal received, stopping consume");
                return None;
            }
            received = consumer.recv() => {
                received.map(|message| to_broker_message(&message))
            }
        };

        match received {
            Ok(message) => {
                if state.shutdown.is_cancelled() {
                    info!("Shutdown signal received, stopping consume");
                    return None;
                }
                return Some(((message.routing_key.clone(), message), state));
            }
            Err(err) => warn!("Kafka consumer error: {}", err),
        }
    }
}

#[async_trait]
impl BrokerPort for KafkaBroker {
    async fn start(&self) -> Result<(), BrokerError> {
        if !self.inner.lifecycle.begin_start() {
            return Ok(());
        }

        info!("Starting Kafka broker");
        let producer: FutureProducer = match self.producer_config().create() {
            Ok(producer) => producer,
            Err(err) => {
                self.inner.lifecycle.abort_start();
                return Err(BrokerError::transport("start", err));
            }
        };
        *self.inner.producer.lock() = Some(producer);
        self.inner.lifecycle.mark_running();
        info!("Kafka broker started successfully");
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.inner.lifecycle.begin_shutdown() {
            return Ok(());
        }

        info!("Closing Kafka broker (graceful shutdown)");
        let budget = ShutdownBudget::start(self.inner.settings.shutdown_timeout);

        self.inner.in_flight.drain(budget.drain_limit()).await;

        let consumer = self.inner.consumer.lock().take();
        if let Some(consumer) = consumer {
            Self::stop_consumer(consumer, budget.consumer_limit()).await;
        }

        let producer = self.inner.producer.lock().take();
        if let Some(producer) = producer {
            Self::stop_producer(producer, budget.producer_limit()).await;
        }

        self.inner.lifecycle.mark_stopped();
        info!("Kafka broker closed");
        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        body: MessageBody,
        headers: Option<&MessageHeaders>,
    ) -> Result<(), BrokerError> {
        self.inner.lifecycle.ensure_running("publish")?;
        let producer = self.producer()?;
        send(&producer, routing_key, body, headers).await
    }

    async fn consume(
        &self,
        routing_key: &str,
        prefetch_count: usize,
    ) -> Result<MessageStream, BrokerError> {
        let routed = self
            .consume_many(&[routing_key.to_string()], prefetch_count)
            .await?;
        Ok(routed.map(|(_, message)| message).boxed())
    }

    async fn consume_many(
        &self,
        routing_keys: &[String],
        prefetch_count: usize,
    ) -> Result<RoutedMessageStream, BrokerError> {
        self.inner.lifecycle.ensure_running("consume")?;

        let consumer: StreamConsumer = self
            .consumer_config(routing_keys.len(), prefetch_count)
            .create()
            .map_err(|err| BrokerError::transport("consume", err))?;
        let topics: Vec<&str> = routing_keys.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|err| BrokerError::transport("subscribe", err))?;

        let consumer = Arc::new(consumer);
        let previous = self.inner.consumer.lock().replace(Arc::clone(&consumer));
        if let Some(previous) = previous {
            warn!("Replacing the active Kafka consumer");
            release_consumer(previous);
        }
        info!("Kafka consumer subscribed to {:?}", routing_keys);

        let state = ConsumeState {
            scope: ConsumerScope {
                consumer: Some(consumer),
                inner: Arc::clone(&self.inner),
            },
            shutdown: self.inner.lifecycle.shutdown_token(),
        };
        Ok(stream::unfold(state, next_record).boxed())
    }

    async fn ack(&self, message: &BrokerMessage) -> Result<(), BrokerError> {
        let consumer = self.inner.consumer.lock().clone();
        let Some(consumer) = consumer else {
            return Ok(());
        };

        let tag = message.delivery_tag;
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &message.routing_key,
                tag.partition,
                Offset::Offset(tag.offset + 1),
            )
            .map_err(|err| BrokerError::transport("ack", err))?;

        let committed =
            tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync)).await;
        match committed {
            Ok(Ok(())) => debug!("Committed {} on {}", tag, message.routing_key),
            Ok(Err(err)) => error!("Error committing message {}: {}", tag, err),
            Err(err) => error!("Commit task for message {} failed: {}", tag, err),
        }
        Ok(())
    }

    async fn nack(&self, message: &BrokerMessage, requeue: bool) -> Result<(), BrokerError> {
        debug!(
            "Message {} on {} nacked (requeue={}), offset will not be committed",
            message.delivery_tag, message.routing_key, requeue
        );
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.inner.lifecycle.is_running()
    }
}
