use crate::lifecycle::Lifecycle;
use crate::{
    BrokerError, BrokerMessage, BrokerPort, MessageBody, MessageHeaders, MessageStream, RawRecord,
    RoutedMessageStream,
};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct TopicLog {
    records: Vec<RawRecord>,
    committed: i64,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
    lifecycle: Lifecycle,
}

/// Single-partition, process-local broker with commit-offset semantics:
/// every `consume_many` call starts from the last committed offset, so
/// deliveries that were never acked are seen again.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the next record the consumer group would start from.
    pub fn committed_offset(&self, topic: &str) -> i64 {
        self.shared
            .state
            .lock()
            .topics
            .get(topic)
            .map(|log| log.committed)
            .unwrap_or(0)
    }

    /// Number of records published to `topic`.
    pub fn published(&self, topic: &str) -> usize {
        self.shared
            .state
            .lock()
            .topics
            .get(topic)
            .map(|log| log.records.len())
            .unwrap_or(0)
    }
}

struct Cursor {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    positions: Vec<(String, i64)>,
    next: usize,
}

impl Cursor {
    fn take_next(&mut self) -> Option<RawRecord> {
        let state = self.shared.state.lock();
        let count = self.positions.len();
        for step in 0..count {
            let index = (self.next + step) % count;
            let (topic, position) = &mut self.positions[index];
            let record = state
                .topics
                .get(topic.as_str())
                .and_then(|log| log.records.get(*position as usize));
            if let Some(record) = record {
                *position += 1;
                self.next = (index + 1) % count;
                return Some(record.clone());
            }
        }
        None
    }
}

async fn next_delivery(mut cursor: Cursor) -> Option<((String, BrokerMessage), Cursor)> {
    loop {
        let shared = Arc::clone(&cursor.shared);
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if cursor.shutdown.is_cancelled() {
            info!("Shutdown signal received, stopping consume");
            return None;
        }

        if let Some(record) = cursor.take_next() {
            let message = BrokerMessage::from_record(record);
            return Some(((message.routing_key.clone(), message), cursor));
        }

        tokio::select! {
            _ = cursor.shutdown.cancelled() => {}
            _ = &mut notified => {}
        }
    }
}

fn now_ms() -> Option<i64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|elapsed| elapsed.as_millis() as i64)
}

#[async_trait]
impl BrokerPort for InMemoryBroker {
    async fn start(&self) -> Result<(), BrokerError> {
        if self.shared.lifecycle.mark_running() {
            info!("In-memory broker started");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.shared.lifecycle.begin_shutdown() {
            return Ok(());
        }
        self.shared.notify.notify_waiters();
        self.shared.lifecycle.mark_stopped();
        info!("In-memory broker closed");
        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        body: MessageBody,
        headers: Option<&MessageHeaders>,
    ) -> Result<(), BrokerError> {
        self.shared.lifecycle.ensure_running("publish")?;

        let mut guard = self.shared.state.lock();
        let log = guard.topics.entry(routing_key.to_string()).or_default();
        let record = RawRecord {
            topic: routing_key.to_string(),
            partition: 0,
            offset: log.records.len() as i64,
            key: None,
            payload: Some(body.into_bytes()),
            headers: headers
                .map(|headers| {
                    headers
                        .iter()
                        .map(|(key, value)| (key.clone(), value.as_bytes().to_vec()))
                        .collect()
                })
                .unwrap_or_default(),
            timestamp_ms: now_ms(),
        };
        log.records.push(record);
        drop(guard);

        self.shared.notify.notify_waiters();
        Ok(())
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
        _prefetch_count: usize,
    ) -> Result<RoutedMessageStream, BrokerError> {
        self.shared.lifecycle.ensure_running("consume")?;

        let positions = {
            let guard = self.shared.state.lock();
            routing_keys
                .iter()
                .map(|key| {
                    let committed = guard.topics.get(key).map(|log| log.committed).unwrap_or(0);
                    (key.clone(), committed)
                })
                .collect::<Vec<_>>()
        };

        let cursor = Cursor {
            shared: Arc::clone(&self.shared),
            shutdown: self.shared.lifecycle.shutdown_token(),
            positions,
            next: 0,
        };
        Ok(stream::unfold(cursor, next_delivery).boxed())
    }

    async fn ack(&self, message: &BrokerMessage) -> Result<(), BrokerError> {
        let mut guard = self.shared.state.lock();
        let log = guard
            .topics
            .entry(message.routing_key.clone())
            .or_default();
        log.committed = log.committed.max(message.delivery_tag.offset + 1);
        Ok(())
    }

    async fn nack(&self, message: &BrokerMessage, requeue: bool) -> Result<(), BrokerError> {
        debug!(
            "Message {} on {} nacked (requeue={}), offset not committed",
            message.delivery_tag, message.routing_key, requeue
        );
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.lifecycle.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next_within<S>(stream: &mut S) -> Option<S::Item>
    where
        S: futures_util::Stream + Unpin,
    {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn publish_requires_a_running_broker() {
        let broker = InMemoryBroker::new();
        let result = broker.publish("orders", "x".into(), None).await;
        assert!(matches!(result, Err(BrokerError::NotRunning)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_safe_before_start() {
        let broker = InMemoryBroker::new();
        broker.close().await.unwrap();
        broker.start().await.unwrap();
        broker.start().await.unwrap();
        assert!(broker.is_running());
        broker.close().await.unwrap();
        broker.close().await.unwrap();
        assert!(!broker.is_running());
    }

    #[tokio::test]
    async fn unacked_deliveries_come_back_after_restart() {
        let broker = InMemoryBroker::new();
        broker.start().await.unwrap();
        broker.publish("orders", "a".into(), None).await.unwrap();
        broker.publish("orders", "b".into(), None).await.unwrap();

        let mut stream = broker.consume("orders", 1).await.unwrap();
        let first = next_within(&mut stream).await.unwrap();
        broker.ack(&first).await.unwrap();
        let second = next_within(&mut stream).await.unwrap();
        broker.nack(&second, true).await.unwrap();
        assert_eq!(broker.committed_offset("orders"), 1);

        broker.close().await.unwrap();
        assert!(next_within(&mut stream).await.is_none());

        broker.start().await.unwrap();
        let mut stream = broker.consume("orders", 1).await.unwrap();
        let redelivered = next_within(&mut stream).await.unwrap();
        assert_eq!(redelivered.body.as_deref(), Some("b"));
        assert_eq!(redelivered.delivery_tag.offset, 1);
    }

    #[tokio::test]
    async fn consume_many_interleaves_keys_and_waits_for_new_records() {
        let broker = InMemoryBroker::new();
        broker.start().await.unwrap();
        let keys = vec!["orders".to_string(), "refunds".to_string()];
        let mut stream = broker.consume_many(&keys, 10).await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut headers = MessageHeaders::new();
            headers.insert("trace-id".into(), "t-1".into());
            publisher
                .publish("refunds", "r".into(), Some(&headers))
                .await
                .unwrap();
        });

        let (key, message) = next_within(&mut stream).await.unwrap();
        assert_eq!(key, "refunds");
        assert_eq!(message.header("trace-id"), Some(&b"t-1"[..]));
    }
}
