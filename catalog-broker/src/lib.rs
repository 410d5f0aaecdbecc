pub mod adapters;
mod errors;
pub mod in_flight;
pub mod in_memory;
pub mod lifecycle;
mod types;

pub use errors::BrokerError;
pub use types::{BrokerMessage, DeliveryTag, MessageBody, MessageHeaders, RawRecord};

use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Stream of deliveries for a single routing key.
pub type MessageStream = BoxStream<'static, BrokerMessage>;

/// Stream of `(routing_key, message)` deliveries across several routing keys.
pub type RoutedMessageStream = BoxStream<'static, (String, BrokerMessage)>;

/// Contract implemented by every message transport.
#[async_trait]
pub trait BrokerPort: Send + Sync + 'static {
    /// Create producer resources. Calling it on a running broker does nothing.
    async fn start(&self) -> Result<(), BrokerError>;

    /// Graceful shutdown. Calling it on a broker that is not running does nothing.
    async fn close(&self) -> Result<(), BrokerError>;

    /// Publish one message and wait for the transport to acknowledge it.
    async fn publish(
        &self,
        routing_key: &str,
        body: MessageBody,
        headers: Option<&MessageHeaders>,
    ) -> Result<(), BrokerError>;

    /// Open a consumer for one routing key. The stream ends on shutdown.
    async fn consume(
        &self,
        routing_key: &str,
        prefetch_count: usize,
    ) -> Result<MessageStream, BrokerError>;

    /// Open one consumer across several routing keys. The stream ends on shutdown.
    async fn consume_many(
        &self,
        routing_keys: &[String],
        prefetch_count: usize,
    ) -> Result<RoutedMessageStream, BrokerError>;

    /// Commit the position of a processed delivery.
    async fn ack(&self, message: &BrokerMessage) -> Result<(), BrokerError>;

    /// Withhold the commit so the delivery is seen again after a restart.
    async fn nack(&self, message: &BrokerMessage, requeue: bool) -> Result<(), BrokerError>;

    /// Refuse a delivery. Commit-offset transports treat this like `nack`.
    async fn reject(&self, message: &BrokerMessage, requeue: bool) -> Result<(), BrokerError> {
        self.nack(message, requeue).await
    }

    fn is_running(&self) -> bool;
}
