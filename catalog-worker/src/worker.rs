use std::{collections::HashMap, future::Future, panic::AssertUnwindSafe, sync::Arc};

use catalog_broker::{BrokerError, BrokerMessage, BrokerPort};
use catalog_models::{
    context::{RequestContext, TRACE_HEADER},
    errors::SendableError,
};
use futures_util::{FutureExt, StreamExt, future::BoxFuture};
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;

/// Async callback invoked for every delivery on its routing key.
pub type MessageHandler = Arc<
    dyn Fn(RequestContext, BrokerMessage) -> BoxFuture<'static, Result<(), SendableError>>
        + Send
        + Sync,
>;

type HandlerRegistry = Arc<RwLock<HashMap<String, MessageHandler>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("consumer worker is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Pulls deliveries from a broker and dispatches them, one at a time, to the
/// handler registered for their routing key. Successful handling is acked;
/// unknown keys, handler errors and handler panics are nacked.
pub struct ConsumerWorker {
    broker: Arc<dyn BrokerPort>,
    topics: Vec<String>,
    prefetch_count: usize,
    handlers: HandlerRegistry,
    state: Mutex<WorkerState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerWorker {
    pub fn new(broker: Arc<dyn BrokerPort>, topics: Vec<String>, prefetch_count: usize) -> Self {
        Self {
            broker,
            topics,
            prefetch_count,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            state: Mutex::new(WorkerState::Idle),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Registers `handler` for `routing_key`, replacing any previous one.
    pub fn register_handler<H, Fut>(&self, routing_key: impl Into<String>, handler: H)
    where
        H: Fn(RequestContext, BrokerMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SendableError>> + Send + 'static,
    {
        let routing_key = routing_key.into();
        let handler: MessageHandler =
            Arc::new(move |context, message| handler(context, message).boxed());
        let replaced = self
            .handlers
            .write()
            .insert(routing_key.clone(), handler)
            .is_some();
        if replaced {
            info!("Handler registered for topic: {} (replaced existing handler)", routing_key);
        } else {
            info!("Handler registered for topic: {}", routing_key);
        }
    }

    /// Routing keys the loop subscribes to: configured topics plus every key
    /// with a registered handler.
    pub fn routing_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.topics.clone();
        keys.extend(self.handlers.read().keys().cloned());
        keys.sort();
        keys.dedup();
        keys
    }

    pub async fn start(&self) -> Result<(), WorkerError> {
        let previous = {
            let mut state = self.state.lock();
            match *state {
                WorkerState::Running | WorkerState::Stopping => {
                    return Err(WorkerError::AlreadyRunning);
                }
                other => {
                    *state = WorkerState::Running;
                    other
                }
            }
        };

        if let Err(err) = self.broker.start().await {
            error!("Failed to start broker: {}", err);
            *self.state.lock() = previous;
            return Err(err.into());
        }

        let routing_keys = self.routing_keys();
        info!("Consumer worker started, listening to topics: {:?}", routing_keys);
        let handle = tokio::spawn(run_dispatch_loop(
            self.broker.clone(),
            routing_keys,
            self.prefetch_count,
            self.handlers.clone(),
        ));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), WorkerError> {
        info!("Stopping consumer worker...");
        {
            let mut state = self.state.lock();
            if *state == WorkerState::Running {
                *state = WorkerState::Stopping;
            }
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            if let Err(err) = task.await {
                if err.is_cancelled() {
                    info!("Consumer loop cancelled");
                } else {
                    error!("Consumer loop join error: {}", err);
                }
            }
        }

        let closed = self.broker.close().await;
        *self.state.lock() = WorkerState::Stopped;
        closed?;
        info!("Consumer worker stopped");
        Ok(())
    }
}

async fn run_dispatch_loop(
    broker: Arc<dyn BrokerPort>,
    routing_keys: Vec<String>,
    prefetch_count: usize,
    handlers: HandlerRegistry,
) {
    let mut deliveries = match broker.consume_many(&routing_keys, prefetch_count).await {
        Ok(stream) => stream,
        Err(err) => {
            error!("Failed to open consumer for {:?}: {}", routing_keys, err);
            return;
        }
    };

    while let Some((routing_key, message)) = deliveries.next().await {
        dispatch(broker.as_ref(), &handlers, &routing_key, message).await;
    }
    info!("Consumer stream ended");
}

async fn dispatch(
    broker: &dyn BrokerPort,
    handlers: &HandlerRegistry,
    routing_key: &str,
    message: BrokerMessage,
) {
    let handler = handlers.read().get(routing_key).cloned();
    let Some(handler) = handler else {
        warn!("No handler registered for topic: {}, nacking", routing_key);
        if let Err(err) = broker.nack(&message, true).await {
            error!("Failed to nack {} on {}: {}", message.delivery_tag, routing_key, err);
        }
        return;
    };

    let context = RequestContext::from_header(message.header(TRACE_HEADER));
    let delivery = message.clone();
    let outcome = AssertUnwindSafe(async move { handler(context, delivery).await })
        .catch_unwind()
        .await;

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(panic) => Some(panic_message(panic.as_ref())),
    };

    match failure {
        None => {
            if let Err(err) = broker.ack(&message).await {
                error!(
                    "[{}] Failed to ack {} on {}: {}",
                    context, message.delivery_tag, routing_key, err
                );
            }
        }
        Some(reason) => {
            error!(
                "[{}] Error processing message {} from {}: {}",
                context, message.delivery_tag, routing_key, reason
            );
            if let Err(err) = broker.nack(&message, true).await {
                error!(
                    "[{}] Failed to nack {} on {}: {}",
                    context, message.delivery_tag, routing_key, err
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {text}")
    } else if let Some(text) = panic.downcast_ref::<String>() {
        format!("handler panicked: {text}")
    } else {
        "handler panicked".to_string()
    }
}
