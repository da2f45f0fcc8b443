use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use amq_protocol_types::FieldTable;
use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    Channel, Consumer,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel_manager::ChannelManager;
use super::errors::{RabbitMQError, Result};
use super::exchange::ExchangeResolver;

/// How long `close` waits for an in-flight delivery to finish after the
/// consumer has been cancelled.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A delivered message as seen by handlers.
#[derive(Debug, Clone)]
pub struct Message {
    pub data: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    pub content_type: Option<String>,
    pub redelivered: bool,
}

impl Message {
    /// Payload decoded as UTF-8, invalid sequences replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl From<&Delivery> for Message {
    fn from(delivery: &Delivery) -> Self {
        Message {
            data: delivery.data.clone(),
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            content_type: delivery
                .properties
                .content_type()
                .as_ref()
                .map(|ct| ct.as_str().to_string()),
            redelivered: delivery.redelivered,
        }
    }
}

/// Processes one delivery. `Ok` acks it, `Err` nacks it with requeue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        (self)(message).await
    }
}

/// What to bind: exchange, routing key and queue settings.
#[derive(Debug, Clone, Default)]
pub struct ListenerSpec {
    pub exchange: String,
    pub routing_key: String,
    /// Empty means a server-named, exclusive, non-durable queue.
    pub queue: String,
    pub durable_queue: bool,
    pub exclusive_queue: bool,
}

impl ListenerSpec {
    fn queue_options(&self) -> QueueDeclareOptions {
        if self.queue.is_empty() {
            QueueDeclareOptions {
                exclusive: true,
                durable: false,
                ..QueueDeclareOptions::default()
            }
        } else {
            QueueDeclareOptions {
                durable: self.durable_queue,
                exclusive: self.exclusive_queue,
                ..QueueDeclareOptions::default()
            }
        }
    }
}

/// A live queue binding with its registered consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
    pub consumer_tag: String,
}

/// Binds a queue to an exchange and feeds its deliveries to a handler.
pub struct Listener {
    channels: Arc<ChannelManager>,
    resolver: Arc<ExchangeResolver>,
    active: Option<ActiveConsumer>,
}

struct ActiveConsumer {
    binding: Binding,
    channel: Channel,
    task: JoinHandle<()>,
}

impl Listener {
    pub fn new(channels: Arc<ChannelManager>, resolver: Arc<ExchangeResolver>) -> Self {
        Self {
            channels,
            resolver,
            active: None,
        }
    }

    /// Start consuming. A listener that is already consuming is closed first.
    pub async fn listen(
        &mut self,
        spec: &ListenerSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Binding> {
        if self.active.is_some() {
            self.close().await?;
        }

        let channel = self.channels.get_channel().await?;
        self.resolver.resolve_exchange(&spec.exchange).await?;

        let queue = channel
            .queue_declare(&spec.queue, spec.queue_options(), FieldTable::default())
            .await
            .map_err(|source| RabbitMQError::DeclareError {
                entity: format!("queue '{}'", spec.queue),
                source,
            })?;
        let queue_name = queue.name().as_str().to_string();
        debug!(queue = %queue_name, "Queue declared");

        channel
            .queue_bind(
                &queue_name,
                &spec.exchange,
                &spec.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|source| RabbitMQError::DeclareError {
                entity: format!("binding {} -> {}", spec.exchange, queue_name),
                source,
            })?;

        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(RabbitMQError::ConsumeError)?;

        let binding = Binding {
            exchange: spec.exchange.clone(),
            routing_key: spec.routing_key.clone(),
            queue: queue_name,
            consumer_tag,
        };
        info!(
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            queue = %binding.queue,
            consumer_tag = %binding.consumer_tag,
            "Consuming messages"
        );

        let task = tokio::spawn(consume_loop(
            consumer,
            channel.clone(),
            handler,
            binding.clone(),
        ));
        self.active = Some(ActiveConsumer {
            binding: binding.clone(),
            channel,
            task,
        });
        Ok(binding)
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.active.as_ref().map(|active| &active.binding)
    }

    /// Whether the consume loop is still running. It stops when the
    /// consumer is cancelled or its channel closes.
    pub fn is_consuming(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }

    /// Cancel the consumer and wait for the delivery in progress, if any.
    pub async fn close(&mut self) -> Result<()> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let ActiveConsumer {
            binding,
            channel,
            mut task,
        } = active;

        let cancelled = if channel.status().connected() {
            channel
                .basic_cancel(&binding.consumer_tag, BasicCancelOptions::default())
                .await
                .map_err(RabbitMQError::ConsumeError)
        } else {
            Ok(())
        };

        if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
            warn!(consumer_tag = %binding.consumer_tag, "Consumer did not stop in time, aborting");
            task.abort();
        }
        info!(consumer_tag = %binding.consumer_tag, "Listener closed");
        cancelled
    }
}

async fn consume_loop(
    mut consumer: Consumer,
    channel: Channel,
    handler: Arc<dyn MessageHandler>,
    binding: Binding,
) {
    while let Some(delivery) = consumer.next().await {
        match delivery {
            Ok(delivery) => handle_delivery(delivery, handler.as_ref(), &binding).await,
            Err(e) => {
                error!(consumer_tag = %binding.consumer_tag, "Error receiving message: {}", e);
                break;
            }
        }
    }

    // A cancelled consumer leaves its channel open; anything else means no
    // more deliveries will arrive for this binding.
    if channel.status().connected() {
        debug!(consumer_tag = %binding.consumer_tag, "Consume loop finished");
    } else {
        error!(
            exchange = %binding.exchange,
            queue = %binding.queue,
            consumer_tag = %binding.consumer_tag,
            "Consumer stopped, channel closed"
        );
    }
}

async fn handle_delivery(delivery: Delivery, handler: &dyn MessageHandler, binding: &Binding) {
    let message = Message::from(&delivery);
    debug!(
        queue = %binding.queue,
        redelivered = message.redelivered,
        bytes = message.data.len(),
        "Received message"
    );

    match handler.handle(message).await {
        Ok(()) => {
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                error!("Failed to acknowledge message: {}", e);
            }
        }
        Err(e) => {
            error!(queue = %binding.queue, "Error processing message, requeueing: {:#}", e);
            if let Err(e) = delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..BasicNackOptions::default()
                })
                .await
            {
                error!("Failed to negatively acknowledge message: {}", e);
            }
        }
    }
}
