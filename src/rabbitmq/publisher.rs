use std::sync::Arc;

use async_trait::async_trait;
use lapin::{options::BasicPublishOptions, BasicProperties};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use super::channel_manager::ChannelManager;
use super::errors::{RabbitMQError, Result};
use super::exchange::ExchangeResolver;

/// A message body to publish.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Sent verbatim.
    Text(String),
    /// Sent verbatim.
    Bytes(Vec<u8>),
    /// Serialized to its JSON text form before sending.
    Json(Value),
}

impl Payload {
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Payload::Text(text) => Ok(text.into_bytes()),
            Payload::Bytes(bytes) => Ok(bytes),
            // A bare JSON string is already text
            Payload::Json(Value::String(text)) => Ok(text.into_bytes()),
            Payload::Json(value) => Ok(serde_json::to_vec(&value)?),
        }
    }

    fn default_content_type(&self) -> Option<&'static str> {
        match self {
            Payload::Json(Value::String(_)) => None,
            Payload::Json(_) => Some("application/json"),
            _ => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// Anything that can put a payload onto an exchange.
#[async_trait]
pub trait Publish: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        payload: Payload,
        routing_key: &str,
        content_type: Option<&str>,
    ) -> Result<()>;
}

/// Fire-and-forget publisher on the primary channel.
pub struct Publisher {
    channels: Arc<ChannelManager>,
    resolver: Arc<ExchangeResolver>,
}

impl Publisher {
    pub fn new(channels: Arc<ChannelManager>, resolver: Arc<ExchangeResolver>) -> Self {
        Self { channels, resolver }
    }
}

#[async_trait]
impl Publish for Publisher {
    /// Returns once the broker accepted the frame; no consumer is implied.
    async fn publish(
        &self,
        exchange: &str,
        payload: Payload,
        routing_key: &str,
        content_type: Option<&str>,
    ) -> Result<()> {
        self.resolver.resolve_exchange(exchange).await?;

        let content_type = content_type.or(payload.default_content_type());
        let body = payload.into_bytes()?;

        let mut properties = BasicProperties::default()
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);
        if let Some(content_type) = content_type {
            properties = properties.with_content_type(content_type.into());
        }

        let channel = self.channels.get_channel().await?;
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(RabbitMQError::PublishError)?;

        info!(
            "Published {} bytes to exchange '{}' with routing key '{}'",
            body.len(),
            exchange,
            routing_key
        );
        Ok(())
    }
}
