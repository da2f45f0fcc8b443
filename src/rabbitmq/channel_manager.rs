use std::sync::Arc;

use lapin::{options::BasicQosOptions, Channel};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};

/// Configuration options for a RabbitMQ channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed per consumer (0 means unlimited)
    pub prefetch_count: u16,

    /// Channel identifier for logging (defaults to a UUID)
    pub id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            id: format!("channel-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

impl ChannelConfig {
    pub fn named(id: &str, prefetch_count: u16) -> Self {
        Self {
            prefetch_count,
            id: id.to_string(),
        }
    }
}

struct CachedChannel {
    generation: u64,
    channel: Channel,
}

/// Lazily opens and caches one channel on the shared connection.
///
/// The mutex serializes creation; the cached handle itself is a cheap clone
/// of lapin's internally synchronized channel.
pub struct ChannelManager {
    connection: Arc<ConnectionManager>,
    channel: Mutex<Option<CachedChannel>>,
    config: ChannelConfig,
}

impl ChannelManager {
    pub fn new(connection: Arc<ConnectionManager>, config: ChannelConfig) -> Self {
        debug!(
            channel_id = %config.id,
            prefetch = %config.prefetch_count,
            "Creating channel manager"
        );

        Self {
            connection,
            channel: Mutex::new(None),
            config,
        }
    }

    /// Get the cached channel, opening a new one if it is missing, closed, or
    /// belongs to a connection that has since been replaced.
    pub async fn get_channel(&self) -> Result<Channel> {
        let mut guard = self.channel.lock().await;
        let generation = self.connection.generation().await;

        let needs_new_channel = match &*guard {
            Some(cached) => {
                cached.generation != generation || !cached.channel.status().connected()
            }
            None => true,
        };

        if needs_new_channel {
            debug!(channel_id = %self.config.id, "Creating new channel");
            *guard = None;
            let (generation, channel) = self.connection.create_channel().await?;

            if self.config.prefetch_count > 0 {
                debug!("Setting channel QoS to {}", self.config.prefetch_count);
                channel
                    .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
                    .await
                    .map_err(RabbitMQError::ChannelError)?;
            }

            info!(channel_id = %self.config.id, "Channel created");
            *guard = Some(CachedChannel {
                generation,
                channel,
            });
        }

        guard
            .as_ref()
            .map(|cached| cached.channel.clone())
            .ok_or(RabbitMQError::NotConnected)
    }

    /// Forget the cached channel without closing it. The broker may already
    /// have closed it.
    pub async fn invalidate(&self) {
        if self.channel.lock().await.take().is_some() {
            debug!(channel_id = %self.config.id, "Discarded cached channel");
        }
    }

    /// Check if the cached channel is in a healthy state
    pub async fn is_healthy(&self) -> bool {
        match &*self.channel.lock().await {
            Some(cached) => cached.channel.status().connected(),
            None => false,
        }
    }

    /// Close the cached channel if present; a no-op otherwise.
    pub async fn close(&self) -> Result<()> {
        if let Some(cached) = self.channel.lock().await.take() {
            if cached.channel.status().connected() {
                info!(channel_id = %self.config.id, "Closing channel");
                cached
                    .channel
                    .close(200, "Closing channel")
                    .await
                    .map_err(RabbitMQError::ChannelError)?;
            }
        }
        Ok(())
    }

    /// Return the channel ID for logging
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn connection_manager(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.connection)
    }
}
