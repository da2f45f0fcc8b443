//! Composition root: one connection, one primary channel, a listener per
//! configured exchange target and a publisher for inbound HTTP payloads.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::RelayConfig;
use crate::forwarder::HttpForwarder;
use crate::rabbitmq::{
    Binding, ChannelConfig, ChannelManager, ConnectionManager, ExchangePolicy, ExchangeResolver,
    Listener, ListenerSpec, Payload, Publish, Publisher, RabbitMQError, Result,
};

pub struct Relay {
    config: RelayConfig,
    client: Client,
    connection: Arc<ConnectionManager>,
    channels: Arc<ChannelManager>,
    resolver: Arc<ExchangeResolver>,
    publisher: Publisher,
    listeners: Mutex<Vec<Listener>>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self::with_client(config, Client::new())
    }

    pub fn with_client(config: RelayConfig, client: Client) -> Self {
        let connection = Arc::new(ConnectionManager::new());
        let channels = Arc::new(ChannelManager::new(
            connection.clone(),
            ChannelConfig::named("primary", config.prefetch),
        ));
        let resolver = Arc::new(ExchangeResolver::new(
            channels.clone(),
            ExchangePolicy::from_generate_flag(config.generate_exchange),
        ));
        let publisher = Publisher::new(channels.clone(), resolver.clone());

        Self {
            config,
            client,
            connection,
            channels,
            resolver,
            publisher,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Connect and start a listener per exchange target.
    ///
    /// A connection failure aborts startup. A target whose exchange is
    /// missing (with generation disabled) or whose forwarder cannot be built
    /// is logged and skipped; the other targets still start. Any other
    /// listener failure closes the relay before the error is returned.
    ///
    /// Fails with `AlreadyStarted` while the relay is connected or has
    /// listeners; call `close` first.
    pub async fn start(&self) -> Result<Vec<Binding>> {
        let mut listeners = self.listeners.lock().await;
        if !listeners.is_empty() || self.connection.is_connected().await {
            return Err(RabbitMQError::AlreadyStarted);
        }

        info!("Connecting to RabbitMQ");
        self.connection.connect(&self.config.url).await?;

        let mut started = Vec::new();
        for target in &self.config.exchanges {
            let forwarder = match HttpForwarder::new(self.client.clone(), target) {
                Ok(forwarder) => forwarder,
                Err(e) => {
                    error!(exchange = %target.name, "Skipping exchange target: {:#}", e);
                    continue;
                }
            };

            let mut listener = Listener::new(self.channels.clone(), self.resolver.clone());
            match listener
                .listen(&ListenerSpec::from(target), Arc::new(forwarder))
                .await
            {
                Ok(binding) => {
                    info!(
                        exchange = %binding.exchange,
                        target_url = %target.target_url,
                        "Relaying exchange to HTTP target"
                    );
                    started.push(binding);
                    listeners.push(listener);
                }
                Err(e) if e.is_not_found() => {
                    error!(exchange = %target.name, "Listener not started: {}", e);
                }
                Err(e) => {
                    error!(exchange = %target.name, "Startup failed, closing relay: {}", e);
                    // close() takes the listeners lock itself
                    drop(listeners);
                    if let Err(close_error) = self.close().await {
                        warn!("Failed to close relay after startup error: {}", close_error);
                    }
                    return Err(e);
                }
            }
        }
        Ok(started)
    }

    /// Bindings of every listener whose consumer is still running.
    pub async fn bindings(&self) -> Vec<Binding> {
        self.listeners
            .lock()
            .await
            .iter()
            .filter(|listener| listener.is_consuming())
            .filter_map(|listener| listener.binding().cloned())
            .collect()
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    /// Cancel all consumers, then close channels and the connection.
    pub async fn close(&self) -> Result<()> {
        info!("Closing relay");
        let mut first_error: Option<RabbitMQError> = None;

        for mut listener in self.listeners.lock().await.drain(..) {
            if let Err(e) = listener.close().await {
                warn!("Failed to cancel consumer: {}", e);
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.channels.close().await {
            warn!("Failed to close primary channel: {}", e);
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.resolver.close().await {
            warn!("Failed to close verification channel: {}", e);
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.connection.close().await {
            warn!("Failed to close connection: {}", e);
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Publish for Relay {
    async fn publish(
        &self,
        exchange: &str,
        payload: Payload,
        routing_key: &str,
        content_type: Option<&str>,
    ) -> Result<()> {
        self.publisher
            .publish(exchange, payload, routing_key, content_type)
            .await
    }
}
