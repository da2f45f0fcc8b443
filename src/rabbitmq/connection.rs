use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::errors::{RabbitMQError, Result};

struct ConnectionState {
    url: Option<String>,
    connection: Option<Connection>,
    generation: u64,
}

/// Owns the single broker connection of a relay instance.
///
/// Every (re)connect bumps a generation counter. Channels opened by
/// [`ConnectionManager::create_channel`] are tagged with the generation they
/// belong to, so holders can tell that a reconnect invalidated them.
pub struct ConnectionManager {
    state: Mutex<ConnectionState>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        ConnectionManager {
            state: Mutex::new(ConnectionState {
                url: None,
                connection: None,
                generation: 0,
            }),
        }
    }

    /// Establish the connection, replacing (and closing) any live one.
    pub async fn connect(&self, url: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(previous) = state.connection.take() {
            info!("Reconnecting, closing existing RabbitMQ connection");
            if let Err(e) = previous.close(200, "Reconnecting").await {
                debug!("Ignoring error while closing previous connection: {}", e);
            }
        }
        // Channels of the old generation are stale from here on
        state.generation += 1;

        debug!("Attempting to connect to RabbitMQ at {}", url);
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|source| {
                error!("Failed to connect to RabbitMQ at {}: {:?}", url, source);
                RabbitMQError::ConnectionError {
                    url: url.to_string(),
                    source,
                }
            })?;

        connection.on_error(|err| {
            warn!("RabbitMQ connection error: {}", err);
        });

        info!(generation = state.generation, "Connected to RabbitMQ at {}", url);
        state.url = Some(url.to_string());
        state.connection = Some(connection);
        Ok(())
    }

    /// Open a new channel on the live connection.
    ///
    /// A missing connection is a precondition failure; nothing here connects
    /// implicitly.
    pub async fn create_channel(&self) -> Result<(u64, Channel)> {
        let state = self.state.lock().await;
        let connection = state.connection.as_ref().ok_or(RabbitMQError::NotConnected)?;
        if !connection.status().connected() {
            return Err(RabbitMQError::NotConnected);
        }

        let channel = connection
            .create_channel()
            .await
            .map_err(RabbitMQError::ChannelError)?;
        Ok((state.generation, channel))
    }

    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }

    pub async fn is_connected(&self) -> bool {
        self.state
            .lock()
            .await
            .connection
            .as_ref()
            .is_some_and(|conn| conn.status().connected())
    }

    /// URL of the last successful connect.
    pub async fn url(&self) -> Option<String> {
        self.state.lock().await.url.clone()
    }

    /// Close the connection if there is one. Calling it twice is harmless.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(conn) = state.connection.take() {
            info!("Closing RabbitMQ connection");
            state.generation += 1;
            if conn.status().connected() {
                conn.close(200, "Closing connection")
                    .await
                    .map_err(RabbitMQError::ChannelError)?;
            }
            info!("Closed RabbitMQ connection");
        }
        Ok(())
    }
}
