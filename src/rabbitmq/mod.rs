// src/rabbitmq/mod.rs
// Broker side of the relay: connection, channels, exchanges, consumers, publishing

pub mod errors;
pub mod connection;

mod channel_manager;
mod exchange;
mod listener;
mod publisher;

// Re-export specific items to simplify imports elsewhere
pub use channel_manager::{ChannelConfig, ChannelManager};
pub use connection::ConnectionManager;
pub use errors::{RabbitMQError, Result};
pub use exchange::{ExchangePolicy, ExchangeResolver};
pub use listener::{Binding, Listener, ListenerSpec, Message, MessageHandler};
pub use publisher::{Payload, Publish, Publisher};
