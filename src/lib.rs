//! Relay between RabbitMQ exchanges and HTTP endpoints.
//!
//! Every configured exchange gets a listener whose deliveries are POSTed to a
//! target URL; `POST /publish/{exchange}/{routing_key}` puts request bodies
//! back onto an exchange.

pub mod config;
pub mod env;
pub mod forwarder;
pub mod rabbitmq;
pub mod relay;
pub mod server;

pub use config::{AppConfig, ExchangeTarget, RelayConfig, ServerConfig};
pub use forwarder::HttpForwarder;
pub use relay::Relay;
