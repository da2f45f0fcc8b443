use std::sync::Arc;

use amq_protocol_types::FieldTable;
use lapin::{options::ExchangeDeclareOptions, Error as LapinError, ExchangeKind};
use tracing::{debug, info, warn};

use super::channel_manager::{ChannelConfig, ChannelManager};
use super::errors::{is_not_found_reply, RabbitMQError, Result};

/// How exchange references are resolved, chosen once per relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePolicy {
    /// Declare the exchange (fanout, non-durable). Idempotent.
    Generate,
    /// Passively check that the exchange already exists.
    Verify,
}

impl ExchangePolicy {
    pub fn from_generate_flag(generate_exchange: bool) -> Self {
        if generate_exchange {
            ExchangePolicy::Generate
        } else {
            ExchangePolicy::Verify
        }
    }
}

/// Creates or verifies exchanges before they are bound to or published on.
///
/// Passive checks run on a dedicated verification channel because the broker
/// closes a channel whose passive declare fails. After any failed check that
/// channel is dropped and a fresh one is opened for the next check.
pub struct ExchangeResolver {
    primary: Arc<ChannelManager>,
    verification: ChannelManager,
    policy: ExchangePolicy,
}

impl ExchangeResolver {
    pub fn new(primary: Arc<ChannelManager>, policy: ExchangePolicy) -> Self {
        let verification = ChannelManager::new(
            primary.connection_manager(),
            ChannelConfig::named("exchange-verification", 0),
        );
        Self {
            primary,
            verification,
            policy,
        }
    }

    pub async fn resolve_exchange(&self, name: &str) -> Result<()> {
        match self.policy {
            ExchangePolicy::Generate => self.declare(name).await,
            ExchangePolicy::Verify => self.check_exists(name).await,
        }
    }

    async fn declare(&self, name: &str) -> Result<()> {
        let channel = self.primary.get_channel().await?;
        channel
            .exchange_declare(
                name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: false,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| RabbitMQError::DeclareError {
                entity: format!("exchange {}", name),
                source,
            })?;
        debug!(exchange = %name, "Exchange declared");
        Ok(())
    }

    async fn check_exists(&self, name: &str) -> Result<()> {
        let channel = self.verification.get_channel().await?;
        let outcome = channel
            .exchange_declare(
                name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;

        match outcome {
            Ok(()) => {
                debug!(exchange = %name, "Exchange exists");
                Ok(())
            }
            Err(source) => {
                // The broker closes the channel on a failed passive declare
                self.verification.invalidate().await;
                Err(check_failure(name, source))
            }
        }
    }

    /// Close the verification channel. The primary channel is not ours.
    pub async fn close(&self) -> Result<()> {
        self.verification.close().await
    }
}

/// Map a failed passive declare: 404 becomes `ExchangeNotFound`, anything
/// else is passed through as lapin reported it.
fn check_failure(name: &str, source: LapinError) -> RabbitMQError {
    if is_not_found_reply(&source) {
        info!(exchange = %name, "Exchange does not exist");
        RabbitMQError::ExchangeNotFound(name.to_string())
    } else {
        warn!(exchange = %name, "Exchange check failed: {}", source);
        RabbitMQError::Amqp(source)
    }
}
