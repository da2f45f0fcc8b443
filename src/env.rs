use std::env;

use anyhow::{Context, Result};
use dotenv::dotenv;
use tracing::debug;

use crate::config::AppConfig;

pub const RABBITMQ_URL: &str = "RABBITMQ_URL";
pub const PORT: &str = "PORT";
pub const HOSTNAME: &str = "HOSTNAME";
pub const RABBITMQ_PREFETCH_COUNT: &str = "RABBITMQ_PREFETCH_COUNT";

/// Load `.env` (if present) and apply environment overrides to `config`.
pub fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    dotenv().ok();
    apply_overrides_from(config, |key| env::var(key).ok())
}

/// Apply overrides using `lookup` as the variable source.
pub fn apply_overrides_from<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup(RABBITMQ_URL) {
        debug!("Using broker URL from {}", RABBITMQ_URL);
        config.rabbitmq.url = url;
    }
    if let Some(hostname) = lookup(HOSTNAME) {
        config.server.hostname = hostname;
    }
    if let Some(port) = lookup(PORT) {
        config.server.port = port
            .parse()
            .with_context(|| format!("{} must be a port number, got '{}'", PORT, port))?;
    }
    if let Some(prefetch) = lookup(RABBITMQ_PREFETCH_COUNT) {
        config.rabbitmq.prefetch = prefetch.parse().with_context(|| {
            format!("{} must be a number, got '{}'", RABBITMQ_PREFETCH_COUNT, prefetch)
        })?;
    }
    config.validate()
}
