use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rabbitmq_hooks::config::{self, CONFIG_FILE_NAME};
use rabbitmq_hooks::{env, server, Relay};

#[derive(Debug, Parser)]
#[command(name = "rabbitmq-hooks", version, about = "Relay RabbitMQ exchanges to HTTP endpoints")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "RABBITMQ_HOOKS_CONFIG")]
    config: Option<PathBuf>,

    /// Write a default configuration file and exit
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if cli.init {
        let path = cli.config.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        config::create_default_config_file(&path)?;
        println!("Configuration file created at: {}", path.display());
        return Ok(());
    }

    let mut app_config = config::load_config(cli.config.as_deref())?;
    env::apply_env_overrides(&mut app_config)?;
    let listener = server::bind(&app_config.server).await?;

    let relay = Arc::new(Relay::new(app_config.rabbitmq));
    let bindings = match relay.start().await {
        Ok(bindings) => bindings,
        Err(e) => {
            if let Err(close_error) = relay.close().await {
                error!("Failed to close relay after startup error: {}", close_error);
            }
            return Err(e.into());
        }
    };
    info!("Started {} listener(s)", bindings.len());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown requested");
    };
    let served = server::serve(listener, server::router(relay.clone()), shutdown).await;

    relay.close().await?;
    served
}
