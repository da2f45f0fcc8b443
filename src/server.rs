//! Inbound HTTP surface: republish request bodies onto exchanges.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::rabbitmq::{Payload, Publish, RabbitMQError};
use crate::relay::Relay;

/// What the routes need from the relay.
#[async_trait]
pub trait Backend: Publish {
    async fn is_connected(&self) -> bool;
}

#[async_trait]
impl Backend for Relay {
    async fn is_connected(&self) -> bool {
        Relay::is_connected(self).await
    }
}

#[derive(Debug, Deserialize)]
struct PublishPath {
    exchange: String,
    #[serde(default)]
    routing_key: String,
}

/// Publish failure rendered as a 500 with a structured body.
#[derive(Debug)]
pub struct ApiError(RabbitMQError);

impl From<RabbitMQError> for ApiError {
    fn from(error: RabbitMQError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("Publish request failed: {}", self.0);
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        let body = json!({
            "statusCode": status.as_u16(),
            "error": "Internal Server Error",
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

pub fn router(backend: Arc<dyn Backend>) -> Router {
    Router::new()
        .route("/publish/{exchange}", post(publish))
        .route("/publish/{exchange}/{routing_key}", post(publish))
        .route("/health", get(health))
        .with_state(backend)
}

async fn publish(
    State(backend): State<Arc<dyn Backend>>,
    Path(path): Path<PublishPath>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    backend
        .publish(
            &path.exchange,
            Payload::Bytes(body.to_vec()),
            &path.routing_key,
            content_type,
        )
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn health(State(backend): State<Arc<dyn Backend>>) -> Json<Value> {
    Json(json!({ "status": "ok", "connected": backend.is_connected().await }))
}

/// Bind the HTTP listener. `hostname` may be a name (`localhost`, a
/// container hostname) as well as an IP literal.
pub async fn bind(config: &ServerConfig) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind((config.hostname.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind to {}:{}", config.hostname, config.port))?;
    info!(
        "HTTP server listening on {} ({}:{})",
        listener.local_addr()?,
        config.hostname,
        config.port
    );
    Ok(listener)
}

/// Serve `router` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;
    info!("HTTP server stopped");
    Ok(())
}
