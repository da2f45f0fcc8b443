//! Forwards broker messages to an HTTP endpoint.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use crate::config::ExchangeTarget;
use crate::rabbitmq::{Message, MessageHandler};

/// POSTs `{"message": <payload>}` to a target URL for every delivery.
///
/// Any transport failure or non-2xx status is returned as an error, which the
/// listener turns into a nack with requeue.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: Client,
    target_url: String,
    headers: HeaderMap,
}

impl HttpForwarder {
    pub fn new(client: Client, target: &ExchangeTarget) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &target.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid header name '{}'", name))?;
            let header_value = HeaderValue::from_str(value)
                .with_context(|| format!("Invalid value for header '{}'", name))?;
            headers.insert(header_name, header_value);
        }
        // HeaderMap lookups are case-insensitive
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        Ok(Self {
            client,
            target_url: target.target_url.clone(),
            headers,
        })
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

#[async_trait]
impl MessageHandler for HttpForwarder {
    async fn handle(&self, message: Message) -> Result<()> {
        let payload = message.text();
        debug!(target_url = %self.target_url, "Forwarding message");

        let body = serde_json::to_vec(&json!({ "message": payload }))?;
        let response = self
            .client
            .post(&self.target_url)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to send message to {}", self.target_url))?;

        response
            .error_for_status()
            .with_context(|| format!("Target {} rejected message", self.target_url))?;
        Ok(())
    }
}
