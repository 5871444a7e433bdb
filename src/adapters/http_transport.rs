//! HTTP Transport Adapter
//!
//! Delivers command envelopes to node agents as JSON over HTTP. Each agent
//! accepts `POST <endpoint>/v0/command` and answers with a reply envelope.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};

use crate::bus::protocol::{Envelope, ReplyEnvelope};
use crate::domain::ports::NodeTransport;
use crate::error::{Error, Result};

/// Path node agents serve commands on.
pub const COMMAND_PATH: &str = "/v0/command";

/// Configuration for the HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Scheme prepended to endpoints registered without one
    pub default_scheme: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            default_scheme: "http".to_string(),
        }
    }
}

/// JSON-over-HTTP node transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    config: HttpTransportConfig,
    client: Client,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    /// Command URL for an agent endpoint.
    pub fn command_url(&self, endpoint: &str) -> String {
        let base = endpoint.trim_end_matches('/');
        if base.contains("://") {
            format!("{}{}", base, COMMAND_PATH)
        } else {
            format!("{}://{}{}", self.config.default_scheme, base, COMMAND_PATH)
        }
    }
}

#[async_trait]
impl NodeTransport for HttpTransport {
    #[instrument(skip(self, envelope), fields(node = %envelope.node, command = envelope.command.name()))]
    async fn send(&self, endpoint: &str, envelope: Envelope) -> Result<ReplyEnvelope> {
        let url = self.command_url(endpoint);
        let unreachable = |e: reqwest::Error| {
            debug!(url = %url, error = %e, "Node agent unreachable");
            Error::Timeout {
                node: envelope.node.to_string(),
                timeout_ms: self.config.connect_timeout.as_millis() as u64,
            }
        };

        let response = self
            .client
            .post(&url)
            .json(&envelope)
            .send()
            .await
            .map_err(unreachable)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::NodeRejected {
                node: envelope.node.to_string(),
                command: envelope.command.name().to_string(),
                reason: format!("HTTP {}: {}", status, body),
            });
        }

        response.json::<ReplyEnvelope>().await.map_err(|e| {
            Error::Protocol(format!(
                "node {} sent an unreadable reply: {}",
                envelope.node, e
            ))
        })
    }
}
