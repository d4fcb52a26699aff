use std::time::Duration;

use anyhow::{bail, Result};
use serde::Deserialize;

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 3_000;

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

/// One downstream OneBot implementation the bridge dials out to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointConfig {
    pub id: String,
    pub url: String,
    pub self_id: i64,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Reconnect attempts after a drop; `0` retries forever.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms", alias = "reconnect_interval_ms")]
    pub retry_delay_ms: u64,
}

impl EndpointConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>, self_id: i64) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            self_id,
            access_token: None,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            max_retries: 0,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            bail!("reverse websocket endpoint id cannot be empty");
        }
        let url = self.url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            bail!(
                "reverse websocket endpoint '{}' url must start with ws:// or wss://",
                self.id
            );
        }
        if self.heartbeat_interval_ms == 0 {
            bail!(
                "reverse websocket endpoint '{}' heartbeat_interval_ms must be greater than 0",
                self.id
            );
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Bearer token, if one is configured and non-blank.
    pub fn bearer_token(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}
