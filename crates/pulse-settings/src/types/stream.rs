//! Stream connection settings.

use serde::{Deserialize, Serialize};

/// Endpoint, reconnection, and timeout settings for stream connections.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Scheme, host, and optional path prefix of the streaming API.
    pub base_url: String,
    /// Path for a resource stream. Must contain `{resource}`.
    pub path_template: String,
    /// Path for a resource sub-channel stream. Must contain `{resource}` and `{channel}`.
    pub channel_template: String,
    /// Reconnect with backoff after transport loss.
    pub auto_reconnect: bool,
    /// Consecutive reconnect attempts before giving up.
    pub max_retries: u32,
    /// Ignore `max_retries` and reconnect forever.
    pub unbounded_retries: bool,
    /// Base delay for exponential backoff.
    pub backoff_base_ms: u64,
    /// Upper bound on any reconnect delay.
    pub backoff_max_ms: u64,
    /// Jitter factor 0.0–1.0 applied to each delay.
    pub jitter_factor: f64,
    /// Deadline for opening the transport. `0` disables it.
    pub connect_timeout_ms: u64,
    /// Treat the stream as dropped after this long without bytes. `0` disables it.
    pub idle_timeout_ms: u64,
    /// Server event names after which the connection closes without reconnecting.
    pub close_on: Vec<String>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api".to_string(),
            path_template: "/streams/{resource}".to_string(),
            channel_template: "/streams/{resource}/{channel}".to_string(),
            auto_reconnect: true,
            max_retries: 10,
            unbounded_retries: false,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
            jitter_factor: 0.2,
            connect_timeout_ms: 10_000,
            idle_timeout_ms: 60_000,
            close_on: vec!["stream-end".to_string()],
        }
    }
}

impl StreamSettings {
    /// Retry budget, `None` meaning unbounded.
    pub fn retry_limit(&self) -> Option<u32> {
        (!self.unbounded_retries).then_some(self.max_retries)
    }
}
