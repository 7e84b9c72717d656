//! Session configuration.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Error type returned by a pre-connect hook.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Extra query parameters appended to the endpoint for one connection attempt.
pub type QueryParams = Vec<(String, String)>;

/// Async callback run before every connection attempt.
///
/// Typical use is minting a short-lived auth token that the relay reads from
/// the query string.
pub type PreConnectHook = Arc<dyn Fn() -> BoxFuture<'static, Result<QueryParams, HookError>> + Send + Sync>;

pub const DEFAULT_MAX_BUFFER_MS: u64 = 10_000;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;
pub const DEFAULT_DEDUP_TRUNCATE_MS: u64 = 30_000;
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

fn default_max_buffer_ms() -> u64 {
    DEFAULT_MAX_BUFFER_MS
}

fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}

fn default_dedup_truncate_ms() -> u64 {
    DEFAULT_DEDUP_TRUNCATE_MS
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

/// Session configuration.
///
/// Loadable from JSON; only `url` is required:
/// ```json
/// { "url": "wss://relay.example.com/rooms", "reconnect_delay_ms": 1000, "debug": true }
/// ```
#[derive(Clone, Deserialize)]
pub struct SessionConfig {
    /// Relay endpoint (`ws://` or `wss://`)
    pub url: String,
    /// How long an emit waits for the connection before the message is dropped
    #[serde(default = "default_max_buffer_ms")]
    pub max_buffer_ms: u64,
    /// Fixed delay between a close and the next connection attempt
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Interval at which the dedup set is cleared
    #[serde(default = "default_dedup_truncate_ms")]
    pub dedup_truncate_ms: u64,
    /// Log every public event at `info` instead of `trace`
    #[serde(default)]
    pub debug: bool,
    /// Depth of the broadcast channel behind `Session::events`
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(skip)]
    pub pre_connect: Option<PreConnectHook>,
}

impl SessionConfig {
    /// Configuration with default timings for the given endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_buffer_ms: DEFAULT_MAX_BUFFER_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            dedup_truncate_ms: DEFAULT_DEDUP_TRUNCATE_MS,
            debug: false,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            pre_connect: None,
        }
    }

    /// Parse from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    #[must_use]
    pub fn with_max_buffer_ms(mut self, ms: u64) -> Self {
        self.max_buffer_ms = ms;
        self
    }

    #[must_use]
    pub fn with_reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.reconnect_delay_ms = ms;
        self
    }

    #[must_use]
    pub fn with_dedup_truncate_ms(mut self, ms: u64) -> Self {
        self.dedup_truncate_ms = ms;
        self
    }

    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Install an async hook whose query parameters are appended to the URL
    /// on every connection attempt.
    #[must_use]
    pub fn with_pre_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<QueryParams, HookError>> + Send + 'static,
    {
        self.pre_connect = Some(Arc::new(move || hook().boxed()));
        self
    }

    /// Check the endpoint and timings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.endpoint()?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidUrl {
                url: self.url.clone(),
                reason: format!("unsupported scheme `{}`", url.scheme()),
            });
        }
        if self.reconnect_delay_ms == 0 {
            return Err(ConfigError::NotPositive("reconnect_delay_ms"));
        }
        if self.dedup_truncate_ms == 0 {
            return Err(ConfigError::NotPositive("dedup_truncate_ms"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::NotPositive("event_capacity"));
        }
        Ok(())
    }

    /// Parsed endpoint without any pre-connect parameters.
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.url).map_err(|e| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })
    }

    pub fn max_buffer(&self) -> Duration {
        Duration::from_millis(self.max_buffer_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn dedup_truncate_interval(&self) -> Duration {
        Duration::from_millis(self.dedup_truncate_ms)
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("url", &self.url)
            .field("max_buffer_ms", &self.max_buffer_ms)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .field("dedup_truncate_ms", &self.dedup_truncate_ms)
            .field("debug", &self.debug)
            .field("event_capacity", &self.event_capacity)
            .field("pre_connect", &self.pre_connect.is_some())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid endpoint `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("`{0}` must be greater than zero")]
    NotPositive(&'static str),
}
