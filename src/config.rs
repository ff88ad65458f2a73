//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// How the coordinator waits for an assistant reply after a user message is posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Server-push stream with reconnect backoff.
    Stream,
    /// Fixed-interval re-fetch of the conversation.
    Poll,
}

impl std::str::FromStr for DeliveryMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" => Ok(Self::Stream),
            "poll" => Ok(Self::Poll),
            other => Err(ConfigError::InvalidValue {
                key: "CHAT_RELAY_DELIVERY".to_string(),
                message: format!("expected `stream` or `poll`, got `{other}`"),
            }),
        }
    }
}

/// Response stream tuning.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Reconnect attempts allowed before giving up.
    pub max_reconnect_attempts: u32,
    /// Base backoff delay; attempt `n` waits `base * 2^n`.
    pub backoff_base: Duration,
    /// Consecutive malformed payloads tolerated before the stream is failed.
    pub malformed_tolerance: u32,
    /// How long the `connected` state is displayed before reverting to `idle`.
    pub completion_grace: Duration,
    /// Silence allowed while opening the transport or between payloads before
    /// the connection is treated as dropped.
    pub idle_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 3,
            backoff_base: Duration::from_millis(1000),
            malformed_tolerance: 2,
            completion_grace: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl StreamConfig {
    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt)
    }
}

/// Completion poller tuning.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Interval between re-fetches.
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
        }
    }
}

/// Composer (mention/tag) tuning.
#[derive(Debug, Clone)]
pub struct ComposerConfig {
    /// Character that opens an assistant mention.
    pub mention_trigger: char,
    /// Character that opens an entity tag.
    pub tag_trigger: char,
    /// Entries kept when the short suggestion list is requested.
    pub short_list_len: usize,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            mention_trigger: '@',
            tag_trigger: '#',
            short_list_len: 8,
        }
    }
}

/// Relay configuration, built from environment variables by the CLI.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base URL of the backend (e.g. `http://localhost:8069`).
    pub base_url: String,
    /// Session token sent as a cookie, if the backend needs one.
    pub session_token: Option<SecretString>,
    /// Delivery path used after posting a user message.
    pub delivery: DeliveryMode,
    /// Per-request HTTP timeout (not applied to the event stream).
    pub request_timeout: Duration,
    pub stream: StreamConfig,
    pub poller: PollerConfig,
    pub composer: ComposerConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8069".to_string(),
            session_token: None,
            delivery: DeliveryMode::Stream,
            request_timeout: Duration::from_secs(30),
            stream: StreamConfig::default(),
            poller: PollerConfig::default(),
            composer: ComposerConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Build config from environment variables.
    ///
    /// `CHAT_RELAY_URL` is required; everything else falls back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("CHAT_RELAY_URL").map_err(|_| ConfigError::MissingRequired {
            key: "CHAT_RELAY_URL".to_string(),
            hint: "Set it to the backend base URL, e.g. http://localhost:8069".to_string(),
        })?;

        let session_token = std::env::var("CHAT_RELAY_SESSION")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(SecretString::from);

        let delivery = match std::env::var("CHAT_RELAY_DELIVERY") {
            Ok(v) => v.parse()?,
            Err(_) => DeliveryMode::Stream,
        };

        let request_timeout_secs: u64 = std::env::var("CHAT_RELAY_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let poll_interval_ms: u64 = std::env::var("CHAT_RELAY_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2000);

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            session_token,
            delivery,
            request_timeout: Duration::from_secs(request_timeout_secs),
            poller: PollerConfig {
                interval: Duration::from_millis(poll_interval_ms),
            },
            ..Self::default()
        })
    }
}
