//! Error types for the chat relay.

use std::time::Duration;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Stream failure: {0}")]
    Stream(#[from] StreamFailure),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid conversation id {0}: must be a positive integer")]
    InvalidConversationId(i64),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised by a [`ChatBackend`](crate::backend::ChatBackend) implementation.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Remote call {method} failed: {message}")]
    Rpc { method: String, message: String },

    #[error("Invalid response for {method}: {reason}")]
    InvalidResponse { method: String, reason: String },

    #[error("Transport closed: {0}")]
    Transport(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

/// Failure modes of a single streamed reply.
///
/// These never cross the `ResponseStream` boundary as `Err`; they are recorded as
/// the stream's last failure and broadcast to observers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamFailure {
    #[error("Invalid conversation id {0}")]
    Configuration(i64),

    #[error("Transport dropped before any content arrived")]
    TransportDropped,

    #[error("Server reported an error: {message}")]
    Transport {
        code: Option<String>,
        message: String,
    },

    #[error("{count} consecutive malformed payloads")]
    MalformedPayload { count: u32 },

    #[error("Transport dropped after {received} bytes of content")]
    PartialInterrupted { received: usize },

    #[error("Service unreachable after {attempts} reconnect attempts (last delay {last_delay:?})")]
    BackoffExhausted { attempts: u32, last_delay: Duration },
}

impl StreamFailure {
    /// Whether the coordinator should show this failure to the user as a notice.
    ///
    /// Partial interruptions surface through the flushed message body instead.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Transport { .. } | Self::BackoffExhausted { .. }
        )
    }
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
