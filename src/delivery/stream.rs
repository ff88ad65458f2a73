//! Response stream: one server-push connection delivering one assistant reply.
//!
//! State machine:
//! - `idle → connecting` on [`ResponseStream::start`]
//! - `connecting → streaming` on the first chunk
//! - `connecting/streaming → connected` on `done`, then `idle` after the grace period
//! - `→ error` on a server error payload, the 3rd consecutive malformed payload,
//!   a drop after content arrived, or exhausted reconnects
//! - `→ reconnecting` on a drop before any content, with 1 s / 2 s / 4 s backoff;
//!   a transport silent for longer than the idle timeout counts as a drop
//!
//! All mutation happens under one lock and is gated on the run generation, so
//! nothing from an old run lands after [`ResponseStream::stop`] returns.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backend::{ChatBackend, EventSource};
use crate::config::StreamConfig;
use crate::error::StreamFailure;
use crate::events::DeliveryEvent;
use crate::model::{ConversationId, Message, StreamPayload};
use crate::session::SessionState;

/// Appended to the partial text of a reply whose transport dropped mid-stream.
pub const INTERRUPTED_MARKER: &str =
    "\n\n[Response interrupted. Resend your message to get a complete answer.]";

/// Shown once reconnect attempts are exhausted.
pub const SERVICE_UNREACHABLE: &str =
    "The assistant service is unreachable. Please try again in a few minutes.";

/// Fallback when the server sends neither a known code nor a message.
pub const GENERIC_ERROR: &str = "The assistant could not complete the response.";

/// Server error codes with their user-facing text.
const ERROR_MESSAGES: &[(&str, &str)] = &[
    (
        "rate_limit",
        "The assistant is receiving too many requests. Please wait a moment and try again.",
    ),
    (
        "quota_exceeded",
        "Your AI usage quota is exhausted. Contact your administrator to extend it.",
    ),
    (
        "context_length_exceeded",
        "This conversation is too long for the selected model. Start a new conversation to continue.",
    ),
    (
        "invalid_api_key",
        "The AI provider rejected the configured credentials. Contact your administrator.",
    ),
    (
        "model_not_found",
        "The selected model is not available. Choose another assistant.",
    ),
    (
        "timeout",
        "The assistant took too long to respond. Please try again.",
    ),
    (
        "content_filter",
        "The response was blocked by the provider's content policy.",
    ),
    (
        "server_error",
        "The AI provider had an internal error. Please try again later.",
    ),
];

/// Map a server error to user-facing text.
///
/// Known codes use the fixed table; anything else falls back to the raw server
/// message, then to [`GENERIC_ERROR`].
pub fn describe_error(code: Option<&str>, raw: Option<&str>) -> String {
    if let Some(text) = code.and_then(|c| {
        ERROR_MESSAGES
            .iter()
            .find(|(known, _)| *known == c)
            .map(|(_, text)| *text)
    }) {
        return text.to_string();
    }
    match raw.map(str::trim) {
        Some(msg) if !msg.is_empty() => msg.to_string(),
        _ => GENERIC_ERROR.to_string(),
    }
}

/// Connection state of a response stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Connecting,
    Connected,
    Streaming,
    Error,
    Reconnecting,
}

impl StreamState {
    /// Whether a transport drop in this state is unexpected.
    fn expects_transport(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Streaming | Self::Reconnecting
        )
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Streaming => "streaming",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
        };
        write!(f, "{s}")
    }
}

/// What the payload handler decided.
enum Flow {
    Continue,
    Completed,
    Failed,
    Stale,
}

/// How one connection ended.
enum Outcome {
    Completed,
    Ended,
    Dropped,
}

struct Run {
    generation: u64,
    state: StreamState,
    conversation: Option<ConversationId>,
    accumulator: String,
    attempt: u32,
    malformed: u32,
    last_failure: Option<StreamFailure>,
    task: Option<JoinHandle<()>>,
}

impl Run {
    fn new() -> Self {
        Self {
            generation: 0,
            state: StreamState::Idle,
            conversation: None,
            accumulator: String::new(),
            attempt: 0,
            malformed: 0,
            last_failure: None,
            task: None,
        }
    }
}

struct Shared {
    backend: Arc<dyn ChatBackend>,
    session: Arc<SessionState>,
    config: StreamConfig,
    run: Mutex<Run>,
}

/// Streamed delivery of assistant replies for one chat view.
#[derive(Clone)]
pub struct ResponseStream {
    shared: Arc<Shared>,
}

impl ResponseStream {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        session: Arc<SessionState>,
        config: StreamConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                session,
                config,
                run: Mutex::new(Run::new()),
            }),
        }
    }

    /// Start delivering the next reply of `conversation`.
    ///
    /// Any previous run is stopped first. A non-positive id leaves the stream in
    /// `error` without connecting.
    pub fn start(&self, conversation: i64) -> Result<(), StreamFailure> {
        self.stop();

        let id = match ConversationId::new(conversation) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Refusing to open stream");
                let failure = StreamFailure::Configuration(conversation);
                let mut run = self.shared.run.lock();
                run.state = StreamState::Error;
                run.last_failure = Some(failure.clone());
                return Err(failure);
            }
        };

        let mut run = self.shared.run.lock();
        run.generation += 1;
        run.conversation = Some(id);
        run.last_failure = None;
        self.shared.transition(&mut run, id, StreamState::Connecting);

        let generation = run.generation;
        let shared = Arc::clone(&self.shared);
        run.task = Some(tokio::spawn(drive(shared, id, generation)));

        info!(conversation = %id, generation, "Response stream started");
        Ok(())
    }

    /// Tear down the current run. Safe to call any number of times.
    pub fn stop(&self) {
        let mut run = self.shared.run.lock();
        run.generation += 1;
        if let Some(task) = run.task.take() {
            task.abort();
            debug!(conversation = ?run.conversation.map(|c| c.get()), "Response stream stopped");
        }
        if let Some(id) = run.conversation.take() {
            self.shared.transition(&mut run, id, StreamState::Idle);
        }
        run.state = StreamState::Idle;
        run.accumulator.clear();
        run.attempt = 0;
        run.malformed = 0;
    }

    pub fn state(&self) -> StreamState {
        self.shared.run.lock().state
    }

    /// Text received so far in the current run.
    pub fn accumulated(&self) -> String {
        self.shared.run.lock().accumulator.clone()
    }

    pub fn conversation(&self) -> Option<ConversationId> {
        self.shared.run.lock().conversation
    }

    pub fn last_failure(&self) -> Option<StreamFailure> {
        self.shared.run.lock().last_failure.clone()
    }

    /// Reconnect attempts spent in the current run.
    pub fn attempts(&self) -> u32 {
        self.shared.run.lock().attempt
    }

    /// Whether a driving task (including a pending backoff timer) is live.
    pub fn has_pending_work(&self) -> bool {
        self.shared
            .run
            .lock()
            .task
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

impl Shared {
    fn transition(&self, run: &mut Run, id: ConversationId, state: StreamState) {
        if run.state == state {
            return;
        }
        debug!(conversation = %id, from = %run.state, to = %state, "Stream state change");
        run.state = state;
        self.session.events().emit(DeliveryEvent::StreamState {
            conversation: id,
            state,
        });
    }

    /// Record a terminal failure. Caller holds the run lock.
    ///
    /// Unless partial output was already flushed, the user turn is closed with
    /// an error marker message.
    fn fail(&self, run: &mut Run, id: ConversationId, failure: StreamFailure) {
        warn!(conversation = %id, failure = %failure, "Response stream failed");
        let text = match &failure {
            StreamFailure::Transport { message, .. } => Some(message.clone()),
            StreamFailure::BackoffExhausted { .. } => Some(SERVICE_UNREACHABLE.to_string()),
            StreamFailure::MalformedPayload { .. } | StreamFailure::TransportDropped => {
                Some(GENERIC_ERROR.to_string())
            }
            StreamFailure::PartialInterrupted { .. } | StreamFailure::Configuration(_) => None,
        };

        if let Some(body) = &text {
            let marker = Message::error(body.clone());
            if self.session.append_message(id, marker.clone()) {
                self.session.events().emit(DeliveryEvent::MessageCompleted {
                    conversation: id,
                    message: marker,
                });
            }
        }
        self.session.clear_processing(id);

        if failure.is_user_visible() {
            self.session.events().emit(DeliveryEvent::Notice {
                conversation: Some(id),
                message: text.unwrap_or_else(|| failure.to_string()),
            });
        }
        run.last_failure = Some(failure);
        self.transition(run, id, StreamState::Error);
    }

    /// Append a final assistant message and announce it.
    fn finish_message(&self, id: ConversationId, message: Message) {
        if self.session.append_message(id, message.clone()) {
            self.session.events().emit(DeliveryEvent::MessageCompleted {
                conversation: id,
                message,
            });
        }
        self.session.clear_processing(id);
    }

    fn on_payload(&self, id: ConversationId, generation: u64, raw: &str) -> Flow {
        let mut run = self.run.lock();
        if run.generation != generation {
            return Flow::Stale;
        }

        let payload = match StreamPayload::parse(raw) {
            Ok(p) => p,
            Err(e) => {
                run.malformed += 1;
                if run.malformed > self.config.malformed_tolerance {
                    let count = run.malformed;
                    self.fail(&mut run, id, StreamFailure::MalformedPayload { count });
                    return Flow::Failed;
                }
                warn!(
                    conversation = %id,
                    consecutive = run.malformed,
                    error = %e,
                    "Ignoring malformed stream payload"
                );
                return Flow::Continue;
            }
        };
        run.malformed = 0;

        if payload.is_error() {
            let message = describe_error(payload.error_code.as_deref(), payload.error.as_deref());
            self.fail(
                &mut run,
                id,
                StreamFailure::Transport {
                    code: payload.error_code,
                    message,
                },
            );
            return Flow::Failed;
        }

        if let Some(warning) = payload.warning.as_ref().filter(|w| !w.is_empty()) {
            self.session.events().emit(DeliveryEvent::Warning {
                conversation: id,
                message: warning.clone(),
            });
        }

        if let Some(chunk) = payload.chunk.as_ref().filter(|c| !c.is_empty()) {
            run.accumulator.push_str(chunk);
            self.transition(&mut run, id, StreamState::Streaming);
            self.session.events().emit(DeliveryEvent::Chunk {
                conversation: id,
                text: chunk.clone(),
            });
        }

        if payload.is_done() {
            let body = match payload.full_response {
                Some(full) if !full.is_empty() => full,
                _ => run.accumulator.clone(),
            };
            info!(conversation = %id, len = body.len(), "Response stream completed");
            self.finish_message(id, Message::assistant(body));
            self.transition(&mut run, id, StreamState::Connected);
            return Flow::Completed;
        }

        Flow::Continue
    }

    /// Decide what an unexpected drop means. Returns the backoff delay if a
    /// reconnect should be attempted.
    fn on_drop(&self, id: ConversationId, generation: u64) -> Option<Duration> {
        let mut run = self.run.lock();
        if run.generation != generation || !run.state.expects_transport() {
            return None;
        }

        if !run.accumulator.is_empty() {
            let received = run.accumulator.len();
            let body = format!("{}{INTERRUPTED_MARKER}", run.accumulator);
            self.finish_message(id, Message::assistant(body).interrupted());
            self.fail(&mut run, id, StreamFailure::PartialInterrupted { received });
            return None;
        }

        if run.attempt >= self.config.max_reconnect_attempts {
            let attempts = run.attempt;
            let last_delay = self.config.backoff_delay(attempts.saturating_sub(1));
            self.fail(
                &mut run,
                id,
                StreamFailure::BackoffExhausted {
                    attempts,
                    last_delay,
                },
            );
            return None;
        }

        let delay = self.config.backoff_delay(run.attempt);
        run.attempt += 1;
        run.last_failure = Some(StreamFailure::TransportDropped);
        self.transition(&mut run, id, StreamState::Reconnecting);
        info!(
            conversation = %id,
            attempt = run.attempt,
            delay_ms = delay.as_millis() as u64,
            "Stream dropped, reconnecting"
        );
        Some(delay)
    }

    fn begin_reconnect(&self, id: ConversationId, generation: u64) -> bool {
        let mut run = self.run.lock();
        if run.generation != generation {
            return false;
        }
        self.transition(&mut run, id, StreamState::Connecting);
        true
    }

    fn end_grace(&self, id: ConversationId, generation: u64) {
        let mut run = self.run.lock();
        if run.generation == generation && run.state == StreamState::Connected {
            self.transition(&mut run, id, StreamState::Idle);
        }
    }

    async fn consume(&self, source: &mut EventSource, id: ConversationId, generation: u64) -> Outcome {
        loop {
            let item = match timeout(self.config.idle_timeout, source.next()).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => {
                    debug!(conversation = %id, "Stream idle timeout");
                    return Outcome::Dropped;
                }
            };
            match item {
                Ok(raw) => match self.on_payload(id, generation, &raw) {
                    Flow::Continue => {}
                    Flow::Completed => return Outcome::Completed,
                    Flow::Failed | Flow::Stale => return Outcome::Ended,
                },
                Err(e) => {
                    debug!(conversation = %id, error = %e, "Stream transport error");
                    return Outcome::Dropped;
                }
            }
        }
        debug!(conversation = %id, "Stream ended without a terminal payload");
        Outcome::Dropped
    }
}

/// Drive one run: connect, consume, reconnect with backoff, then the grace period.
async fn drive(shared: Arc<Shared>, id: ConversationId, generation: u64) {
    loop {
        let opened = timeout(shared.config.idle_timeout, shared.backend.open_stream(id)).await;
        let outcome = match opened {
            Ok(Ok(mut source)) => shared.consume(&mut source, id, generation).await,
            Ok(Err(e)) => {
                debug!(conversation = %id, error = %e, "Failed to open stream");
                Outcome::Dropped
            }
            Err(_) => {
                debug!(conversation = %id, "Timed out opening stream");
                Outcome::Dropped
            }
        };

        match outcome {
            Outcome::Completed => {
                tokio::time::sleep(shared.config.completion_grace).await;
                shared.end_grace(id, generation);
                return;
            }
            Outcome::Ended => return,
            Outcome::Dropped => {
                let Some(delay) = shared.on_drop(id, generation) else {
                    return;
                };
                tokio::time::sleep(delay).await;
                if !shared.begin_reconnect(id, generation) {
                    return;
                }
            }
        }
    }
}
