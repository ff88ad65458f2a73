//! Session coordinator: owns the active conversation and wires the delivery
//! paths and composer resolvers to it.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::state::SessionState;
use crate::backend::ChatBackend;
use crate::compose::{
    Composer, ComposerKey, ComposerState, ConversationContext, KeyOutcome, TagReference,
};
use crate::config::{DeliveryMode, RelayConfig};
use crate::delivery::{CompletionPoller, ResponseStream, StreamState, pending_reply_baseline};
use crate::error::{ConfigError, Result};
use crate::events::{DeliveryEvent, EventBus};
use crate::model::{Candidate, Conversation, ConversationId, Message};

/// Result of posting a user message.
#[derive(Debug, Clone, Serialize)]
pub struct SentMessage {
    pub message: Message,
    /// Mentioned assistant, re-resolved by the backend.
    pub addressee: Option<Candidate>,
    pub tags: Vec<TagReference>,
}

/// One chat view's delivery core.
pub struct SessionCoordinator {
    backend: Arc<dyn ChatBackend>,
    delivery: DeliveryMode,
    state: Arc<SessionState>,
    stream: ResponseStream,
    poller: CompletionPoller,
    composer: Composer,
}

impl SessionCoordinator {
    pub fn new(backend: Arc<dyn ChatBackend>, config: &RelayConfig) -> Self {
        let state = SessionState::new(EventBus::new());
        let stream = ResponseStream::new(
            Arc::clone(&backend),
            Arc::clone(&state),
            config.stream.clone(),
        );
        let poller = CompletionPoller::new(
            Arc::clone(&backend),
            Arc::clone(&state),
            config.poller.clone(),
        );
        Self {
            backend,
            delivery: config.delivery,
            state,
            stream,
            poller,
            composer: Composer::new(&config.composer, ConversationContext::default()),
        }
    }

    pub fn with_context(mut self, context: ConversationContext) -> Self {
        self.composer.set_context(context);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.state.events().subscribe()
    }

    pub fn active(&self) -> Option<ConversationId> {
        self.state.active()
    }

    /// Switch the view to `conversation`.
    ///
    /// Stops the stream and the poller, discards the previous conversation's
    /// messages and the composer caches, then loads the new conversation. If it
    /// ends in an unanswered user message, polling resumes from there.
    pub async fn open(&mut self, conversation: i64) -> Result<()> {
        let id = match ConversationId::new(conversation) {
            Ok(id) => id,
            Err(e) => {
                self.state.events().emit(DeliveryEvent::Notice {
                    conversation: None,
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };

        self.teardown();
        self.state.activate(id);
        info!(conversation = %id, "Conversation opened");
        self.load(id).await
    }

    /// Re-fetch the active conversation's messages.
    pub async fn refresh(&mut self) -> Result<()> {
        let id = self.require_active()?;
        let messages = self.backend.fetch_messages(id).await?;
        self.state.replace_messages(id, messages);
        Ok(())
    }

    async fn load(&mut self, id: ConversationId) -> Result<()> {
        let messages = self.backend.fetch_messages(id).await?;
        let baseline = pending_reply_baseline(&messages);
        if !self.state.replace_messages(id, messages) {
            return Ok(());
        }
        if let Some(baseline) = baseline {
            info!(conversation = %id, baseline, "Resuming wait for an unanswered message");
            self.state.set_processing(id, true);
            self.poller.start(id, baseline);
        }
        Ok(())
    }

    /// Post a user message and start waiting for the reply.
    pub async fn send_message(&mut self, text: &str) -> Result<SentMessage> {
        let id = self.require_active()?;

        let addressee = match self.composer.mentions.take_addressee() {
            Some(candidate_id) => match self.backend.resolve_assistant(candidate_id).await {
                Ok(candidate) => Some(candidate),
                Err(e) => {
                    warn!(candidate_id, error = %e, "Mentioned assistant could not be resolved");
                    None
                }
            },
            None => None,
        };
        let tags = self.composer.tags.take_references();

        let message = self.backend.post_message(id, text).await?;
        let sent = SentMessage {
            message: message.clone(),
            addressee,
            tags,
        };

        if !self.state.append_message(id, message) {
            return Ok(sent);
        }
        self.state.set_processing(id, true);
        self.begin_delivery(id);
        Ok(sent)
    }

    fn begin_delivery(&self, id: ConversationId) {
        match self.delivery {
            DeliveryMode::Stream => {
                self.poller.stop();
                if let Err(failure) = self.stream.start(id.get()) {
                    warn!(conversation = %id, failure = %failure, "Stream could not start");
                }
            }
            DeliveryMode::Poll => {
                self.stream.stop();
                let baseline = self
                    .state
                    .conversation(id)
                    .map(|c| c.last_known_message_count)
                    .unwrap_or_default();
                self.poller.start(id, baseline);
            }
        }
    }

    /// Abandon the outstanding reply.
    pub fn cancel(&mut self) {
        self.stream.stop();
        self.poller.stop();
        if let Some(id) = self.state.active() {
            self.state.clear_processing(id);
        }
    }

    /// Tear down the view.
    pub fn close(&mut self) {
        self.teardown();
        if let Some(id) = self.state.deactivate() {
            info!(conversation = %id, "Conversation closed");
        }
    }

    fn teardown(&mut self) {
        self.stream.stop();
        self.poller.stop();
        self.composer.reset();
    }

    fn require_active(&self) -> Result<ConversationId> {
        self.state.active().ok_or_else(|| {
            ConfigError::MissingRequired {
                key: "conversation".to_string(),
                hint: "Open a conversation before sending".to_string(),
            }
            .into()
        })
    }

    // ── Observers ───────────────────────────────────────────────────

    pub fn is_processing(&self, id: ConversationId) -> bool {
        self.state.is_processing(id)
    }

    pub fn conversation(&self) -> Option<Conversation> {
        self.state.active().and_then(|id| self.state.conversation(id))
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state
            .active()
            .map(|id| self.state.messages(id))
            .unwrap_or_default()
    }

    pub fn stream(&self) -> &ResponseStream {
        &self.stream
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream.state()
    }

    pub fn poller(&self) -> &CompletionPoller {
        &self.poller
    }

    // ── Composer ────────────────────────────────────────────────────

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub async fn on_input(&mut self, text: &str, caret: usize) -> ComposerState {
        self.composer
            .on_input(self.backend.as_ref(), text, caret)
            .await
    }

    pub fn on_key(&mut self, key: ComposerKey, text: &mut String, caret: &mut usize) -> KeyOutcome {
        self.composer.on_key(key, text, caret)
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.stream.stop();
        self.poller.stop();
    }
}
