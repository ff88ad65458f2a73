//! Completion poller: re-fetches a conversation on a fixed interval until an
//! assistant reply shows up.
//!
//! Used when no stream is available, and on view mount when the last message
//! is an unanswered user turn. Each tick re-validates that its conversation is
//! still active and still processing; otherwise the poller retires itself.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::backend::ChatBackend;
use crate::config::PollerConfig;
use crate::events::DeliveryEvent;
use crate::model::{ConversationId, Message, MessageKind};
use crate::session::SessionState;

/// Baseline to resume polling with, if the conversation ends in an unanswered
/// user message.
pub fn pending_reply_baseline(messages: &[Message]) -> Option<usize> {
    match messages.last() {
        Some(last) if last.kind == MessageKind::User => Some(messages.len() - 1),
        _ => None,
    }
}

enum Tick {
    Continue,
    Finished,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    conversation: Option<ConversationId>,
    baseline: usize,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    backend: Arc<dyn ChatBackend>,
    session: Arc<SessionState>,
    config: PollerConfig,
    slot: Mutex<Slot>,
}

/// Interval-based reply detection for one chat view.
#[derive(Clone)]
pub struct CompletionPoller {
    shared: Arc<Shared>,
}

impl CompletionPoller {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        session: Arc<SessionState>,
        config: PollerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                session,
                config,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    /// Start (or restart) polling `conversation` against `initial_count` messages.
    pub fn start(&self, conversation: ConversationId, initial_count: usize) {
        let mut slot = self.shared.slot.lock();
        slot.generation += 1;
        if let Some(old) = slot.task.take() {
            old.abort();
        }
        slot.conversation = Some(conversation);
        slot.baseline = initial_count;

        let generation = slot.generation;
        let first_tick = Instant::now() + self.shared.config.interval;
        let shared = Arc::clone(&self.shared);
        slot.task = Some(tokio::spawn(poll_loop(
            shared,
            conversation,
            generation,
            initial_count,
            first_tick,
        )));

        info!(
            conversation = %conversation,
            baseline = initial_count,
            interval_ms = self.shared.config.interval.as_millis() as u64,
            "Completion poller started"
        );
    }

    /// Stop polling. Safe to call any number of times.
    pub fn stop(&self) {
        let mut slot = self.shared.slot.lock();
        slot.generation += 1;
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        if let Some(id) = slot.conversation.take() {
            debug!(conversation = %id, "Completion poller stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.slot.lock().conversation.is_some()
    }

    /// Conversation currently being polled.
    pub fn conversation(&self) -> Option<ConversationId> {
        self.shared.slot.lock().conversation
    }

    pub fn baseline(&self) -> Option<usize> {
        let slot = self.shared.slot.lock();
        slot.conversation.map(|_| slot.baseline)
    }
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.slot.lock().generation == generation
    }

    /// Release the slot if this run still owns it.
    fn retire(&self, generation: u64, reason: &'static str) {
        let mut slot = self.slot.lock();
        if slot.generation != generation {
            return;
        }
        if let Some(id) = slot.conversation.take() {
            debug!(conversation = %id, reason, "Completion poller retired");
        }
        slot.task = None;
    }

    fn still_wanted(&self, id: ConversationId, generation: u64) -> bool {
        self.is_current(generation) && self.session.is_active(id) && self.session.is_processing(id)
    }

    fn apply(
        &self,
        id: ConversationId,
        generation: u64,
        baseline: usize,
        messages: Vec<Message>,
    ) -> Tick {
        let slot = self.slot.lock();
        if slot.generation != generation {
            return Tick::Finished;
        }

        let count = messages.len();
        let replied = count > baseline && messages.last().is_some_and(Message::is_assistant);
        if !replied {
            debug!(conversation = %id, count, baseline, "No assistant reply yet");
            return Tick::Continue;
        }

        let applied = self.session.with_active(id, |c| {
            c.last_known_message_count = count;
            c.messages = messages;
            c.processing = false;
        });
        drop(slot);

        if applied.is_some() {
            info!(conversation = %id, count, "Assistant reply detected by poller");
            self.session
                .events()
                .emit(DeliveryEvent::ConversationUpdated { conversation: id });
        }
        Tick::Finished
    }
}

async fn poll_loop(
    shared: Arc<Shared>,
    id: ConversationId,
    generation: u64,
    baseline: usize,
    first_tick: Instant,
) {
    let period = shared.config.interval;
    let mut tick = tokio::time::interval_at(first_tick, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tick.tick().await;

        if !shared.still_wanted(id, generation) {
            shared.retire(generation, "conversation inactive or no longer processing");
            return;
        }

        let messages = match shared.backend.fetch_messages(id).await {
            Ok(messages) => messages,
            Err(e) => {
                debug!(conversation = %id, error = %e, "Poll fetch failed, assuming view is gone");
                shared.retire(generation, "fetch failed");
                return;
            }
        };

        match shared.apply(id, generation, baseline, messages) {
            Tick::Continue => {}
            Tick::Finished => {
                shared.retire(generation, "reply detected");
                return;
            }
        }
    }
}
