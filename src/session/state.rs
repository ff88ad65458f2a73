//! Session arena: per-conversation records keyed by id, plus the active id.
//!
//! Every asynchronous path (stream, poller, remote fetch) captures the
//! conversation id when it starts and mutates through [`SessionState::with_active`],
//! which discards the mutation if the user has since switched away.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::events::{DeliveryEvent, EventBus};
use crate::model::{Conversation, ConversationId, Message};

#[derive(Default)]
struct Inner {
    active: Option<ConversationId>,
    conversations: HashMap<ConversationId, Conversation>,
}

/// Conversation records owned by one chat view.
pub struct SessionState {
    inner: Mutex<Inner>,
    events: EventBus,
}

impl SessionState {
    pub fn new(events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            events,
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Currently displayed conversation, if any.
    pub fn active(&self) -> Option<ConversationId> {
        self.inner.lock().active
    }

    pub fn is_active(&self, id: ConversationId) -> bool {
        self.inner.lock().active == Some(id)
    }

    /// Make `id` the active conversation with a fresh record.
    ///
    /// The previous conversation's record is discarded. Returns the previous id.
    pub fn activate(&self, id: ConversationId) -> Option<ConversationId> {
        let mut inner = self.inner.lock();
        let previous = inner.active.replace(id);
        if let Some(prev) = previous {
            inner.conversations.remove(&prev);
        }
        inner.conversations.insert(id, Conversation::new(id));
        debug!(conversation = %id, previous = ?previous.map(|p| p.get()), "Conversation activated");
        previous
    }

    /// Drop the active conversation (view closed).
    pub fn deactivate(&self) -> Option<ConversationId> {
        let mut inner = self.inner.lock();
        let previous = inner.active.take();
        if let Some(prev) = previous {
            inner.conversations.remove(&prev);
        }
        previous
    }

    /// Run `f` against the conversation only if it is still the active one.
    ///
    /// Emits a `Processing` event when `f` flips the flag.
    pub fn with_active<R>(
        &self,
        id: ConversationId,
        f: impl FnOnce(&mut Conversation) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock();
        if inner.active != Some(id) {
            debug!(conversation = %id, "Discarding stale update for inactive conversation");
            return None;
        }
        let conv = inner.conversations.get_mut(&id)?;
        let before = conv.processing;
        let out = f(conv);
        if conv.processing != before {
            self.events.emit(DeliveryEvent::Processing {
                conversation: id,
                processing: conv.processing,
            });
        }
        Some(out)
    }

    /// Snapshot of a conversation's record.
    pub fn conversation(&self, id: ConversationId) -> Option<Conversation> {
        self.inner.lock().conversations.get(&id).cloned()
    }

    pub fn messages(&self, id: ConversationId) -> Vec<Message> {
        self.inner
            .lock()
            .conversations
            .get(&id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn is_processing(&self, id: ConversationId) -> bool {
        self.inner
            .lock()
            .conversations
            .get(&id)
            .is_some_and(|c| c.processing)
    }

    /// Set the processing flag. Returns whether the flag changed.
    pub fn set_processing(&self, id: ConversationId, processing: bool) -> bool {
        self.with_active(id, |c| {
            let changed = c.processing != processing;
            c.processing = processing;
            changed
        })
        .unwrap_or(false)
    }

    /// Clear the processing flag. Already-clear is a no-op.
    pub fn clear_processing(&self, id: ConversationId) -> bool {
        self.set_processing(id, false)
    }

    /// Append a message to the active conversation. Returns false if stale.
    pub fn append_message(&self, id: ConversationId, message: Message) -> bool {
        self.with_active(id, |c| {
            c.messages.push(message);
            c.last_known_message_count = c.messages.len();
        })
        .is_some()
    }

    /// Replace the message list with a fresh fetch. Returns false if stale.
    pub fn replace_messages(&self, id: ConversationId, messages: Vec<Message>) -> bool {
        self.with_active(id, |c| {
            c.last_known_message_count = messages.len();
            c.messages = messages;
        })
        .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: i64) -> ConversationId {
        ConversationId::new(n).unwrap()
    }

    #[test]
    fn activate_discards_previous_record() {
        let state = SessionState::new(EventBus::new());
        state.activate(id(1));
        assert!(state.append_message(id(1), Message::assistant("hi")));

        let prev = state.activate(id(2));
        assert_eq!(prev, Some(id(1)));
        assert!(state.conversation(id(1)).is_none());
        assert!(state.messages(id(2)).is_empty());
    }

    #[test]
    fn stale_updates_are_discarded() {
        let state = SessionState::new(EventBus::new());
        state.activate(id(1));
        state.activate(id(2));

        assert!(!state.append_message(id(1), Message::assistant("late")));
        assert!(!state.set_processing(id(1), true));
        assert!(state.with_active(id(1), |_| ()).is_none());
    }

    #[test]
    fn clear_processing_is_idempotent() {
        let state = SessionState::new(EventBus::new());
        state.activate(id(3));
        assert!(state.set_processing(id(3), true));
        assert!(state.clear_processing(id(3)));
        assert!(!state.clear_processing(id(3)));
        assert!(!state.is_processing(id(3)));
    }

    #[tokio::test]
    async fn processing_change_is_broadcast_once() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let state = SessionState::new(events);
        state.activate(id(5));

        state.set_processing(id(5), true);
        state.set_processing(id(5), true);

        match rx.recv().await.unwrap() {
            DeliveryEvent::Processing {
                conversation,
                processing,
            } => {
                assert_eq!(conversation, id(5));
                assert!(processing);
            }
            other => panic!("Expected Processing, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn deactivate_clears_active() {
        let state = SessionState::new(EventBus::new());
        state.activate(id(9));
        assert_eq!(state.deactivate(), Some(id(9)));
        assert_eq!(state.active(), None);
        assert!(state.conversation(id(9)).is_none());
    }
}
