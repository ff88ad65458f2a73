//! Delivery events: broadcast to UI observers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::delivery::StreamState;
use crate::model::{ConversationId, Message};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Something observers of a conversation may want to render.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// The response stream moved to a new state.
    StreamState {
        conversation: ConversationId,
        state: StreamState,
    },
    /// An incremental fragment of assistant output.
    Chunk {
        conversation: ConversationId,
        text: String,
    },
    /// A final assistant message, or an error marker closing the turn, was
    /// appended locally.
    MessageCompleted {
        conversation: ConversationId,
        message: Message,
    },
    /// The poller saw a new assistant reply; summaries may need refreshing.
    ConversationUpdated { conversation: ConversationId },
    /// The processing flag changed.
    Processing {
        conversation: ConversationId,
        processing: bool,
    },
    /// Non-fatal server warning.
    Warning {
        conversation: ConversationId,
        message: String,
    },
    /// User-visible failure text. `None` when no valid conversation id exists.
    Notice {
        conversation: Option<ConversationId>,
        message: String,
    },
}

/// Fan-out handle shared by the delivery components.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DeliveryEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.tx.subscribe()
    }

    /// Broadcast. Fine if nobody is listening.
    pub fn emit(&self, event: DeliveryEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
