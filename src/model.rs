//! Conversation data model: messages, candidates, and stream payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Backend identifier of a conversation. Always ≥ 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct ConversationId(i64);

impl ConversationId {
    /// Validate a raw id coming from the view layer.
    pub fn new(raw: i64) -> Result<Self, ConfigError> {
        if raw >= 1 {
            Ok(Self(raw))
        } else {
            Err(ConfigError::InvalidConversationId(raw))
        }
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for ConversationId {
    type Error = ConfigError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<ConversationId> for i64 {
    fn from(id: ConversationId) -> Self {
        id.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
    System,
    Error,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// A conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Backend id; `None` for messages produced locally from a stream.
    #[serde(default)]
    pub id: Option<i64>,
    pub kind: MessageKind,
    pub body: String,
    pub created_at: DateTime<Utc>,
    /// Model that produced the message, for assistant output.
    #[serde(default)]
    pub llm_id: Option<String>,
    /// Set when the body was flushed from an interrupted stream.
    #[serde(default)]
    pub incomplete: bool,
}

impl Message {
    /// Build a locally produced assistant message.
    pub fn assistant(body: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: MessageKind::Assistant,
            body: body.into(),
            created_at: Utc::now(),
            llm_id: None,
            incomplete: false,
        }
    }

    /// Build a local error marker closing an unanswered user turn.
    pub fn error(body: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Error,
            ..Self::assistant(body)
        }
    }

    /// Mark this message as flushed from an interrupted stream.
    pub fn interrupted(mut self) -> Self {
        self.incomplete = true;
        self
    }

    pub fn is_assistant(&self) -> bool {
        self.kind == MessageKind::Assistant
    }
}

/// Per-conversation state owned by the session arena.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: ConversationId,
    pub messages: Vec<Message>,
    /// True while an assistant reply is outstanding.
    pub processing: bool,
    /// Message count the poller compares against.
    pub last_known_message_count: usize,
}

impl Conversation {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            messages: Vec::new(),
            processing: false,
            last_known_message_count: 0,
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// What kind of entity a candidate lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateKind {
    Assistant,
    Record,
}

impl CandidateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assistant => "assistant",
            Self::Record => "record",
        }
    }
}

/// An assistant or record that can be mentioned or tagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: i64,
    pub name: String,
    /// Grouping key: technical model name for entity classes, owning class for instances.
    #[serde(default)]
    pub group: Option<String>,
}

impl Candidate {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            group: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Case-insensitive substring match on the name or the group.
    ///
    /// `needle` must already be lowercased.
    pub(crate) fn matches_lower(&self, needle: &str, include_group: bool) -> bool {
        if needle.is_empty() {
            return true;
        }
        if self.name.to_lowercase().contains(needle) {
            return true;
        }
        include_group
            && self
                .group
                .as_deref()
                .is_some_and(|g| g.to_lowercase().contains(needle))
    }
}

/// One event on a conversation's response stream.
///
/// Every field is optional; unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StreamPayload {
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub done: Option<bool>,
    #[serde(default)]
    pub full_response: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub warning: Option<String>,
}

impl StreamPayload {
    /// Parse a raw payload. Anything that is not a JSON object is malformed.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn is_done(&self) -> bool {
        self.done.unwrap_or(false)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.error_code.is_some()
    }
}
