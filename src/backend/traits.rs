//! `ChatBackend` trait: the single async interface to the remote backend.
//!
//! The delivery core only needs message persistence/retrieval, a per-conversation
//! event stream, and candidate lookups. Everything else the backend offers is
//! outside the relay.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::BackendError;
use crate::model::{Candidate, CandidateKind, ConversationId, Message};

/// Raw payloads pushed by the server for one reply.
///
/// `Err` items and end-of-stream without a terminal payload are both treated
/// as an unexpected transport drop.
pub type EventSource = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// Backend-agnostic collaborator trait.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    // ── Delivery ────────────────────────────────────────────────────

    /// Open the server-push stream for a conversation's next reply.
    async fn open_stream(&self, conversation: ConversationId) -> Result<EventSource, BackendError>;

    /// Fetch all messages of a conversation, ordered by creation time.
    async fn fetch_messages(&self, conversation: ConversationId)
    -> Result<Vec<Message>, BackendError>;

    /// Create a `user` message.
    async fn post_message(
        &self,
        conversation: ConversationId,
        text: &str,
    ) -> Result<Message, BackendError>;

    // ── Lookups ─────────────────────────────────────────────────────

    /// Candidates for inline mentions.
    async fn search_candidates(
        &self,
        kind: CandidateKind,
        query: &str,
    ) -> Result<Vec<Candidate>, BackendError>;

    /// Entity classes whose name or technical name matches `term`.
    async fn search_entity_classes(&self, term: &str) -> Result<Vec<Candidate>, BackendError>;

    /// Instances of `class` matching `term`.
    async fn search_entity_instances(
        &self,
        class: &str,
        term: &str,
    ) -> Result<Vec<Candidate>, BackendError>;

    /// Authoritative re-resolution of a mentioned assistant before routing.
    async fn resolve_assistant(&self, candidate_id: i64) -> Result<Candidate, BackendError> {
        self.search_candidates(CandidateKind::Assistant, "")
            .await?
            .into_iter()
            .find(|c| c.id == candidate_id)
            .ok_or_else(|| BackendError::NotFound {
                entity: "assistant".to_string(),
                id: candidate_id.to_string(),
            })
    }
}
