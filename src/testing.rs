//! Scripted backend for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::backend::{ChatBackend, EventSource};
use crate::error::BackendError;
use crate::model::{Candidate, CandidateKind, ConversationId, Message, MessageKind};

/// One scripted `open_stream` outcome.
pub enum ScriptedStream {
    /// `open_stream` itself fails.
    OpenFails,
    /// Yields the items, then ends (an end without `done` is a drop).
    Items(Vec<Result<String, BackendError>>),
    /// Yields the items, then stays open forever.
    ItemsThenHang(Vec<Result<String, BackendError>>),
    /// Driven by the test through a channel.
    Channel(mpsc::UnboundedReceiver<Result<String, BackendError>>),
}

/// A recorded lookup call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Candidates(String),
    Classes(String),
    Instances(String, String),
}

#[derive(Default)]
pub struct ScriptedBackend {
    streams: Mutex<VecDeque<ScriptedStream>>,
    fetches: Mutex<VecDeque<Result<Vec<Message>, BackendError>>>,
    last_fetch: Mutex<Vec<Message>>,
    pub opens: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub lookups: Mutex<Vec<Lookup>>,
    pub posted: Mutex<Vec<(ConversationId, String)>>,
    pub candidates: Mutex<Vec<Candidate>>,
    pub classes: Mutex<Vec<Candidate>>,
    pub instances: Mutex<Vec<Candidate>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_stream(&self, stream: ScriptedStream) {
        self.streams.lock().push_back(stream);
    }

    /// Queue a fetch result. Once the queue drains, the last successful list repeats.
    pub fn push_fetch(&self, result: Result<Vec<Message>, BackendError>) {
        self.fetches.lock().push_back(result);
    }

    /// Open a channel-driven stream and return its sender.
    pub fn push_channel(&self) -> mpsc::UnboundedSender<Result<String, BackendError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push_stream(ScriptedStream::Channel(rx));
        tx
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn lookups(&self) -> Vec<Lookup> {
        self.lookups.lock().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn open_stream(&self, _conversation: ConversationId) -> Result<EventSource, BackendError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self.streams.lock().pop_front();
        match next {
            None | Some(ScriptedStream::OpenFails) => {
                Err(BackendError::Transport("connection refused".into()))
            }
            Some(ScriptedStream::Items(items)) => Ok(Box::pin(futures::stream::iter(items))),
            Some(ScriptedStream::ItemsThenHang(items)) => Ok(Box::pin(
                futures::stream::iter(items).chain(futures::stream::pending()),
            )),
            Some(ScriptedStream::Channel(rx)) => Ok(Box::pin(UnboundedReceiverStream::new(rx))),
        }
    }

    async fn fetch_messages(
        &self,
        _conversation: ConversationId,
    ) -> Result<Vec<Message>, BackendError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.fetches.lock().pop_front();
        match next {
            Some(Ok(messages)) => {
                *self.last_fetch.lock() = messages.clone();
                Ok(messages)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.last_fetch.lock().clone()),
        }
    }

    async fn post_message(
        &self,
        conversation: ConversationId,
        text: &str,
    ) -> Result<Message, BackendError> {
        self.posted.lock().push((conversation, text.to_string()));
        let n = self.posted.lock().len();
        Ok(msg(100 + n as i64, MessageKind::User, text))
    }

    async fn search_candidates(
        &self,
        _kind: CandidateKind,
        query: &str,
    ) -> Result<Vec<Candidate>, BackendError> {
        self.lookups.lock().push(Lookup::Candidates(query.to_string()));
        Ok(self.candidates.lock().clone())
    }

    async fn search_entity_classes(&self, term: &str) -> Result<Vec<Candidate>, BackendError> {
        self.lookups.lock().push(Lookup::Classes(term.to_string()));
        Ok(self.classes.lock().clone())
    }

    async fn search_entity_instances(
        &self,
        class: &str,
        term: &str,
    ) -> Result<Vec<Candidate>, BackendError> {
        self.lookups
            .lock()
            .push(Lookup::Instances(class.to_string(), term.to_string()));
        Ok(self.instances.lock().clone())
    }
}

/// Build a backend message with a deterministic timestamp.
pub fn msg(id: i64, kind: MessageKind, body: &str) -> Message {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    Message {
        id: Some(id),
        kind,
        body: body.to_string(),
        created_at: base + ChronoDuration::seconds(id),
        llm_id: None,
        incomplete: false,
    }
}

pub fn chunk(text: &str) -> Result<String, BackendError> {
    Ok(serde_json::json!({ "chunk": text }).to_string())
}

pub fn done() -> Result<String, BackendError> {
    Ok(r#"{"done":true}"#.to_string())
}

pub fn id(n: i64) -> ConversationId {
    ConversationId::new(n).unwrap()
}

/// Let spawned tasks run without advancing the paused clock.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
