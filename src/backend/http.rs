//! HTTP backend: JSON-RPC calls plus a server-sent-events reply stream.
//!
//! Every call is a JSON-RPC 2.0 envelope POSTed to a fixed route; the reply
//! stream is `GET /chat/stream/{id}` with `text/event-stream` framing, one
//! JSON payload per `data:` event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::traits::{ChatBackend, EventSource};
use crate::config::RelayConfig;
use crate::error::BackendError;
use crate::model::{Candidate, CandidateKind, ConversationId, Message};

/// TCP connect limit for every request, including the reply stream.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'static str,
    params: &'a serde_json::Value,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    message: String,
    #[serde(default)]
    data: Option<RpcErrorData>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorData {
    #[serde(default)]
    message: Option<String>,
}

/// reqwest-backed [`ChatBackend`].
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    session_token: Option<SecretString>,
    request_timeout: Duration,
    next_id: AtomicU64,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_token: None,
            request_timeout: Duration::from_secs(30),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        let mut backend = Self::new(config.base_url.clone());
        backend.session_token = config.session_token.clone();
        backend.request_timeout = config.request_timeout;
        backend
    }

    pub fn with_session_token(mut self, token: SecretString) -> Self {
        self.session_token = Some(token);
        self
    }

    fn url(&self, route: &str) -> String {
        format!("{}{route}", self.base_url)
    }

    fn with_session(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.session_token {
            Some(token) => req.header(
                reqwest::header::COOKIE,
                format!("session_id={}", token.expose_secret()),
            ),
            None => req,
        }
    }

    /// POST a JSON-RPC call and decode its `result`.
    async fn call<T: DeserializeOwned>(
        &self,
        route: &'static str,
        params: serde_json::Value,
    ) -> Result<T, BackendError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = RpcRequest {
            jsonrpc: "2.0",
            method: "call",
            params: &params,
            id,
        };

        debug!(route, id, "JSON-RPC call");

        let resp = self
            .with_session(self.client.post(self.url(route)))
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::Http(format!("{route} returned {status}: {text}")));
        }

        let envelope: RpcResponse<T> = resp.json().await?;
        if let Some(err) = envelope.error {
            let message = err.data.and_then(|d| d.message).unwrap_or(err.message);
            return Err(BackendError::Rpc {
                method: route.to_string(),
                message,
            });
        }
        envelope.result.ok_or_else(|| BackendError::InvalidResponse {
            method: route.to_string(),
            reason: "missing result".to_string(),
        })
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn open_stream(&self, conversation: ConversationId) -> Result<EventSource, BackendError> {
        let resp = self
            .with_session(
                self.client
                    .get(self.url(&format!("/chat/stream/{conversation}")))
                    .header(reqwest::header::ACCEPT, "text/event-stream"),
            )
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::Http(format!("stream open returned {status}")));
        }

        let events = resp.bytes_stream().eventsource().map(|item| match item {
            Ok(event) => Ok(event.data),
            Err(e) => Err(BackendError::Transport(e.to_string())),
        });

        Ok(Box::pin(events))
    }

    async fn fetch_messages(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<Message>, BackendError> {
        self.call(
            "/chat/messages",
            json!({ "conversation_id": conversation.get() }),
        )
        .await
    }

    async fn post_message(
        &self,
        conversation: ConversationId,
        text: &str,
    ) -> Result<Message, BackendError> {
        self.call(
            "/chat/post",
            json!({ "conversation_id": conversation.get(), "body": text }),
        )
        .await
    }

    async fn search_candidates(
        &self,
        kind: CandidateKind,
        query: &str,
    ) -> Result<Vec<Candidate>, BackendError> {
        self.call(
            "/chat/candidates",
            json!({ "kind": kind.as_str(), "query": query }),
        )
        .await
    }

    async fn search_entity_classes(&self, term: &str) -> Result<Vec<Candidate>, BackendError> {
        self.call("/chat/tag/classes", json!({ "term": term })).await
    }

    async fn search_entity_instances(
        &self,
        class: &str,
        term: &str,
    ) -> Result<Vec<Candidate>, BackendError> {
        self.call(
            "/chat/tag/instances",
            json!({ "model": class, "term": term }),
        )
        .await
    }

    async fn resolve_assistant(&self, candidate_id: i64) -> Result<Candidate, BackendError> {
        self.call("/chat/assistant", json!({ "assistant_id": candidate_id }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let backend = HttpBackend::new("http://localhost:8069/");
        assert_eq!(backend.url("/chat/post"), "http://localhost:8069/chat/post");
    }

    #[test]
    fn rpc_error_prefers_data_message() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"error":{"message":"Odoo Server Error","data":{"message":"Access denied"}}}"#;
        let resp: RpcResponse<serde_json::Value> = serde_json::from_str(raw).unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.data.and_then(|d| d.message).as_deref(), Some("Access denied"));
    }

    #[test]
    fn rpc_result_decodes_candidates() {
        let raw = r#"{"jsonrpc":"2.0","id":2,"result":[{"id":4,"name":"Ada"},{"id":5,"name":"Sales Order","group":"sale.order"}]}"#;
        let resp: RpcResponse<Vec<Candidate>> = serde_json::from_str(raw).unwrap();
        let items = resp.result.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].group.as_deref(), Some("sale.order"));
    }
}
