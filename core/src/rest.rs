/// REST client for the chat backend
///
/// Endpoints:
///   GET  /conversations
///   GET  /conversations/:id/messages
///   POST /conversations              body: {"recipient_id": "..."}
///   PUT  /messages/:id/read
use crate::error::{ChatError, Result};
use crate::types::{
    validate_all, Conversation, ConversationId, CreateConversationRequest, CreatedConversation,
    Message, MessageId, RawConversation, RawMessage, UserId,
};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Remote operations the session consumes
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_conversations(&self, headers: &HeaderMap) -> Result<Vec<Conversation>>;

    async fn list_messages(
        &self,
        headers: &HeaderMap,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>>;

    async fn create_conversation(
        &self,
        headers: &HeaderMap,
        recipient_id: &UserId,
    ) -> Result<Conversation>;

    async fn mark_read(&self, headers: &HeaderMap, message_id: &MessageId) -> Result<()>;
}

// ─── Paths ───────────────────────────────────────────────────────────────────

pub fn conversations_path() -> String {
    "/conversations".to_string()
}

pub fn messages_path(conversation_id: &ConversationId) -> String {
    format!(
        "/conversations/{}/messages",
        urlencoding::encode(conversation_id.as_str())
    )
}

pub fn mark_read_path(message_id: &MessageId) -> String {
    format!("/messages/{}/read", urlencoding::encode(message_id.as_str()))
}

// ─── Hyper client ────────────────────────────────────────────────────────────

pub struct HttpChatApi {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
}

impl HttpChatApi {
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<Bytes> {
        let uri = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, uri);

        let mut builder = Request::builder().method(method.clone()).uri(&uri);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| ChatError::Http(format!("invalid request {}: {}", uri, e)))?;

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| ChatError::Http(format!("{} {}: {}", method, uri, e)))?;

        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map(|c| c.to_bytes())
            .map_err(|e| ChatError::Http(format!("body read error: {}", e)))?;

        check_status(status, &bytes)?;
        Ok(bytes)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, headers: &HeaderMap) -> Result<T> {
        let bytes = self.send(Method::GET, path, headers, None).await?;
        serde_json::from_slice(&bytes).map_err(ChatError::Serialization)
    }
}

/// Map a non-success status to an error, using the JSON `message` field when present
fn check_status(status: StatusCode, body: &[u8]) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ChatError::Unauthorized(status.as_u16()));
    }

    let message = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());

    warn!("Backend answered {}: {}", status, message);
    Err(ChatError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(&self, headers: &HeaderMap) -> Result<Vec<Conversation>> {
        let raw: Vec<RawConversation> = self.get_json(&conversations_path(), headers).await?;
        Ok(validate_all(raw, "conversation"))
    }

    async fn list_messages(
        &self,
        headers: &HeaderMap,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>> {
        let raw: Vec<RawMessage> = self.get_json(&messages_path(conversation_id), headers).await?;
        Ok(validate_all(raw, "message"))
    }

    async fn create_conversation(
        &self,
        headers: &HeaderMap,
        recipient_id: &UserId,
    ) -> Result<Conversation> {
        let body = serde_json::to_vec(&CreateConversationRequest { recipient_id })?;
        let bytes = self
            .send(Method::POST, &conversations_path(), headers, Some(body))
            .await?;
        let created: CreatedConversation = serde_json::from_slice(&bytes)?;
        Conversation::try_from(created.into_raw())
    }

    async fn mark_read(&self, headers: &HeaderMap, message_id: &MessageId) -> Result<()> {
        self.send(Method::PUT, &mark_read_path(message_id), headers, Some(b"{}".to_vec()))
            .await?;
        Ok(())
    }
}
