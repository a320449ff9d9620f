//! Outbound request side of the engine.
//!
//! Handler code never talks to the bot platform directly. It hands an
//! [`OutboundRequest`] to the [`Outbox`] carried by its session tag, either
//! fire-and-forget or through [`SessionContext::request`], which wraps the
//! call in a [`SyncBridge`](crate::bridge::SyncBridge).
//!
//! [`SessionContext::request`]: crate::session::SessionContext::request

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use parley_core::Identifier;
use parley_protocol::OutboundFrame;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::session::SessionTag;

/// One outbound platform call, e.g. `sendMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub method: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl OutboundRequest {
    pub fn new(method: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            payload,
        }
    }

    /// Shorthand for a `sendMessage` request to a chat.
    pub fn send_message(chat_id: i64, text: impl Into<String>) -> Self {
        Self::new(
            "sendMessage",
            serde_json::json!({ "chat_id": chat_id, "text": text.into() }),
        )
    }
}

/// Errors produced by an outbox implementation.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    /// The platform answered with an error.
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("outbox closed")]
    Closed,
}

/// Collaborator that performs outbound requests on behalf of sessions.
///
/// Implementations must be callable concurrently from any session lane.
#[async_trait]
pub trait Outbox: Send + Sync + 'static {
    async fn send(
        &self,
        tag: &SessionTag,
        request: OutboundRequest,
    ) -> Result<serde_json::Value, OutboxError>;
}

// ============================================================================
// Implementations
// ============================================================================

/// Outbox that discards every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutbox;

#[async_trait]
impl Outbox for NullOutbox {
    async fn send(
        &self,
        tag: &SessionTag,
        request: OutboundRequest,
    ) -> Result<serde_json::Value, OutboxError> {
        trace!(session = %tag, method = %request.method, "Discarding outbound request");
        Ok(serde_json::Value::Null)
    }
}

/// Writes each request as one JSON line to an async writer.
///
/// Requests are fire-and-forget: the returned value is always `null`.
pub struct JsonLinesOutbox<W> {
    writer: tokio::sync::Mutex<W>,
}

impl<W> JsonLinesOutbox<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
        }
    }

    /// Returns the writer, consuming the outbox.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> Outbox for JsonLinesOutbox<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(
        &self,
        tag: &SessionTag,
        request: OutboundRequest,
    ) -> Result<serde_json::Value, OutboxError> {
        let frame = OutboundFrame {
            registry: tag.registry().to_string(),
            identifier: tag.identifier().clone(),
            method: request.method,
            payload: request.payload,
            sent_at: Utc::now(),
        };
        let mut line = serde_json::to_vec(&frame)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;

        debug!(session = %tag, method = %frame.method, "Outbound request written");
        Ok(serde_json::Value::Null)
    }
}

/// A request recorded by [`MemoryOutbox`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentRequest {
    pub registry: String,
    pub identifier: Identifier,
    pub instance: u64,
    pub request: OutboundRequest,
}

/// Outbox that records requests in memory. Useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryOutbox {
    sent: Mutex<Vec<SentRequest>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every request sent so far, oldest first.
    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().clone()
    }

    /// Texts of all recorded `sendMessage` requests, oldest first.
    pub fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.request.method == "sendMessage")
            .filter_map(|s| s.request.payload.get("text")?.as_str().map(str::to_string))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

#[async_trait]
impl Outbox for MemoryOutbox {
    async fn send(
        &self,
        tag: &SessionTag,
        request: OutboundRequest,
    ) -> Result<serde_json::Value, OutboxError> {
        self.sent.lock().push(SentRequest {
            registry: tag.registry().to_string(),
            identifier: tag.identifier().clone(),
            instance: tag.instance(),
            request,
        });
        Ok(serde_json::json!({ "ok": true }))
    }
}
