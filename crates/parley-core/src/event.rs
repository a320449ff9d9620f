//! Inbound events delivered by the transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DomainError;

/// Kinds of inbound events.
///
/// Mirrors the update kinds a bot platform delivers; the engine itself
/// only uses the kind for route type-matching and abuse-guard filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// New text or media message
    Message,

    /// A previously sent message was edited
    EditedMessage,

    /// Post in a broadcast channel
    ChannelPost,

    /// Inline keyboard button press
    CallbackQuery,

    /// Inline query typed in the input field
    InlineQuery,

    /// User picked an inline result
    ChosenInlineResult,

    /// Membership change in a chat
    ChatMember,
}

impl EventKind {
    /// All known kinds, in declaration order.
    pub const ALL: [EventKind; 7] = [
        Self::Message,
        Self::EditedMessage,
        Self::ChannelPost,
        Self::CallbackQuery,
        Self::InlineQuery,
        Self::ChosenInlineResult,
        Self::ChatMember,
    ];

    /// Returns the wire name of this kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::EditedMessage => "edited_message",
            Self::ChannelPost => "channel_post",
            Self::CallbackQuery => "callback_query",
            Self::InlineQuery => "inline_query",
            Self::ChosenInlineResult => "chosen_inline_result",
            Self::ChatMember => "chat_member",
        }
    }

    /// Parses from a wire name.
    pub fn from_name(name: &str) -> Result<Self, DomainError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| DomainError::UnknownEventKind(name.to_string()))
    }

    /// Returns true for kinds that carry a query rather than a message.
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Self::CallbackQuery | Self::InlineQuery | Self::ChosenInlineResult
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One inbound occurrence requiring potential handling.
///
/// Carries the identifier hints a registry's classify function may read
/// (`chat_id`, `user_id`, `query_id`, `text`) plus the raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,

    /// Transient query id (callback and inline queries)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,

    /// Text content (message text, caption, callback data, inline query)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Untyped transport payload, passed through untouched
    #[serde(default)]
    pub payload: serde_json::Value,

    /// When the transport received the event
    pub received_at: DateTime<Utc>,
}

impl Event {
    /// Creates a bare event of the given kind, received now.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            chat_id: None,
            user_id: None,
            query_id: None,
            text: None,
            payload: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    /// Creates a text message event.
    pub fn message(chat_id: i64, user_id: i64, text: impl Into<String>) -> Self {
        Self::new(EventKind::Message)
            .with_chat(chat_id)
            .with_user(user_id)
            .with_text(text)
    }

    /// Creates a callback query (button press) event.
    pub fn callback_query(
        query_id: impl Into<String>,
        chat_id: i64,
        user_id: i64,
        data: impl Into<String>,
    ) -> Self {
        Self::new(EventKind::CallbackQuery)
            .with_query(query_id)
            .with_chat(chat_id)
            .with_user(user_id)
            .with_text(data)
    }

    #[must_use]
    pub fn with_chat(mut self, chat_id: i64) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn with_query(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Returns the text content, or an empty string.
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_parsing() {
        assert_eq!(EventKind::from_name("message"), Ok(EventKind::Message));
        assert_eq!(
            EventKind::from_name("callback_query"),
            Ok(EventKind::CallbackQuery)
        );
        assert!(EventKind::from_name("poll").is_err());
    }

    #[test]
    fn test_event_kind_name_matches_serde() {
        for kind in EventKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.name()));
        }
    }

    #[test]
    fn test_event_kind_classification() {
        assert!(EventKind::InlineQuery.is_query());
        assert!(!EventKind::Message.is_query());
    }

    #[test]
    fn test_message_builder() {
        let event = Event::message(42, 7, "/start");
        assert_eq!(event.kind, EventKind::Message);
        assert_eq!(event.chat_id, Some(42));
        assert_eq!(event.user_id, Some(7));
        assert_eq!(event.text(), "/start");
        assert_eq!(event.query_id, None);
    }

    #[test]
    fn test_text_defaults_to_empty() {
        assert_eq!(Event::new(EventKind::ChatMember).text(), "");
    }
}
