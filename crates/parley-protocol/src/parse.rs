//! Raw wire structures and their conversion into domain types.

use chrono::{DateTime, Utc};
use parley_core::{DomainError, DomainResult, Event, EventKind, Identifier};
use serde::{Deserialize, Serialize};

/// Raw inbound event as sent by a transport.
///
/// `kind` stays a string here so that an unknown kind is reported as a
/// parse error for that one line instead of failing the whole frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Transport receipt time; the daemon stamps "now" when missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

impl RawEvent {
    /// Converts into a domain event.
    ///
    /// Callback and inline queries must carry a `query_id`.
    pub fn to_event(&self) -> DomainResult<Event> {
        let kind = EventKind::from_name(&self.kind)?;
        if matches!(kind, EventKind::CallbackQuery | EventKind::InlineQuery) && self.query_id.is_none() {
            return Err(DomainError::MissingField {
                kind: self.kind.clone(),
                field: "query_id",
            });
        }
        Ok(Event {
            kind,
            chat_id: self.chat_id,
            user_id: self.user_id,
            query_id: self.query_id.clone(),
            text: self.text.clone(),
            payload: self.payload.clone(),
            received_at: self.received_at.unwrap_or_else(Utc::now),
        })
    }

    /// Builds the raw form of a domain event.
    pub fn from_event(event: &Event) -> Self {
        Self {
            kind: event.kind.name().to_string(),
            chat_id: event.chat_id,
            user_id: event.user_id,
            query_id: event.query_id.clone(),
            text: event.text.clone(),
            payload: event.payload.clone(),
            received_at: Some(event.received_at),
        }
    }
}

/// One outbound request, written as a JSON line by the reference outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    /// Registry that owns the requesting session
    pub registry: String,
    /// Identifier of the requesting session
    pub identifier: Identifier,
    /// Platform method, e.g. "sendMessage"
    pub method: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_event_to_event() {
        let raw: RawEvent = serde_json::from_str(
            r#"{"kind":"callback_query","query_id":"q1","chat_id":1,"user_id":2,"text":"yes"}"#,
        )
        .unwrap();
        let event = raw.to_event().unwrap();
        assert_eq!(event.kind, EventKind::CallbackQuery);
        assert_eq!(event.query_id.as_deref(), Some("q1"));
        assert_eq!(event.text(), "yes");
        assert_eq!(event.payload, serde_json::Value::Null);
    }

    #[test]
    fn test_unknown_kind_is_parse_error() {
        let raw: RawEvent = serde_json::from_str(r#"{"kind":"poll"}"#).unwrap();
        assert_eq!(
            raw.to_event(),
            Err(DomainError::UnknownEventKind("poll".to_string()))
        );
    }

    #[test]
    fn test_query_without_id_is_rejected() {
        let raw: RawEvent = serde_json::from_str(r#"{"kind":"inline_query","text":"cats"}"#).unwrap();
        assert_eq!(
            raw.to_event(),
            Err(DomainError::MissingField {
                kind: "inline_query".to_string(),
                field: "query_id",
            })
        );
    }

    #[test]
    fn test_receipt_time_is_preserved() {
        let event = Event::message(42, 7, "hi");
        let raw = RawEvent::from_event(&event);
        assert_eq!(raw.kind, "message");
        assert_eq!(raw.to_event().unwrap(), event);
    }
}
