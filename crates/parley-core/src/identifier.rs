//! Identifiers used to address sessions.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Identifier
// ============================================================================

/// Opaque key a registry extracts from an inbound event.
///
/// Identifiers are only unique within one registry: the per-chat registry
/// and the per-user registry may both hold a session for `Int(42)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    /// Numeric id (chat id, user id).
    Int(i64),
    /// Textual id (transient query id, composite keys like "chat:42").
    Text(String),
}

impl Identifier {
    /// Returns the numeric value, if this is a numeric identifier.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    /// Returns the textual value, if this is a textual identifier.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Int(_) => None,
            Self::Text(s) => Some(s),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for Identifier {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<String> for Identifier {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Identifier {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

// ============================================================================
// Registry Id
// ============================================================================

/// Name of the registry that owns a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistryId(String);

impl RegistryId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegistryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RegistryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Session Kind
// ============================================================================

/// What a session is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// One session per chat.
    #[default]
    Chat,
    /// One session per user, across chats.
    User,
    /// One short-lived session per inline/callback query.
    Query,
    /// Application-defined keying.
    Custom(String),
}

impl SessionKind {
    /// Returns a short label for logs.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Chat => "chat",
            Self::User => "user",
            Self::Query => "query",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_display() {
        assert_eq!(Identifier::Int(42).to_string(), "42");
        assert_eq!(Identifier::from("chat:42").to_string(), "chat:42");
    }

    #[test]
    fn test_identifier_variants_are_distinct() {
        assert_ne!(Identifier::Int(42), Identifier::from("42"));
        assert_eq!(Identifier::Int(7).as_int(), Some(7));
        assert_eq!(Identifier::from("q").as_text(), Some("q"));
        assert_eq!(Identifier::Int(7).as_text(), None);
    }

    #[test]
    fn test_identifier_untagged_serde() {
        let int: Identifier = serde_json::from_str("42").unwrap();
        assert_eq!(int, Identifier::Int(42));
        let text: Identifier = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(text, Identifier::from("abc"));
    }

    #[test]
    fn test_session_kind_label() {
        assert_eq!(SessionKind::Chat.label(), "chat");
        assert_eq!(SessionKind::Custom("game".into()).to_string(), "game");
    }
}
