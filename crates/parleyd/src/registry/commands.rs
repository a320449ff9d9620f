//! Registry actor commands, errors, and events.
//!
//! This module defines the message types for communicating with a `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor by a `RegistryHandle`
//! - `SessionSignal`: Requests sent to the actor from inside a session
//! - `RegistryError`: Errors that can occur during registry operations
//! - `SessionEvent`: Lifecycle events published to subscribers

use chrono::{DateTime, Utc};
use parley_core::{Event, Identifier, SessionKind};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each command carries a oneshot channel for the response.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Classify an event and forward it to the sessions of its identifier,
    /// creating the first one if needed.
    Dispatch {
        /// The inbound event (boxed to keep the enum small)
        event: Box<Event>,
        respond_to: oneshot::Sender<DispatchOutcome>,
    },

    /// Create an additional session for an identifier.
    ///
    /// # Errors
    /// - `RegistryError::RegistryFull` if at capacity
    /// - `RegistryError::Blacklisted` if the identifier is blacklisted
    OpenSession {
        identifier: Identifier,
        respond_to: oneshot::Sender<Result<SessionInfo, RegistryError>>,
    },

    /// Remove every session of an identifier. Responds with how many
    /// sessions were removed.
    DeleteSessions {
        identifier: Identifier,
        reason: RemovalReason,
        respond_to: oneshot::Sender<usize>,
    },

    /// Snapshot of all live sessions, ordered by creation.
    Sessions {
        respond_to: oneshot::Sender<Vec<SessionInfo>>,
    },

    /// Lift a blacklist entry. Responds `true` if the identifier was listed.
    Unblacklist {
        identifier: Identifier,
        respond_to: oneshot::Sender<bool>,
    },

    /// Remove every session and stop the actor. Responds with how many
    /// sessions were removed.
    Shutdown { respond_to: oneshot::Sender<usize> },
}

/// Result of offering one event to one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The event was queued on `sessions` live sessions.
    Forwarded { created: bool, sessions: usize },

    /// `classify` returned no identifier.
    NotInterested,

    /// The identifier is blacklisted.
    Blacklisted,

    /// A new session was needed but the registry is full.
    AtCapacity,

    /// `classify` or the session factory panicked.
    Faulted(String),
}

impl DispatchOutcome {
    /// Returns true if at least one session received the event.
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Forwarded { sessions, .. } if *sessions > 0)
    }
}

// ============================================================================
// Session Signals
// ============================================================================

/// A request a session sends to its owning registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSignal {
    pub identifier: Identifier,
    /// Instance number of the sending session
    pub instance: u64,
    pub kind: SignalKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Remove the sending session.
    Close(RemovalReason),
    /// Remove every session of the identifier and ignore it from now on.
    Blacklist,
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry has reached its session capacity.
    #[error("registry is full (max: {max} sessions)")]
    RegistryFull { max: usize },

    #[error("identifier is blacklisted: {0}")]
    Blacklisted(Identifier),

    /// The session factory panicked while building a session.
    #[error("session factory failed: {0}")]
    FactoryFailed(String),

    /// A `Custom` session kind has no default classifier.
    #[error("registry {0} needs a classify function")]
    MissingClassifier(String),

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Session Events
// ============================================================================

/// Lifecycle events published by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new session was created.
    Created { identifier: Identifier, instance: u64 },

    /// A session was removed.
    Removed {
        identifier: Identifier,
        instance: u64,
        reason: RemovalReason,
    },

    /// A session could not be created because the registry is full.
    Rejected { identifier: Identifier },
}

/// Reason a session was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Removed through `RegistryHandle::delete_sessions`.
    Explicit,

    /// No watched activity within the idle timeout.
    IdleTimeout,

    /// A flood monitor tripped with the `close` action.
    Flood,

    /// Handler code closed its own session.
    Closed,

    /// The identifier was blacklisted.
    Blacklisted,

    /// The registry shut down.
    Shutdown,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicit removal"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::Flood => write!(f, "flood limit"),
            Self::Closed => write!(f, "closed by handler"),
            Self::Blacklisted => write!(f, "blacklisted"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

// ============================================================================
// Introspection
// ============================================================================

/// Read-only snapshot of one live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub identifier: Identifier,
    pub instance: u64,
    pub kind: SessionKind,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::RegistryFull { max: 100 };
        assert_eq!(err.to_string(), "registry is full (max: 100 sessions)");

        let err = RegistryError::Blacklisted(Identifier::Int(7));
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn test_removal_reason_display() {
        assert_eq!(RemovalReason::IdleTimeout.to_string(), "idle timeout");
        assert_eq!(RemovalReason::Closed.to_string(), "closed by handler");
    }

    #[test]
    fn test_dispatch_outcome_handled() {
        assert!(DispatchOutcome::Forwarded {
            created: true,
            sessions: 1
        }
        .is_handled());
        assert!(!DispatchOutcome::Forwarded {
            created: false,
            sessions: 0
        }
        .is_handled());
        assert!(!DispatchOutcome::AtCapacity.is_handled());
        assert!(!DispatchOutcome::NotInterested.is_handled());
    }
}
