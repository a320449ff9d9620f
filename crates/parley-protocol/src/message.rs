//! Protocol message types for the intake socket.

use crate::parse::RawEvent;
use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};

/// Message types that a transport sends to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Handshake
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// One inbound event to route
    Event { event: RawEvent },

    /// Liveness check
    Ping { seq: u64 },

    /// Transport disconnecting gracefully
    Disconnect,
}

/// Messages sent from a transport to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn event(event: RawEvent) -> Self {
        Self::new(MessageType::Event { event })
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }
}

/// Messages sent from the daemon back to a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Handshake accepted
    Connected {
        client_id: String,
        protocol_version: ProtocolVersion,
    },

    /// Handshake refused
    Rejected { reason: String },

    /// Event was routed; lists the registries that took it
    Ack { handled_by: Vec<String> },

    Pong { seq: u64 },

    Error { message: String },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            client_id,
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
        }
    }

    pub fn ack(handled_by: Vec<String>) -> Self {
        Self::Ack { handled_by }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }
}
