//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Unknown event kind name
    #[error("Unknown event kind: {0}")]
    UnknownEventKind(String),

    /// An event arrived without a field its kind requires
    #[error("Event of kind {kind} is missing {field}")]
    MissingField { kind: String, field: &'static str },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
