//! parley Core - Shared types for the chat-bot session engine
//!
//! This crate provides the domain value types shared between
//! the engine (parleyd), the wire protocol and the daemon binary.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod error;
pub mod event;
pub mod identifier;

// Re-exports for convenience
pub use config::{
    BridgeConfig, EngineConfig, FloodAction, FloodRule, RegistryConfig, SchedulerConfig,
};
pub use error::{DomainError, DomainResult};
pub use event::{Event, EventKind};
pub use identifier::{Identifier, RegistryId, SessionKind};
