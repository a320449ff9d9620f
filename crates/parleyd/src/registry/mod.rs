//! Session registries using the actor pattern.
//!
//! Each registry maps identifiers to live sessions. The map is owned by a
//! single `RegistryActor` task; everything else talks to it through a
//! cloneable `RegistryHandle`.
//!
//! # Architecture
//!
//! ```text
//!   engine / server ──┐
//!                     ├──► RegistryHandle ──mpsc──► RegistryActor
//!   tests ────────────┘                               │  owns HashMap<Identifier, Vec<Session>>
//!                                                     │
//!   session lanes ───── SessionSignal (close, ban) ───┘
//!                                                     │
//!                          broadcast::Sender<SessionEvent> ──► subscribers
//! ```

mod actor;
mod builder;
mod commands;
mod handle;

/// Buffer size for the command channel.
pub const COMMAND_BUFFER: usize = 100;

/// Buffer size for the lifecycle event broadcast channel.
pub const EVENT_BUFFER: usize = 100;

pub use actor::{RegistryActor, SHUTDOWN_GRACE};
pub use builder::RegistryBuilder;
pub use commands::{
    DispatchOutcome, RegistryCommand, RegistryError, RemovalReason, SessionEvent, SessionInfo,
    SessionSignal, SignalKind,
};
pub use handle::RegistryHandle;
