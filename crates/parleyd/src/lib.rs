//! parley engine - session lifecycle and concurrency for chat-bot servers
//!
//! This crate provides:
//! - `registry` - per-kind session registries (actor pattern)
//! - `session` - serial per-session lanes, handler trait and context
//! - `scheduler` - delayed actions bound to sessions
//! - `guard` - flood and idle-timeout monitors
//! - `routes` - the route tree a session consults for each event
//! - `bridge` - blocking-style waits on async calls, with timeout and retry
//! - `engine` - fan-out of every inbound event across registries
//! - `server` - Unix socket intake for a transport process
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         parleyd                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────┐   ┌────────┐   ┌────────────────────────┐  │
//! │  │ IntakeServer │──▶│ Engine │──▶│ RegistryActor (chats)  │  │
//! │  │ (Unix socket)│   │fan-out │──▶│ RegistryActor (users)  │  │
//! │  └──────────────┘   └───┬────┘   └───────────┬────────────┘  │
//! │                         │                    │ Work          │
//! │                  ┌──────▼─────┐      ┌───────▼────────┐      │
//! │                  │ Scheduler  │─────▶│ SessionQueue   │      │
//! │                  │ tick task  │ Work │ (one per       │      │
//! │                  └────────────┘      │  session)      │      │
//! │                                      └───────┬────────┘      │
//! │                                              ▼               │
//! │                         guards ─▶ RouteTree ─▶ handler ─▶ Outbox
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully
//! - Panics in handler code are caught at the session lane boundary

pub mod bridge;
pub mod engine;
pub mod guard;
pub mod outbox;
pub mod registry;
pub mod routes;
pub mod scheduler;
pub mod server;
pub mod session;

pub use engine::{DispatchReport, Engine, EngineBuilder};
pub use registry::{RegistryBuilder, RegistryHandle};
pub use session::{SessionContext, SessionHandler};
