//! parley Protocol - Wire frames for the reference transport
//!
//! This crate provides message types and parsing for communication
//! between a transport process (polling or webhook fetcher) and the
//! daemon, and for the outbound requests the daemon emits.

pub mod message;
pub mod parse;
pub mod version;

pub use message::{ClientMessage, DaemonMessage, MessageType};
pub use parse::{OutboundFrame, RawEvent};
pub use version::{ProtocolVersion, VersionError};
