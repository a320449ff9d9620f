//! Sessions: the unit of state bound to one identifier.
//!
//! - [`queue`]: the per-session serial lane
//! - [`tag`]: the comparable reference leaf components hold
//! - [`context`]: what handler code sees besides its own state
//! - [`runner`]: the handler trait and the state machine the lane drives

pub mod context;
pub mod queue;
pub mod runner;
pub mod tag;

pub use context::{RequestError, SessionContext};
pub use queue::{Lane, QueueHandle, SessionQueue};
pub use runner::{SessionHandler, Work};
pub use tag::SessionTag;

pub(crate) use runner::Session;
