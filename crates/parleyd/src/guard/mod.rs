//! Per-session abuse guards.
//!
//! - [`FloodMonitor`]: fixed-window event-rate limit with single-fire
//!   semantics per window
//! - [`TimeoutMonitor`]: idle deadline kept in the scheduler and pushed
//!   forward by every watched event
//!
//! Both live inside a session and are only touched from its lane.

mod flood;
mod timeout;

pub use flood::FloodMonitor;
pub use timeout::TimeoutMonitor;
