//! Idle timeout monitor.

use std::time::Duration;

use parley_core::EventKind;
use tracing::trace;

use crate::scheduler::{ScheduleId, ScheduledAction, Scheduler};
use crate::session::SessionTag;

/// Keeps exactly one pending idle deadline for a session.
///
/// Every watched event replaces the pending deadline with a fresh one
/// `idle` from now. When the deadline reaches the session lane the session
/// checks [`TimeoutMonitor::fire`]; a deadline that was replaced in the
/// meantime is reported as stale.
pub struct TimeoutMonitor {
    kinds: Vec<EventKind>,
    idle: Duration,
    pending: Option<ScheduleId>,
    scheduler: Scheduler,
    owner: SessionTag,
}

impl TimeoutMonitor {
    /// Creates the monitor and arms the first deadline.
    pub fn set(scheduler: Scheduler, owner: SessionTag, kinds: Vec<EventKind>, idle: Duration) -> Self {
        let mut monitor = Self {
            kinds,
            idle,
            pending: None,
            scheduler,
            owner,
        };
        monitor.rearm();
        monitor
    }

    pub fn idle(&self) -> Duration {
        self.idle
    }

    /// The deadline currently pending in the scheduler.
    pub fn pending(&self) -> Option<ScheduleId> {
        self.pending
    }

    /// Returns true if `kind` counts as activity.
    ///
    /// An empty kind list watches every kind.
    pub fn watches(&self, kind: EventKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }

    /// Pushes the deadline forward if `kind` is watched.
    ///
    /// Returns true if the deadline moved.
    pub fn bump(&mut self, kind: EventKind) -> bool {
        if !self.watches(kind) {
            return false;
        }
        self.rearm();
        true
    }

    /// Claims a fired deadline.
    ///
    /// Returns true only for the deadline currently pending; the monitor is
    /// disarmed afterwards.
    pub fn fire(&mut self, id: ScheduleId) -> bool {
        if self.pending == Some(id) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    /// Cancels the pending deadline without firing it.
    pub fn close(&mut self) {
        if let Some(id) = self.pending.take() {
            self.scheduler.remove(id);
        }
    }

    /// Replaces any pending deadline with one `idle` from now.
    pub fn rearm(&mut self) {
        if let Some(old) = self.pending.take() {
            self.scheduler.remove(old);
        }
        let id = self
            .scheduler
            .add_in(&self.owner, self.idle, ScheduledAction::IdleTimeout);
        trace!(session = %self.owner, id = %id, "Idle deadline armed");
        self.pending = Some(id);
    }
}
