//! Fixed-window flood monitor.

use parley_core::{EventKind, FloodRule};
use tokio::time::Instant;

/// Counts watched events per fixed window and trips once per window.
///
/// The window opens on the first watched event and closes `window` later;
/// the first event after that opens a new window and counts as its first
/// hit. Because windows are fixed rather than sliding, a burst split
/// across a window boundary is counted as two smaller bursts.
#[derive(Debug, Clone)]
pub struct FloodMonitor {
    rule: FloodRule,
    window_start: Option<Instant>,
    hits: u32,
    action_fired: bool,
}

impl FloodMonitor {
    pub fn new(rule: FloodRule) -> Self {
        Self {
            rule,
            window_start: None,
            hits: 0,
            action_fired: false,
        }
    }

    pub fn rule(&self) -> &FloodRule {
        &self.rule
    }

    /// Hits counted in the current window.
    pub fn hits(&self) -> u32 {
        self.hits
    }

    /// Returns true if this monitor counts events of `kind`.
    ///
    /// An empty kind list watches every kind.
    pub fn watches(&self, kind: EventKind) -> bool {
        self.rule.event_kinds.is_empty() || self.rule.event_kinds.contains(&kind)
    }

    /// Records one event at `now`.
    ///
    /// Returns true exactly when this event trips the threshold for the
    /// first time in the current window.
    pub fn bump(&mut self, kind: EventKind, now: Instant) -> bool {
        if !self.watches(kind) {
            return false;
        }

        let expired = match self.window_start {
            Some(start) => now > start + self.rule.window(),
            None => true,
        };
        if expired {
            self.window_start = Some(now);
            self.hits = 0;
            self.action_fired = false;
        }

        self.hits = self.hits.saturating_add(1);
        if self.hits >= self.rule.threshold.max(1) && !self.action_fired {
            self.action_fired = true;
            return true;
        }
        false
    }
}
