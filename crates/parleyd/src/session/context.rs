//! Handle given to handler code for everything outside its own state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_core::{Event, Identifier};
use tracing::debug;

use crate::bridge::{BridgeError, SyncBridge};
use crate::outbox::{OutboundRequest, OutboxError};
use crate::registry::RemovalReason;
use crate::routes::RouteEdit;
use crate::scheduler::{ScheduleId, ScheduledAction, Scheduler};

use super::tag::SessionTag;

/// Error returned by [`SessionContext::request`].
///
/// `Timeout` means every attempt ran out of time; `Failed` carries the
/// outbox's own error.
pub type RequestError = BridgeError<OutboxError>;

/// Per-session context passed to every hook and route handler.
///
/// Lives inside the session and is only used from the session's lane.
pub struct SessionContext {
    tag: SessionTag,
    scheduler: Scheduler,
    bridge: SyncBridge,
    created_at: DateTime<Utc>,
    route_edits: Vec<RouteEdit>,
    closing: bool,
}

impl SessionContext {
    pub(crate) fn new(tag: SessionTag, scheduler: Scheduler, bridge: SyncBridge) -> Self {
        Self {
            tag,
            scheduler,
            bridge,
            created_at: Utc::now(),
            route_edits: Vec::new(),
            closing: false,
        }
    }

    pub fn tag(&self) -> &SessionTag {
        &self.tag
    }

    pub fn identifier(&self) -> &Identifier {
        self.tag.identifier()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Calls the handler's `on_wake` hook with `key` after `delay`.
    pub fn schedule_wake(&self, delay: Duration, key: impl Into<String>) -> ScheduleId {
        self.scheduler
            .add_in(&self.tag, delay, ScheduledAction::Wake(key.into()))
    }

    /// Runs `event` through this session's route tree after `delay`.
    pub fn schedule_delivery(&self, delay: Duration, event: Event) -> ScheduleId {
        self.scheduler
            .add_in(&self.tag, delay, ScheduledAction::Deliver(Box::new(event)))
    }

    /// Cancels a pending wake-up or delivery of this session.
    ///
    /// No-op if it already fired, or if `id` belongs to another session.
    pub fn cancel_scheduled(&self, id: ScheduleId) -> bool {
        self.scheduler.remove_owned(&self.tag, id)
    }

    // ========================================================================
    // Outbound requests
    // ========================================================================

    /// Sends a request through the outbox and waits for its reply.
    pub async fn send(&self, request: OutboundRequest) -> Result<serde_json::Value, OutboxError> {
        self.tag.outbox().send(&self.tag, request).await
    }

    /// Sends a request through the sync bridge: the call runs on its own
    /// task, this session's lane waits for at most the bridge timeout per
    /// attempt, and timed-out attempts are retried.
    pub async fn request(&self, request: OutboundRequest) -> Result<serde_json::Value, RequestError> {
        let outbox = self.tag.outbox();
        let tag = self.tag.clone();
        self.bridge
            .open_with_retry(|done| {
                let outbox = Arc::clone(&outbox);
                let tag = tag.clone();
                let request = request.clone();
                async move {
                    let result = outbox.send(&tag, request).await;
                    if !done.close(result) {
                        debug!(session = %tag, "Late reply dropped after timeout");
                    }
                }
            })
            .await
    }

    // ========================================================================
    // Lifecycle signals
    // ========================================================================

    /// Asks the registry to remove this session once the current job ends.
    ///
    /// From this call on the session takes no new events; work already
    /// queued behind the current job is dropped.
    pub fn close(&mut self) -> bool {
        self.close_with(RemovalReason::Closed)
    }

    pub(crate) fn close_with(&mut self, reason: RemovalReason) -> bool {
        if self.closing {
            return false;
        }
        self.closing = true;
        self.tag.request_close(reason)
    }

    /// Closes the session unless work is already queued on its lane.
    ///
    /// Returns true if the close was requested.
    pub(crate) fn close_if_drained(&mut self, reason: RemovalReason) -> bool {
        if self.closing {
            return false;
        }
        match self.tag.request_close_if_drained(reason) {
            Some(_) => {
                self.closing = true;
                true
            }
            None => false,
        }
    }

    /// Asks the registry to remove every session of this identifier and to
    /// ignore the identifier from now on.
    pub fn blacklist(&mut self) -> bool {
        self.closing = true;
        self.tag.request_blacklist()
    }

    /// Returns true once this session asked to be removed.
    pub fn is_closing(&self) -> bool {
        self.closing || self.tag.is_closed()
    }

    pub(crate) fn mark_closing(&mut self) {
        self.closing = true;
    }

    // ========================================================================
    // Route edits
    // ========================================================================

    pub fn enable_group(&mut self, group: impl Into<String>) {
        self.route_edits.push(RouteEdit::EnableGroup(group.into()));
    }

    pub fn disable_group(&mut self, group: impl Into<String>) {
        self.route_edits.push(RouteEdit::DisableGroup(group.into()));
    }

    pub fn remove_group(&mut self, group: impl Into<String>) {
        self.route_edits.push(RouteEdit::RemoveGroup(group.into()));
    }

    pub(crate) fn take_route_edits(&mut self) -> Vec<RouteEdit> {
        std::mem::take(&mut self.route_edits)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use tokio::sync::mpsc;

    use super::*;
    use crate::registry::SessionSignal;
    use crate::session::tag::testing::detached_tag;
    use crate::session::{SessionQueue, Work};

    /// Keeps the detached lane and signal channel alive for a test.
    pub(crate) type DetachedGuard = (SessionQueue<Work>, mpsc::UnboundedReceiver<SessionSignal>);

    pub(crate) fn detached_context() -> (SessionContext, DetachedGuard) {
        let (tag, queue, signals) = detached_tag(1, 1);
        let ctx = SessionContext::new(
            tag,
            Scheduler::new(Duration::ZERO),
            SyncBridge::new(Duration::from_millis(100), 1),
        );
        (ctx, (queue, signals))
    }
}
