//! Session state machine driven by the session lane.

use async_trait::async_trait;
use parley_core::{Event, FloodAction, FloodRule};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::guard::{FloodMonitor, TimeoutMonitor};
use crate::registry::RemovalReason;
use crate::routes::RouteTree;
use crate::scheduler::{ScheduleId, ScheduledAction};

use super::context::SessionContext;
use super::queue::Lane;

/// One unit of work on a session lane.
#[derive(Debug)]
pub enum Work {
    /// Post-construction hook; always the first job of a session.
    Start,
    /// Inbound event.
    Event(Box<Event>),
    /// A scheduler entry that became due.
    Scheduled { id: ScheduleId, action: ScheduledAction },
    /// Final job: runs cleanup and ends the lane.
    Close(RemovalReason),
}

/// Domain state and hooks of one session.
///
/// A fresh handler is built for every session. All methods run on the
/// session's lane, one at a time, so `&mut self` needs no locking.
#[async_trait]
pub trait SessionHandler: Send + Sized + 'static {
    /// Route tree for a new session. Called once, right after construction.
    fn routes(&self) -> RouteTree<Self>;

    /// Runs before the first event is delivered.
    async fn on_start(&mut self, _ctx: &mut SessionContext) {}

    /// A wake-up scheduled with [`SessionContext::schedule_wake`] fired.
    async fn on_wake(&mut self, _key: &str, _ctx: &mut SessionContext) {}

    /// The idle deadline passed.
    ///
    /// The session already refuses new events when this runs and is removed
    /// once it returns.
    async fn on_idle(&mut self, _ctx: &mut SessionContext) {}

    /// A flood rule tripped.
    ///
    /// A `Close` or `Blacklist` action has already sealed the session.
    async fn on_flood(&mut self, _rule: &FloodRule, _ctx: &mut SessionContext) {}

    /// Last hook before the session is dropped.
    async fn on_close(&mut self, _reason: RemovalReason, _ctx: &mut SessionContext) {}
}

/// A handler bound to its routes, guards and context.
pub(crate) struct Session<H: SessionHandler> {
    handler: H,
    routes: RouteTree<H>,
    ctx: SessionContext,
    flood: Vec<FloodMonitor>,
    idle: Option<TimeoutMonitor>,
}

impl<H: SessionHandler> Session<H> {
    pub(crate) fn new(
        handler: H,
        ctx: SessionContext,
        flood: Vec<FloodMonitor>,
        idle: Option<TimeoutMonitor>,
    ) -> Self {
        let routes = handler.routes();
        Self {
            handler,
            routes,
            ctx,
            flood,
            idle,
        }
    }

    /// Installs the idle monitor.
    pub(crate) fn with_idle(mut self, idle: TimeoutMonitor) -> Self {
        self.idle = Some(idle);
        self
    }

    async fn handle_event(&mut self, event: Event) {
        if self.ctx.is_closing() {
            info!(kind = %event.kind, "Session closing, event ignored");
            return;
        }

        if let Some(idle) = self.idle.as_mut() {
            idle.bump(event.kind);
        }

        let now = Instant::now();
        let tripped: Vec<FloodRule> = self
            .flood
            .iter_mut()
            .filter_map(|monitor| monitor.bump(event.kind, now).then(|| monitor.rule().clone()))
            .collect();

        self.route(&event).await;
        if tripped.is_empty() {
            return;
        }

        for rule in &tripped {
            warn!(
                session = %self.ctx.tag(),
                threshold = rule.threshold,
                window_secs = rule.window_secs,
                action = ?rule.action,
                "Flood limit reached"
            );
        }

        // The lane is sealed before any hook awaits, so the registry stops
        // forwarding to this session while the hooks run.
        if tripped.iter().any(|rule| rule.action == FloodAction::Blacklist) {
            self.ctx.blacklist();
        } else if tripped.iter().any(|rule| rule.action == FloodAction::Close) {
            self.ctx.close_with(RemovalReason::Flood);
        }

        for rule in &tripped {
            self.handler.on_flood(rule, &mut self.ctx).await;
        }
    }

    async fn route(&mut self, event: &Event) {
        let consumed = self
            .routes
            .dispatch(&mut self.handler, &mut self.ctx, event)
            .await;
        if !consumed {
            debug!(kind = %event.kind, "No route consumed event");
        }
        self.apply_route_edits();
    }

    fn apply_route_edits(&mut self) {
        for edit in self.ctx.take_route_edits() {
            let touched = self.routes.apply(&edit);
            debug!(edit = ?edit, touched, "Applied route edit");
        }
    }

    async fn handle_scheduled(&mut self, id: ScheduleId, action: ScheduledAction) {
        if self.ctx.is_closing() {
            debug!(id = %id, "Session closing, scheduled action ignored");
            return;
        }

        match action {
            ScheduledAction::IdleTimeout => {
                let current = self.idle.as_mut().is_some_and(|idle| idle.fire(id));
                if !current {
                    debug!(id = %id, "Stale idle deadline ignored");
                    return;
                }
                if !self.ctx.close_if_drained(RemovalReason::IdleTimeout) {
                    // Events slipped in behind the deadline; they count as activity.
                    debug!(id = %id, "Work queued behind idle deadline, re-arming");
                    if let Some(idle) = self.idle.as_mut() {
                        idle.rearm();
                    }
                    return;
                }
                info!(session = %self.ctx.tag(), "Session idle, closing");
                self.handler.on_idle(&mut self.ctx).await;
            }
            ScheduledAction::Wake(key) => {
                self.handler.on_wake(&key, &mut self.ctx).await;
                self.apply_route_edits();
            }
            ScheduledAction::Deliver(event) => {
                self.route(&event).await;
            }
        }
    }

    async fn close(&mut self, reason: RemovalReason) {
        self.ctx.mark_closing();
        if let Some(idle) = self.idle.as_mut() {
            idle.close();
        }

        self.handler.on_close(reason, &mut self.ctx).await;

        // Hooks may have scheduled more work after the registry's sweep.
        let dropped = self.ctx.scheduler().remove_owned_by(self.ctx.tag());
        debug!(reason = %reason, dropped, "Session closed");
    }
}

#[async_trait]
impl<H: SessionHandler> Lane for Session<H> {
    type Job = Work;

    async fn run(&mut self, job: Work) {
        match job {
            Work::Start => {
                self.handler.on_start(&mut self.ctx).await;
                self.apply_route_edits();
            }
            Work::Event(event) => self.handle_event(*event).await,
            Work::Scheduled { id, action } => self.handle_scheduled(id, action).await,
            Work::Close(reason) => self.close(reason).await,
        }
    }

    fn on_fault(&mut self, detail: &str) {
        // Drop half-applied edits from the faulted job.
        let discarded = self.ctx.take_route_edits().len();
        warn!(
            session = %self.ctx.tag(),
            detail = %detail,
            discarded_edits = discarded,
            "Session job faulted, session keeps running"
        );
    }
}
