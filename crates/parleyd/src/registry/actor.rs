//! Registry actor - owns the identifier → session map of one registry.
//!
//! The actor receives commands from `RegistryHandle`s and signals from its
//! own sessions, processes them one at a time, and publishes lifecycle
//! events. Holding the map inside a single task gives the required mutual
//! exclusion without a lock, and no handler code ever runs here: the actor
//! only creates lanes and pushes work onto them.
//!
//! # Teardown order
//!
//! Removing a session always
//! 1. takes it out of the map,
//! 2. cancels its scheduler entries,
//! 3. cancels its lane backlog and queues the final `Close` job.
//!
//! A session closing itself seals its lane and sends a signal in one step,
//! so removal never happens re-entrantly inside that session's own job. A
//! sealed lane refuses new events; when every entry for an identifier
//! refuses, dispatch applies the pending signals and routes the event to a
//! fresh session.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Panics in `classify` or the session factory are caught and reported
//!   as `DispatchOutcome::Faulted`
//! - Channel send failures are logged but don't panic

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_core::{Event, EventKind, FloodRule, Identifier, RegistryId, SessionKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn};

use crate::bridge::SyncBridge;
use crate::guard::{FloodMonitor, TimeoutMonitor};
use crate::outbox::Outbox;
use crate::scheduler::Scheduler;
use crate::session::queue::panic_detail;
use crate::session::{Session, SessionContext, SessionHandler, SessionQueue, SessionTag, Work};

use super::commands::{
    DispatchOutcome, RegistryCommand, RegistryError, RemovalReason, SessionEvent, SessionInfo,
    SessionSignal, SignalKind,
};

/// How long shutdown waits for session lanes to run their close hooks.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub(crate) type Classifier = Arc<dyn Fn(&Event) -> Option<Identifier> + Send + Sync>;
pub(crate) type Factory<H> = Arc<dyn Fn() -> H + Send + Sync>;

/// Everything a registry needs to build sessions.
pub(crate) struct RegistrySettings<H> {
    pub name: RegistryId,
    pub kind: SessionKind,
    pub classify: Classifier,
    pub factory: Factory<H>,
    /// 0 means unlimited
    pub capacity: usize,
    pub idle: Option<(Duration, Vec<EventKind>)>,
    pub flood: Vec<FloodRule>,
    pub bridge: SyncBridge,
}

struct SessionEntry {
    tag: SessionTag,
    created_at: DateTime<Utc>,
    worker: JoinHandle<()>,
}

impl SessionEntry {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            identifier: self.tag.identifier().clone(),
            instance: self.tag.instance(),
            kind: self.tag.kind().clone(),
            created_at: self.created_at,
        }
    }
}

/// The registry actor.
pub struct RegistryActor<H: SessionHandler> {
    settings: RegistrySettings<H>,

    /// Commands from handles
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Close/blacklist requests from sessions
    signals: mpsc::UnboundedReceiver<SessionSignal>,
    signal_sender: mpsc::UnboundedSender<SessionSignal>,

    /// Live sessions per identifier, in creation order. Never holds an
    /// empty list.
    sessions: HashMap<Identifier, Vec<SessionEntry>>,

    blacklist: HashSet<Identifier>,

    /// Last instance number handed out
    next_instance: u64,

    scheduler: Scheduler,
    outbox: Arc<dyn Outbox>,
    event_publisher: broadcast::Sender<SessionEvent>,
}

impl<H: SessionHandler> RegistryActor<H> {
    pub(crate) fn new(
        settings: RegistrySettings<H>,
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<SessionEvent>,
        scheduler: Scheduler,
        outbox: Arc<dyn Outbox>,
    ) -> Self {
        let (signal_sender, signals) = mpsc::unbounded_channel();
        Self {
            settings,
            receiver,
            signals,
            signal_sender,
            sessions: HashMap::new(),
            blacklist: HashSet::new(),
            next_instance: 0,
            scheduler,
            outbox,
            event_publisher,
        }
    }

    /// Runs the actor until `Shutdown` arrives or every handle is dropped.
    pub async fn run(mut self) {
        info!(
            registry = %self.settings.name,
            kind = %self.settings.kind,
            capacity = self.settings.capacity,
            "Registry actor starting"
        );

        loop {
            tokio::select! {
                biased;

                Some(signal) = self.signals.recv() => {
                    self.handle_signal(signal);
                }

                cmd = self.receiver.recv() => {
                    let flow = match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            self.shutdown_all().await;
                            ControlFlow::Break(())
                        }
                    };
                    if flow.is_break() {
                        break;
                    }
                }
            }
        }

        info!(registry = %self.settings.name, "Registry actor stopped");
    }

    async fn handle_command(&mut self, cmd: RegistryCommand) -> ControlFlow<()> {
        match cmd {
            RegistryCommand::Dispatch { event, respond_to } => {
                let outcome = self.handle_dispatch(*event);
                // Ignore send error - caller may have dropped the receiver
                let _ = respond_to.send(outcome);
            }
            RegistryCommand::OpenSession {
                identifier,
                respond_to,
            } => {
                let result = self.handle_open_session(identifier);
                let _ = respond_to.send(result);
            }
            RegistryCommand::DeleteSessions {
                identifier,
                reason,
                respond_to,
            } => {
                let removed = self.delete_sessions(&identifier, reason).len();
                let _ = respond_to.send(removed);
            }
            RegistryCommand::Sessions { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            RegistryCommand::Unblacklist {
                identifier,
                respond_to,
            } => {
                let listed = self.blacklist.remove(&identifier);
                if listed {
                    info!(registry = %self.settings.name, identifier = %identifier, "Identifier unblacklisted");
                }
                let _ = respond_to.send(listed);
            }
            RegistryCommand::Shutdown { respond_to } => {
                let removed = self.shutdown_all().await;
                let _ = respond_to.send(removed);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_dispatch(&mut self, event: Event) -> DispatchOutcome {
        let classify = Arc::clone(&self.settings.classify);
        let identifier = match panic::catch_unwind(AssertUnwindSafe(|| classify(&event))) {
            Ok(Some(identifier)) => identifier,
            Ok(None) => return DispatchOutcome::NotInterested,
            Err(panic) => {
                let detail = panic_detail(panic.as_ref());
                error!(
                    registry = %self.settings.name,
                    kind = %event.kind,
                    detail = %detail,
                    "Classify function panicked"
                );
                return DispatchOutcome::Faulted(detail);
            }
        };

        let outcome = self.route_to_sessions(&identifier, &event);
        if !matches!(outcome, DispatchOutcome::Forwarded { sessions: 0, .. }) {
            return outcome;
        }

        // Every live entry refused the event: its session is tearing down and
        // its close signal is already queued. Apply it and route again.
        let applied = self.apply_pending_signals();
        debug!(
            registry = %self.settings.name,
            identifier = %identifier,
            applied,
            "Session sealed, retrying dispatch"
        );
        self.route_to_sessions(&identifier, &event)
    }

    fn route_to_sessions(&mut self, identifier: &Identifier, event: &Event) -> DispatchOutcome {
        if self.blacklist.contains(identifier) {
            debug!(
                registry = %self.settings.name,
                identifier = %identifier,
                "Ignoring event from blacklisted identifier"
            );
            return DispatchOutcome::Blacklisted;
        }

        let mut created = false;
        if !self.sessions.contains_key(identifier) {
            if self.at_capacity() {
                self.reject(identifier);
                return DispatchOutcome::AtCapacity;
            }
            if let Err(detail) = self.create_session(identifier.clone()) {
                return DispatchOutcome::Faulted(detail);
            }
            created = true;
        }

        let sessions = self
            .sessions
            .get(identifier)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.tag.deliver(event.clone()))
                    .count()
            })
            .unwrap_or(0);

        debug!(
            registry = %self.settings.name,
            identifier = %identifier,
            kind = %event.kind,
            sessions,
            created,
            "Event forwarded"
        );

        DispatchOutcome::Forwarded { created, sessions }
    }

    fn handle_open_session(&mut self, identifier: Identifier) -> Result<SessionInfo, RegistryError> {
        if self.blacklist.contains(&identifier) {
            return Err(RegistryError::Blacklisted(identifier));
        }
        if self.at_capacity() {
            self.reject(&identifier);
            return Err(RegistryError::RegistryFull {
                max: self.settings.capacity,
            });
        }

        self.create_session(identifier.clone())
            .map_err(RegistryError::FactoryFailed)?;

        self.sessions
            .get(&identifier)
            .and_then(|entries| entries.last())
            .map(SessionEntry::info)
            .ok_or(RegistryError::ChannelClosed)
    }

    /// Drains signals that sessions sent but the loop has not picked up yet.
    fn apply_pending_signals(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(signal) = self.signals.try_recv() {
            self.handle_signal(signal);
            applied += 1;
        }
        applied
    }

    fn handle_signal(&mut self, signal: SessionSignal) {
        match signal.kind {
            SignalKind::Close(reason) => {
                match self.take_instance(&signal.identifier, signal.instance) {
                    Some(entry) => {
                        self.teardown(entry, reason);
                    }
                    None => {
                        debug!(
                            registry = %self.settings.name,
                            identifier = %signal.identifier,
                            instance = signal.instance,
                            "Close requested for a session already removed"
                        );
                    }
                }
            }
            SignalKind::Blacklist => {
                warn!(
                    registry = %self.settings.name,
                    identifier = %signal.identifier,
                    "Blacklisting identifier"
                );
                self.blacklist.insert(signal.identifier.clone());
                self.delete_sessions(&signal.identifier, RemovalReason::Blacklisted);
            }
        }
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Builds a session, spawns its lane and queues its start hook.
    ///
    /// Returns the panic message if the factory or the handler's route
    /// setup panicked; nothing is registered in that case.
    fn create_session(&mut self, identifier: Identifier) -> Result<(), String> {
        self.next_instance += 1;
        let instance = self.next_instance;

        let (queue, lane) = SessionQueue::new();
        let tag = SessionTag::new(
            identifier.clone(),
            self.settings.name.clone(),
            self.settings.kind.clone(),
            instance,
            lane,
            self.signal_sender.clone(),
            Arc::clone(&self.outbox),
        );

        let ctx = SessionContext::new(tag.clone(), self.scheduler.clone(), self.settings.bridge);
        let flood = self
            .settings
            .flood
            .iter()
            .cloned()
            .map(FloodMonitor::new)
            .collect();
        let factory = Arc::clone(&self.settings.factory);

        let built = panic::catch_unwind(AssertUnwindSafe(|| Session::new(factory(), ctx, flood, None)));
        let session = match built {
            Ok(session) => session,
            Err(panic) => {
                let detail = panic_detail(panic.as_ref());
                error!(
                    registry = %self.settings.name,
                    identifier = %identifier,
                    detail = %detail,
                    "Session factory panicked"
                );
                return Err(detail);
            }
        };

        let session = match &self.settings.idle {
            Some((idle, kinds)) => session.with_idle(TimeoutMonitor::set(
                self.scheduler.clone(),
                tag.clone(),
                kinds.clone(),
                *idle,
            )),
            None => session,
        };

        let span = info_span!(
            "session",
            registry = %self.settings.name,
            identifier = %identifier,
            instance
        );
        let worker = queue.spawn(session, span);
        tag.submit(Work::Start);

        self.sessions
            .entry(identifier.clone())
            .or_default()
            .push(SessionEntry {
                tag,
                created_at: Utc::now(),
                worker,
            });

        info!(
            registry = %self.settings.name,
            identifier = %identifier,
            instance,
            total_sessions = self.live_count(),
            "Session created"
        );
        let _ = self.event_publisher.send(SessionEvent::Created {
            identifier,
            instance,
        });
        Ok(())
    }

    /// Cancels a removed session's scheduled events and lane backlog, then
    /// queues its close job. The entry must already be out of the map.
    fn teardown(&mut self, entry: SessionEntry, reason: RemovalReason) -> JoinHandle<()> {
        let cancelled = self.scheduler.remove_owned_by(&entry.tag);
        entry.tag.shutdown_lane(reason);

        info!(
            registry = %self.settings.name,
            identifier = %entry.tag.identifier(),
            instance = entry.tag.instance(),
            reason = %reason,
            cancelled_events = cancelled,
            total_sessions = self.live_count(),
            "Session removed"
        );
        let _ = self.event_publisher.send(SessionEvent::Removed {
            identifier: entry.tag.identifier().clone(),
            instance: entry.tag.instance(),
            reason,
        });
        entry.worker
    }

    fn delete_sessions(&mut self, identifier: &Identifier, reason: RemovalReason) -> Vec<JoinHandle<()>> {
        let entries = self.sessions.remove(identifier).unwrap_or_default();
        entries
            .into_iter()
            .map(|entry| self.teardown(entry, reason))
            .collect()
    }

    fn take_instance(&mut self, identifier: &Identifier, instance: u64) -> Option<SessionEntry> {
        let entries = self.sessions.get_mut(identifier)?;
        let position = entries
            .iter()
            .position(|entry| entry.tag.instance() == instance)?;
        let entry = entries.remove(position);
        if entries.is_empty() {
            self.sessions.remove(identifier);
        }
        Some(entry)
    }

    /// Removes every session and waits (bounded) for their close hooks.
    async fn shutdown_all(&mut self) -> usize {
        let identifiers: Vec<Identifier> = self.sessions.keys().cloned().collect();
        let mut workers = Vec::new();
        for identifier in identifiers {
            workers.extend(self.delete_sessions(&identifier, RemovalReason::Shutdown));
        }

        let removed = workers.len();
        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(workers))
            .await
            .is_err()
        {
            warn!(
                registry = %self.settings.name,
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "Sessions still closing after shutdown grace period"
            );
        }
        removed
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn live_count(&self) -> usize {
        self.sessions.values().map(Vec::len).sum()
    }

    fn at_capacity(&self) -> bool {
        self.settings.capacity != 0 && self.live_count() >= self.settings.capacity
    }

    fn reject(&self, identifier: &Identifier) {
        warn!(
            registry = %self.settings.name,
            identifier = %identifier,
            capacity = self.settings.capacity,
            "Registry is full, rejecting new session"
        );
        let _ = self.event_publisher.send(SessionEvent::Rejected {
            identifier: identifier.clone(),
        });
    }

    fn snapshot(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .values()
            .flatten()
            .map(SessionEntry::info)
            .collect();
        infos.sort_by_key(|info| info.instance);
        infos
    }
}
