//! Addressable reference to a live session.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parley_core::{Event, Identifier, RegistryId, SessionKind};
use tokio::sync::mpsc;
use tracing::debug;

use crate::outbox::Outbox;
use crate::registry::{RemovalReason, SessionSignal, SignalKind};

use super::queue::QueueHandle;
use super::runner::Work;

/// Immutable, comparable reference to one session.
///
/// Leaf components (scheduler, abuse guards, outbox) address a session
/// only through its tag: the tag carries the session's lane handle, the
/// registry signal channel and the outbox, never the session itself.
///
/// Equality and hashing use `(identifier, registry)` only. Two sessions
/// opened for the same identifier in one registry compare equal; use
/// [`SessionTag::instance`] to tell them apart.
#[derive(Clone)]
pub struct SessionTag {
    inner: Arc<TagInner>,
}

struct TagInner {
    identifier: Identifier,
    registry: RegistryId,
    kind: SessionKind,
    /// Unique per registry, never reused.
    instance: u64,
    lane: QueueHandle<Work>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    outbox: Arc<dyn Outbox>,
}

impl SessionTag {
    pub(crate) fn new(
        identifier: Identifier,
        registry: RegistryId,
        kind: SessionKind,
        instance: u64,
        lane: QueueHandle<Work>,
        signals: mpsc::UnboundedSender<SessionSignal>,
        outbox: Arc<dyn Outbox>,
    ) -> Self {
        Self {
            inner: Arc::new(TagInner {
                identifier,
                registry,
                kind,
                instance,
                lane,
                signals,
                outbox,
            }),
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.inner.identifier
    }

    pub fn registry(&self) -> &RegistryId {
        &self.inner.registry
    }

    pub fn kind(&self) -> &SessionKind {
        &self.inner.kind
    }

    pub fn instance(&self) -> u64 {
        self.inner.instance
    }

    /// Returns true if both tags point at the very same session instance.
    pub fn same_instance(&self, other: &SessionTag) -> bool {
        self.inner.instance == other.inner.instance && self == other
    }

    /// Hands an event to the session's lane.
    ///
    /// Returns `false` if the session is already tearing down.
    pub fn deliver(&self, event: Event) -> bool {
        self.submit(Work::Event(Box::new(event)))
    }

    pub(crate) fn submit(&self, work: Work) -> bool {
        self.inner.lane.submit(work)
    }

    /// Drops every job queued for this session that has not started yet.
    pub fn cancel_pending(&self) {
        self.inner.lane.cancel_all();
    }

    /// Cancels the backlog and queues the final close job.
    pub(crate) fn shutdown_lane(&self, reason: RemovalReason) -> bool {
        self.inner.lane.shutdown(Work::Close(reason))
    }

    /// Returns true once the session has started tearing down.
    pub fn is_closed(&self) -> bool {
        self.inner.lane.is_closed()
    }

    /// Seals the lane and asks the owning registry to remove this session.
    ///
    /// Once sealed, the lane refuses new events, so the registry routes
    /// them to a fresh session instead of this one.
    pub fn request_close(&self, reason: RemovalReason) -> bool {
        self.inner.lane.seal(|| self.signal(SignalKind::Close(reason)))
    }

    /// Like [`SessionTag::request_close`], but only when no work is waiting
    /// on the lane. Returns `None` without closing otherwise.
    pub fn request_close_if_drained(&self, reason: RemovalReason) -> Option<bool> {
        self.inner
            .lane
            .seal_if_drained(|| self.signal(SignalKind::Close(reason)))
    }

    /// Seals the lane and asks the owning registry to remove this session
    /// and ignore its identifier from now on.
    pub fn request_blacklist(&self) -> bool {
        self.inner.lane.seal(|| self.signal(SignalKind::Blacklist))
    }

    fn signal(&self, kind: SignalKind) -> bool {
        let sent = self
            .inner
            .signals
            .send(SessionSignal {
                identifier: self.inner.identifier.clone(),
                instance: self.inner.instance,
                kind,
            })
            .is_ok();
        if !sent {
            debug!(
                identifier = %self.inner.identifier,
                registry = %self.inner.registry,
                "Registry gone, dropping session signal"
            );
        }
        sent
    }

    /// Outbound request collaborator for this session.
    pub fn outbox(&self) -> Arc<dyn Outbox> {
        Arc::clone(&self.inner.outbox)
    }
}

impl PartialEq for SessionTag {
    fn eq(&self, other: &Self) -> bool {
        self.inner.identifier == other.inner.identifier
            && self.inner.registry == other.inner.registry
    }
}

impl Eq for SessionTag {}

impl Hash for SessionTag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.identifier.hash(state);
        self.inner.registry.hash(state);
    }
}

impl fmt::Debug for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTag")
            .field("identifier", &self.inner.identifier)
            .field("registry", &self.inner.registry)
            .field("kind", &self.inner.kind)
            .field("instance", &self.inner.instance)
            .finish()
    }
}

impl fmt::Display for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}#{}",
            self.inner.registry, self.inner.identifier, self.inner.instance
        )
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers for building tags without a registry.

    use super::*;
    use crate::outbox::MemoryOutbox;
    use crate::session::SessionQueue;

    /// A tag whose lane is never drained, plus the signal receiver.
    pub(crate) fn detached_tag(
        identifier: impl Into<Identifier>,
        instance: u64,
    ) -> (
        SessionTag,
        SessionQueue<Work>,
        mpsc::UnboundedReceiver<SessionSignal>,
    ) {
        let (queue, lane) = SessionQueue::new();
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let tag = SessionTag::new(
            identifier.into(),
            RegistryId::new("test"),
            SessionKind::Chat,
            instance,
            lane,
            signals,
            Arc::new(MemoryOutbox::new()),
        );
        (tag, queue, signal_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::detached_tag;
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_ignores_instance() {
        let (a, _qa, _ra) = detached_tag(42, 1);
        let (b, _qb, _rb) = detached_tag(42, 2);
        let (c, _qc, _rc) = detached_tag(43, 3);

        assert_eq!(a, b);
        assert!(!a.same_instance(&b));
        assert!(a.same_instance(&a.clone()));
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_display() {
        let (tag, _q, _r) = detached_tag("chat:42", 7);
        assert_eq!(tag.to_string(), "test/chat:42#7");
    }

    #[tokio::test]
    async fn test_signals_reach_registry() {
        let (tag, _q, mut signals) = detached_tag(42, 1);

        assert!(tag.request_close(RemovalReason::Closed));
        assert!(tag.request_blacklist());

        let first = signals.recv().await.unwrap();
        assert_eq!(first.instance, 1);
        assert_eq!(first.kind, SignalKind::Close(RemovalReason::Closed));
        let second = signals.recv().await.unwrap();
        assert_eq!(second.kind, SignalKind::Blacklist);
    }

    #[test]
    fn test_signal_after_registry_dropped() {
        let (tag, _q, signals) = detached_tag(42, 1);
        drop(signals);
        assert!(!tag.request_close(RemovalReason::Closed));
    }
}
