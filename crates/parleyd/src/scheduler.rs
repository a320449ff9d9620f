//! Delayed actions bound to sessions.
//!
//! The scheduler keeps pending [`ScheduleEvent`]s ordered by execution
//! time. [`Scheduler::tick`] pops every due entry and submits its action to
//! the owning session's lane; it never runs handler code itself, so the
//! per-session serial guarantee holds for scheduled work too.
//!
//! Ordering is `(execute_at, created_at, insertion sequence)`, which makes
//! ties deterministic. Every entry gets a unique [`ScheduleId`] so a
//! session can cancel exactly the entry it submitted.
//!
//! All state sits behind one `parking_lot` mutex that is never held across
//! an `.await` or while submitting to a lane.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_core::{Event, SchedulerConfig};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::session::{SessionTag, Work};

/// Identity of one scheduled entry. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScheduleId(u64);

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sched-{}", self.0)
    }
}

/// What a scheduled entry does once it reaches its session's lane.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduledAction {
    /// Idle deadline armed by the session's timeout monitor.
    IdleTimeout,
    /// Calls the handler's `on_wake` hook with this key.
    Wake(String),
    /// Runs the event through the session's route tree.
    Deliver(Box<Event>),
}

impl ScheduledAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::IdleTimeout => "idle_timeout",
            Self::Wake(_) => "wake",
            Self::Deliver(_) => "deliver",
        }
    }
}

/// One pending delayed action.
#[derive(Debug, Clone)]
pub struct ScheduleEvent {
    pub id: ScheduleId,
    pub owner: SessionTag,
    pub created_at: Instant,
    pub execute_at: Instant,
    pub action: ScheduledAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    execute_at: Instant,
    created_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct SchedulerState {
    queue: BTreeMap<EntryKey, ScheduleEvent>,
    index: HashMap<ScheduleId, EntryKey>,
    next_seq: u64,
}

/// Shared, clonable handle to the scheduler queue.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<SchedulerState>>,
    tolerance: Duration,
}

impl Scheduler {
    /// Creates an empty scheduler with the given fluctuation tolerance.
    pub fn new(tolerance: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState::default())),
            tolerance,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.fluctuation_tolerance())
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Inserts an action for `owner` that becomes due at `execute_at`.
    pub fn add(&self, owner: &SessionTag, execute_at: Instant, action: ScheduledAction) -> ScheduleId {
        let created_at = Instant::now();
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        let id = ScheduleId(seq);
        let key = EntryKey {
            execute_at,
            created_at,
            seq,
        };
        trace!(
            id = %id,
            session = %owner,
            action = action.label(),
            "Scheduled action"
        );
        state.queue.insert(
            key,
            ScheduleEvent {
                id,
                owner: owner.clone(),
                created_at,
                execute_at,
                action,
            },
        );
        state.index.insert(id, key);
        id
    }

    /// Inserts an action due `delay` from now.
    pub fn add_in(&self, owner: &SessionTag, delay: Duration, action: ScheduledAction) -> ScheduleId {
        self.add(owner, Instant::now() + delay, action)
    }

    /// Cancels one pending entry.
    ///
    /// Returns `false` if the entry already fired or was already removed.
    pub fn remove(&self, id: ScheduleId) -> bool {
        let mut state = self.state.lock();
        match state.index.remove(&id) {
            Some(key) => state.queue.remove(&key).is_some(),
            None => false,
        }
    }

    /// Cancels one pending entry, but only on behalf of the exact session
    /// instance that scheduled it.
    pub fn remove_owned(&self, owner: &SessionTag, id: ScheduleId) -> bool {
        let mut state = self.state.lock();
        let Some(key) = state.index.get(&id).copied() else {
            return false;
        };
        let owned = state
            .queue
            .get(&key)
            .is_some_and(|entry| entry.owner.same_instance(owner));
        if !owned {
            trace!(id = %id, session = %owner, "Refusing to cancel another session's entry");
            return false;
        }
        state.index.remove(&id);
        state.queue.remove(&key).is_some()
    }

    /// Cancels every pending entry owned by this exact session instance.
    ///
    /// Sibling sessions under the same identifier keep their entries.
    pub fn remove_owned_by(&self, owner: &SessionTag) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let before = state.queue.len();
        let index = &mut state.index;
        state.queue.retain(|_, entry| {
            let keep = !entry.owner.same_instance(owner);
            if !keep {
                index.remove(&entry.id);
            }
            keep
        });
        before - state.queue.len()
    }

    /// Pops every entry due at `now` (within tolerance), earliest first,
    /// without dispatching them.
    pub fn pop_due(&self, now: Instant) -> Vec<ScheduleEvent> {
        let horizon = now + self.tolerance;
        let mut state = self.state.lock();
        let mut due = Vec::new();
        while let Some(head) = state.queue.first_entry() {
            if head.key().execute_at > horizon {
                break;
            }
            let entry = head.remove();
            state.index.remove(&entry.id);
            due.push(entry);
        }
        due
    }

    /// Pops every due entry and submits it to its owner's lane.
    ///
    /// Entries whose session has begun teardown are dropped. Returns the
    /// popped entries in dispatch order.
    pub fn tick(&self, now: Instant) -> Vec<ScheduleEvent> {
        let due = self.pop_due(now);
        for entry in &due {
            let work = Work::Scheduled {
                id: entry.id,
                action: entry.action.clone(),
            };
            if !entry.owner.submit(work) {
                debug!(
                    id = %entry.id,
                    session = %entry.owner,
                    action = entry.action.label(),
                    "Dropping scheduled action for a closed session"
                );
            }
        }
        due
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Execution time of the earliest pending entry.
    pub fn next_due(&self) -> Option<Instant> {
        self.state.lock().queue.keys().next().map(|key| key.execute_at)
    }

    /// Returns true if the entry is still pending.
    pub fn contains(&self, id: ScheduleId) -> bool {
        self.state.lock().index.contains_key(&id)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.len())
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

/// Spawns the loop that ticks `scheduler` every `interval` until `cancel`
/// fires.
pub fn spawn_scheduler_task(
    scheduler: Scheduler,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "Scheduler tick loop starting");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    break;
                }

                _ = ticker.tick() => {
                    let fired = scheduler.tick(Instant::now());
                    if !fired.is_empty() {
                        trace!(count = fired.len(), "Dispatched scheduled actions");
                    }
                }
            }
        }

        info!(pending = scheduler.len(), "Scheduler tick loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tag::testing::detached_tag;

    fn scheduler() -> Scheduler {
        Scheduler::new(Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_returns_due_entries_in_time_order() {
        let sched = scheduler();
        let (tag, _q, _r) = detached_tag(1, 1);
        let t = Instant::now();

        let five = sched.add(&tag, t + Duration::from_secs(5), ScheduledAction::Wake("5".into()));
        let one = sched.add(&tag, t + Duration::from_secs(1), ScheduledAction::Wake("1".into()));
        let three = sched.add(&tag, t + Duration::from_secs(3), ScheduledAction::Wake("3".into()));

        let fired: Vec<_> = sched
            .tick(t + Duration::from_secs(6))
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(fired, vec![one, three, five]);
        assert!(sched.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ties_break_on_creation_then_insertion() {
        let sched = scheduler();
        let (tag, _q, _r) = detached_tag(1, 1);
        let due = Instant::now() + Duration::from_secs(1);

        let first = sched.add(&tag, due, ScheduledAction::Wake("a".into()));
        tokio::time::advance(Duration::from_millis(10)).await;
        let second = sched.add(&tag, due, ScheduledAction::Wake("b".into()));
        let third = sched.add(&tag, due, ScheduledAction::Wake("c".into()));

        let fired: Vec<_> = sched.pop_due(due).into_iter().map(|e| e.id).collect();
        assert_eq!(fired, vec![first, second, third]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_entries_stay_queued() {
        let sched = scheduler();
        let (tag, _q, _r) = detached_tag(1, 1);
        let t = Instant::now();

        sched.add(&tag, t + Duration::from_secs(1), ScheduledAction::IdleTimeout);
        let later = sched.add(&tag, t + Duration::from_secs(2), ScheduledAction::IdleTimeout);

        assert_eq!(sched.tick(t + Duration::from_secs(1)).len(), 1);
        assert!(sched.contains(later));
        assert_eq!(sched.next_due(), Some(t + Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tolerance_absorbs_jitter() {
        let sched = scheduler();
        let (tag, _q, _r) = detached_tag(1, 1);
        let t = Instant::now();

        sched.add(&tag, t + Duration::from_millis(1050), ScheduledAction::IdleTimeout);
        assert_eq!(sched.tick(t + Duration::from_secs(1)).len(), 1);

        sched.add(&tag, t + Duration::from_millis(1200), ScheduledAction::IdleTimeout);
        assert!(sched.tick(t + Duration::from_secs(1)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_before_and_after_firing() {
        let sched = scheduler();
        let (tag, _q, _r) = detached_tag(1, 1);
        let t = Instant::now();

        let cancelled = sched.add(&tag, t + Duration::from_secs(1), ScheduledAction::IdleTimeout);
        let fired = sched.add(&tag, t + Duration::from_secs(1), ScheduledAction::IdleTimeout);

        assert!(sched.remove(cancelled));
        assert!(!sched.remove(cancelled));

        let popped = sched.tick(t + Duration::from_secs(2));
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].id, fired);
        assert!(!sched.remove(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_owned_by_spares_sibling_instances() {
        let sched = scheduler();
        let (first, _q1, _r1) = detached_tag(42, 1);
        let (sibling, _q2, _r2) = detached_tag(42, 2);
        let t = Instant::now() + Duration::from_secs(1);

        sched.add(&first, t, ScheduledAction::IdleTimeout);
        sched.add(&first, t, ScheduledAction::Wake("x".into()));
        let kept = sched.add(&sibling, t, ScheduledAction::IdleTimeout);

        assert_eq!(sched.remove_owned_by(&first), 2);
        assert_eq!(sched.len(), 1);
        assert!(sched.contains(kept));
        assert_eq!(sched.remove_owned_by(&first), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_owned_checks_the_instance() {
        let sched = scheduler();
        let (owner, _q1, _r1) = detached_tag(42, 1);
        let (sibling, _q2, _r2) = detached_tag(42, 2);
        let id = sched.add_in(&owner, Duration::from_secs(1), ScheduledAction::Wake("x".into()));

        assert!(!sched.remove_owned(&sibling, id));
        assert!(sched.contains(id));
        assert!(sched.remove_owned(&owner, id));
        assert!(!sched.remove_owned(&owner, id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_drops_actions_for_closed_sessions() {
        let sched = scheduler();
        let (tag, queue, _r) = detached_tag(1, 1);
        drop(queue);

        sched.add_in(&tag, Duration::ZERO, ScheduledAction::IdleTimeout);
        let fired = sched.tick(Instant::now());
        assert_eq!(fired.len(), 1);
        assert!(sched.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_loop_stops_on_cancel() {
        let sched = scheduler();
        let cancel = CancellationToken::new();
        let task = spawn_scheduler_task(sched.clone(), Duration::from_millis(100), cancel.clone());

        let (tag, _q, _r) = detached_tag(1, 1);
        sched.add_in(&tag, Duration::from_millis(250), ScheduledAction::IdleTimeout);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(sched.is_empty());

        cancel.cancel();
        task.await.unwrap();
    }
}
