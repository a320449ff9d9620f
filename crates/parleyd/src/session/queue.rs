//! Per-session serial execution lane.
//!
//! A `SessionQueue` is an unbounded FIFO drained by exactly one tokio task,
//! so at most one job runs for a session at any instant. Producers never
//! block: [`QueueHandle::submit`] only pushes onto the channel.
//!
//! # Cancellation
//!
//! Every envelope is stamped with the queue's generation at submission
//! time. [`QueueHandle::cancel_all`] bumps the generation, and the worker
//! silently drops envelopes from older generations. The job currently
//! running is never interrupted.
//!
//! # Sealing
//!
//! A session that decides to close seals its lane: every later `submit`
//! is refused while the running job and the backlog carry on. The seal
//! and the caller's close signal happen under one lock, so a producer
//! that sees a refusal also sees the signal already queued.
//!
//! # Panic-Free Guarantees
//!
//! Panics raised inside a job are caught at the lane boundary with
//! `catch_unwind`, logged, and reported to [`Lane::on_fault`]. The worker
//! keeps draining the backlog afterwards.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, Instrument, Span};

/// The consumer side of a session queue.
///
/// Implementors own their state exclusively; `run` is only ever called
/// from the lane's single worker task.
#[async_trait]
pub trait Lane: Send + 'static {
    type Job: Send + 'static;

    /// Runs one job to completion.
    async fn run(&mut self, job: Self::Job);

    /// Called after a job panicked.
    fn on_fault(&mut self, _detail: &str) {}
}

struct Envelope<J> {
    generation: u64,
    job: J,
    /// Final job of a shut-down queue; the worker exits after running it.
    last: bool,
}

#[derive(Default)]
struct QueueState {
    generation: AtomicU64,
    closed: AtomicBool,
    gate: Mutex<Gate>,
}

/// Submission gate; held across every send onto the channel.
#[derive(Default)]
struct Gate {
    sealed: bool,
    /// Envelopes sent but not yet taken by the worker
    queued: usize,
}

/// Producer handle for a session queue. Cheap to clone.
pub struct QueueHandle<J> {
    sender: mpsc::UnboundedSender<Envelope<J>>,
    state: Arc<QueueState>,
}

impl<J> Clone for QueueHandle<J> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<J: Send + 'static> QueueHandle<J> {
    /// Appends a job to the backlog.
    ///
    /// Returns `false` if the queue has been shut down or its worker is
    /// gone; the job is dropped in that case.
    pub fn submit(&self, job: J) -> bool {
        let mut gate = self.state.gate.lock();
        if gate.sealed || self.state.closed.load(Ordering::Acquire) || self.sender.is_closed() {
            return false;
        }
        let generation = self.state.generation.load(Ordering::Acquire);
        let sent = self
            .sender
            .send(Envelope {
                generation,
                job,
                last: false,
            })
            .is_ok();
        if sent {
            gate.queued += 1;
        }
        sent
    }

    /// Refuses every later `submit`, then runs `then` before any producer
    /// can observe the refusal.
    ///
    /// Jobs already queued still run; `shutdown` is still accepted.
    pub fn seal<R>(&self, then: impl FnOnce() -> R) -> R {
        let mut gate = self.state.gate.lock();
        gate.sealed = true;
        then()
    }

    /// Like [`QueueHandle::seal`], but only when no job is waiting in the
    /// backlog. Returns `None` and leaves the queue open otherwise.
    pub fn seal_if_drained<R>(&self, then: impl FnOnce() -> R) -> Option<R> {
        let mut gate = self.state.gate.lock();
        if gate.queued > 0 {
            return None;
        }
        gate.sealed = true;
        Some(then())
    }

    /// Returns true once the queue refuses new jobs.
    pub fn is_sealed(&self) -> bool {
        self.state.gate.lock().sealed
    }

    /// Number of jobs waiting behind the running one.
    pub fn backlog(&self) -> usize {
        self.state.gate.lock().queued
    }

    /// Cancels every job that has not started yet.
    ///
    /// Jobs submitted after this call run normally.
    pub fn cancel_all(&self) {
        self.state.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Cancels the backlog, refuses further submissions, and queues `last`
    /// as the final job. The worker exits once `last` has run.
    ///
    /// Returns `false` if the queue was already shut down.
    pub fn shutdown(&self, last: J) -> bool {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel_all();
        let mut gate = self.state.gate.lock();
        let generation = self.state.generation.load(Ordering::Acquire);
        let sent = self
            .sender
            .send(Envelope {
                generation,
                job: last,
                last: true,
            })
            .is_ok();
        if sent {
            gate.queued += 1;
        }
        sent
    }

    /// Returns true once the queue was sealed or shut down.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire) || self.is_sealed() || self.sender.is_closed()
    }
}

/// Consumer side of a session queue, before it is bound to a [`Lane`].
pub struct SessionQueue<J> {
    receiver: mpsc::UnboundedReceiver<Envelope<J>>,
    state: Arc<QueueState>,
}

impl<J: Send + 'static> SessionQueue<J> {
    /// Creates an idle queue and its producer handle.
    pub fn new() -> (Self, QueueHandle<J>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(QueueState::default());
        let queue = Self {
            receiver,
            state: Arc::clone(&state),
        };
        (queue, QueueHandle { sender, state })
    }

    /// Spawns the worker task that drains this queue into `lane`.
    pub fn spawn<L>(self, lane: L, span: Span) -> JoinHandle<()>
    where
        L: Lane<Job = J>,
    {
        tokio::spawn(self.drain(lane).instrument(span))
    }

    async fn drain<L>(mut self, mut lane: L)
    where
        L: Lane<Job = J>,
    {
        while let Some(envelope) = self.receiver.recv().await {
            {
                let mut gate = self.state.gate.lock();
                gate.queued = gate.queued.saturating_sub(1);
            }

            if !envelope.last {
                if self.state.closed.load(Ordering::Acquire) {
                    debug!("Dropping job submitted to a closing lane");
                    continue;
                }
                if envelope.generation < self.state.generation.load(Ordering::Acquire) {
                    debug!(generation = envelope.generation, "Skipping cancelled job");
                    continue;
                }
            }

            let outcome = AssertUnwindSafe(lane.run(envelope.job))
                .catch_unwind()
                .await;

            if let Err(panic) = outcome {
                let detail = panic_detail(panic.as_ref());
                error!(detail = %detail, "Session job panicked");
                lane.on_fault(&detail);
            }

            if envelope.last {
                break;
            }
        }

        debug!("Session lane stopped");
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_detail(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
