//! Blocking-style bridge over asynchronous operations.
//!
//! `SyncBridge::open` runs an operation body on its own task and suspends
//! the caller until the body closes its [`Completion`] or the timeout
//! elapses. Called from a session lane, this parks only that lane: other
//! sessions and the intake path keep running.
//!
//! A timed-out body is not cancelled. It keeps its `Completion` and may
//! close it later; that late close is a no-op.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_core::BridgeConfig;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Outcome of a bridged call that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError<E> {
    /// Nothing closed the completion handle in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The body dropped its completion handle without closing it.
    #[error("operation abandoned without a result")]
    Abandoned,

    /// The body closed the completion handle with an error.
    #[error("operation failed: {0}")]
    Failed(E),
}

impl<E> BridgeError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Single-fire completion handle given to a bridged body.
///
/// Clones share the same slot: whichever clone closes first wins, every
/// later close returns `false`.
pub struct Completion<T, E> {
    slot: Arc<Mutex<Option<oneshot::Sender<Result<T, E>>>>>,
}

impl<T, E> Clone for Completion<T, E> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T, E> Completion<T, E> {
    fn new(sender: oneshot::Sender<Result<T, E>>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(sender))),
        }
    }

    /// Resolves the bridged call.
    ///
    /// Returns `true` only if this close delivered the result to a caller
    /// that was still waiting.
    pub fn close(&self, result: Result<T, E>) -> bool {
        match self.slot.lock().take() {
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        }
    }

    pub fn succeed(&self, value: T) -> bool {
        self.close(Ok(value))
    }

    pub fn fail(&self, error: E) -> bool {
        self.close(Err(error))
    }

    /// Returns true once the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.slot.lock().is_none()
    }
}

/// Timeout and retry policy for bridged calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncBridge {
    timeout: Duration,
    attempts: u32,
}

impl SyncBridge {
    pub fn new(timeout: Duration, attempts: u32) -> Self {
        Self {
            timeout,
            attempts: attempts.max(1),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.timeout(), config.attempts)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Runs `body` on a separate task and waits for its result.
    pub async fn open<T, E, F, Fut>(&self, body: F) -> Result<T, BridgeError<E>>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce(Completion<T, E>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        tokio::spawn(body(Completion::new(sender)));

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(BridgeError::Failed(error)),
            Ok(Err(_)) => Err(BridgeError::Abandoned),
            Err(_) => Err(BridgeError::Timeout(self.timeout)),
        }
    }

    /// Like [`open`](Self::open), resubmitting a fresh body after each
    /// timeout until the attempt budget is spent. Errors produced by the
    /// body itself are returned immediately.
    pub async fn open_with_retry<T, E, F, Fut>(&self, mut make_body: F) -> Result<T, BridgeError<E>>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnMut(Completion<T, E>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut attempt = 1;
        loop {
            match self.open(&mut make_body).await {
                Err(BridgeError::Timeout(waited)) if attempt < self.attempts => {
                    debug!(
                        attempt,
                        attempts = self.attempts,
                        waited_ms = waited.as_millis() as u64,
                        "Bridged call timed out, retrying"
                    );
                    attempt += 1;
                }
                Err(BridgeError::Timeout(waited)) => {
                    warn!(
                        attempts = self.attempts,
                        waited_ms = waited.as_millis() as u64,
                        "Bridged call timed out on every attempt"
                    );
                    return Err(BridgeError::Timeout(waited));
                }
                other => return other,
            }
        }
    }
}

impl Default for SyncBridge {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_open_returns_value() {
        let bridge = SyncBridge::new(Duration::from_secs(1), 1);
        let result: Result<u32, BridgeError<String>> = bridge
            .open(|done| async move {
                done.succeed(7);
            })
            .await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_body_error_is_distinct_from_timeout() {
        let bridge = SyncBridge::new(Duration::from_secs(1), 3);
        let result: Result<u32, BridgeError<String>> = bridge
            .open(|done| async move {
                done.fail("bad request".to_string());
            })
            .await;
        let err = result.unwrap_err();
        assert!(!err.is_timeout());
        assert_eq!(err, BridgeError::Failed("bad request".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_caller_and_late_close_is_noop() {
        let bridge = SyncBridge::new(Duration::from_millis(100), 1);
        let late = Arc::new(Mutex::new(None));
        let late_slot = Arc::clone(&late);

        let result: Result<u32, BridgeError<String>> = bridge
            .open(move |done| async move {
                *late_slot.lock() = Some(done);
            })
            .await;
        assert_eq!(result, Err(BridgeError::Timeout(Duration::from_millis(100))));

        let done = late.lock().take().unwrap();
        assert!(!done.succeed(1));
        assert!(done.is_closed());
        assert!(!done.succeed(2));
    }

    #[tokio::test]
    async fn test_dropped_handle_is_abandoned() {
        let bridge = SyncBridge::new(Duration::from_secs(1), 1);
        let result: Result<u32, BridgeError<String>> =
            bridge.open(|done| async move { drop(done) }).await;
        assert_eq!(result, Err(BridgeError::Abandoned));
    }

    #[tokio::test]
    async fn test_double_close_keeps_first_result() {
        let bridge = SyncBridge::new(Duration::from_secs(1), 1);
        let result: Result<u32, BridgeError<String>> = bridge
            .open(|done| async move {
                let twin = done.clone();
                assert!(done.succeed(1));
                assert!(!twin.succeed(2));
            })
            .await;
        assert_eq!(result, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_only_on_timeout() {
        let bridge = SyncBridge::new(Duration::from_millis(50), 3);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result: Result<u32, BridgeError<String>> = bridge
            .open_with_retry(|done| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 3 {
                        done.succeed(n);
                    } else {
                        // Hold the handle past the timeout.
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        drop(done);
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let failures = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&failures);
        let result: Result<u32, BridgeError<String>> = bridge
            .open_with_retry(|done| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    done.fail("rejected".to_string());
                }
            })
            .await;
        assert_eq!(result, Err(BridgeError::Failed("rejected".to_string())));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_attempts() {
        let bridge = SyncBridge::new(Duration::from_millis(10), 2);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32, BridgeError<String>> = bridge
            .open_with_retry(|done| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    drop(done);
                }
            })
            .await;
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
