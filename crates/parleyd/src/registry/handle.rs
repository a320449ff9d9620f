//! Client interface for interacting with a `RegistryActor`.
//!
//! The `RegistryHandle` is a cheap-to-clone interface for sending commands
//! to the registry actor and subscribing to session lifecycle events.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use parley_core::{Event, Identifier, RegistryId};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::commands::{
    DispatchOutcome, RegistryCommand, RegistryError, RemovalReason, SessionEvent, SessionInfo,
};

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with one registry actor.
///
/// ```ignore
/// let outcome = chats.handle(event).await?;
/// if outcome.is_handled() { /* ... */ }
///
/// let mut rx = chats.subscribe();
/// while let Ok(event) = rx.recv().await {
///     // Created / Removed / Rejected
/// }
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    name: RegistryId,

    /// Command sender to the actor
    sender: mpsc::Sender<RegistryCommand>,

    /// Event broadcaster for subscribing to lifecycle events
    event_sender: broadcast::Sender<SessionEvent>,
}

impl RegistryHandle {
    pub fn new(
        name: RegistryId,
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            name,
            sender,
            event_sender,
        }
    }

    pub fn name(&self) -> &RegistryId {
        &self.name
    }

    /// Offers an event to this registry.
    ///
    /// # Errors
    ///
    /// `RegistryError::ChannelClosed` if the actor has shut down.
    pub async fn handle(&self, event: Event) -> Result<DispatchOutcome, RegistryError> {
        self.request(|respond_to| RegistryCommand::Dispatch {
            event: Box::new(event),
            respond_to,
        })
        .await
    }

    /// Creates an additional session for `identifier`, even if one exists.
    ///
    /// # Errors
    ///
    /// - `RegistryError::RegistryFull` if the registry is at capacity
    /// - `RegistryError::Blacklisted` if the identifier is blacklisted
    /// - `RegistryError::FactoryFailed` if building the handler panicked
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn open_session(
        &self,
        identifier: impl Into<Identifier>,
    ) -> Result<SessionInfo, RegistryError> {
        let identifier = identifier.into();
        self.request(|respond_to| RegistryCommand::OpenSession {
            identifier,
            respond_to,
        })
        .await?
    }

    /// Removes every session of `identifier`. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// `RegistryError::ChannelClosed` if the actor has shut down.
    pub async fn delete_sessions(
        &self,
        identifier: impl Into<Identifier>,
    ) -> Result<usize, RegistryError> {
        let identifier = identifier.into();
        self.request(|respond_to| RegistryCommand::DeleteSessions {
            identifier,
            reason: RemovalReason::Explicit,
            respond_to,
        })
        .await
    }

    /// All live sessions, ordered by creation.
    ///
    /// # Errors
    ///
    /// `RegistryError::ChannelClosed` if the actor has shut down.
    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, RegistryError> {
        self.request(|respond_to| RegistryCommand::Sessions { respond_to })
            .await
    }

    /// Number of live sessions.
    ///
    /// # Errors
    ///
    /// `RegistryError::ChannelClosed` if the actor has shut down.
    pub async fn session_count(&self) -> Result<usize, RegistryError> {
        Ok(self.sessions().await?.len())
    }

    /// Lifts a blacklist entry. Returns `true` if the identifier was listed.
    ///
    /// # Errors
    ///
    /// `RegistryError::ChannelClosed` if the actor has shut down.
    pub async fn unblacklist(&self, identifier: impl Into<Identifier>) -> Result<bool, RegistryError> {
        let identifier = identifier.into();
        self.request(|respond_to| RegistryCommand::Unblacklist {
            identifier,
            respond_to,
        })
        .await
    }

    /// Removes every session, waits for their close hooks (bounded) and
    /// stops the actor. Returns how many sessions were removed.
    ///
    /// # Errors
    ///
    /// `RegistryError::ChannelClosed` if the actor had already stopped.
    pub async fn shutdown(&self) -> Result<usize, RegistryError> {
        self.request(|respond_to| RegistryCommand::Shutdown { respond_to })
            .await
    }

    /// Subscribe to session lifecycle events.
    ///
    /// This is a synchronous operation - it doesn't communicate with the actor.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_sender.subscribe()
    }

    /// Returns `true` while the command channel is open.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_handle() -> (RegistryHandle, mpsc::Receiver<RegistryCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, _event_rx) = broadcast::channel(16);
        let handle = RegistryHandle::new(RegistryId::new("chats"), cmd_tx, event_tx);
        (handle, cmd_rx)
    }

    #[tokio::test]
    async fn test_handle_sends_dispatch() {
        let (handle, mut rx) = create_test_handle();

        let actor = tokio::spawn(async move {
            if let Some(RegistryCommand::Dispatch { event, respond_to }) = rx.recv().await {
                assert_eq!(event.text(), "hi");
                let _ = respond_to.send(DispatchOutcome::NotInterested);
                return true;
            }
            false
        });

        let outcome = handle.handle(Event::message(1, 1, "hi")).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::NotInterested);
        assert!(actor.await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_uses_explicit_reason() {
        let (handle, mut rx) = create_test_handle();

        let actor = tokio::spawn(async move {
            if let Some(RegistryCommand::DeleteSessions {
                identifier,
                reason,
                respond_to,
            }) = rx.recv().await
            {
                assert_eq!(identifier, Identifier::Text("room".into()));
                assert_eq!(reason, RemovalReason::Explicit);
                let _ = respond_to.send(3);
            }
        });

        assert_eq!(handle.delete_sessions("room").await.unwrap(), 3);
        actor.await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_closed_error() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        let result = handle.handle(Event::message(1, 1, "hi")).await;
        assert_eq!(result, Err(RegistryError::ChannelClosed));
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_dropped_reply_is_channel_closed() {
        let (handle, mut rx) = create_test_handle();

        tokio::spawn(async move {
            // Receive and drop the command without replying.
            let _ = rx.recv().await;
        });

        let result = handle.sessions().await;
        assert!(matches!(result, Err(RegistryError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_is_connected() {
        let (handle, rx) = create_test_handle();
        assert!(handle.is_connected());
        assert_eq!(handle.name().as_str(), "chats");
        drop(rx);
        assert!(!handle.is_connected());
    }
}
