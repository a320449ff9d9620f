//! Registry construction.

use std::sync::Arc;
use std::time::Duration;

use parley_core::{Event, EventKind, FloodRule, Identifier, RegistryConfig, RegistryId, SessionKind};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::bridge::SyncBridge;
use crate::outbox::Outbox;
use crate::scheduler::Scheduler;
use crate::session::SessionHandler;

use super::actor::{Classifier, Factory, RegistryActor, RegistrySettings};
use super::commands::RegistryError;
use super::handle::RegistryHandle;
use super::{COMMAND_BUFFER, EVENT_BUFFER};

/// Describes one registry before its actor is spawned.
///
/// ```ignore
/// let chats = RegistryBuilder::<ChatBot>::new("chats")
///     .capacity(1_000)
///     .idle_timeout(Duration::from_secs(600))
///     .spawn(scheduler.clone(), outbox.clone())?;
/// ```
pub struct RegistryBuilder<H: SessionHandler> {
    name: RegistryId,
    kind: SessionKind,
    classify: Option<Classifier>,
    factory: Factory<H>,
    capacity: usize,
    idle: Option<Duration>,
    idle_kinds: Vec<EventKind>,
    flood: Vec<FloodRule>,
    bridge: Option<SyncBridge>,
}

impl<H: SessionHandler + Default> RegistryBuilder<H> {
    /// Builds sessions with `H::default()`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_factory(name, H::default)
    }
}

impl<H: SessionHandler> RegistryBuilder<H> {
    /// Builds sessions with `factory`.
    pub fn with_factory<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
    {
        Self {
            name: RegistryId::new(name),
            kind: SessionKind::default(),
            classify: None,
            factory: Arc::new(factory),
            capacity: 0,
            idle: None,
            idle_kinds: EventKind::ALL.to_vec(),
            flood: Vec::new(),
            bridge: None,
        }
    }

    pub fn name(&self) -> &RegistryId {
        &self.name
    }

    /// Sets what sessions are keyed on. `Chat`, `User` and `Query` come
    /// with a default classifier; `Custom` needs [`RegistryBuilder::classify`].
    pub fn kind(mut self, kind: SessionKind) -> Self {
        self.kind = kind;
        self
    }

    /// Overrides how events map to identifiers. Returning `None` means the
    /// registry is not interested in the event.
    pub fn classify<F>(mut self, classify: F) -> Self
    where
        F: Fn(&Event) -> Option<Identifier> + Send + Sync + 'static,
    {
        self.classify = Some(Arc::new(classify));
        self
    }

    /// Maximum live sessions; 0 means unlimited.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Removes sessions that saw no watched event for `idle`.
    pub fn idle_timeout(mut self, idle: Duration) -> Self {
        self.idle = Some(idle);
        self
    }

    /// Event kinds that count as activity. Defaults to every kind.
    pub fn idle_kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.idle_kinds = kinds.into_iter().collect();
        self
    }

    pub fn flood(mut self, rule: FloodRule) -> Self {
        self.flood.push(rule);
        self
    }

    pub fn bridge(mut self, bridge: SyncBridge) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn has_bridge(&self) -> bool {
        self.bridge.is_some()
    }

    /// Applies file settings on top of what was set in code.
    ///
    /// Non-zero capacity and idle timeout replace the builder's values;
    /// flood rules are appended.
    pub fn apply_config(mut self, config: &RegistryConfig) -> Self {
        if config.capacity > 0 {
            self.capacity = config.capacity;
        }
        if let Some(idle) = config.idle_timeout() {
            self.idle = Some(idle);
            self.idle_kinds = config.idle_event_kinds.clone();
        }
        self.flood.extend(config.flood.iter().cloned());
        self
    }

    /// Spawns the registry actor.
    ///
    /// # Errors
    ///
    /// `RegistryError::MissingClassifier` if the session kind has no default
    /// classifier and none was given.
    pub fn spawn(
        self,
        scheduler: Scheduler,
        outbox: Arc<dyn Outbox>,
    ) -> Result<RegistryHandle, RegistryError> {
        let classify = match self.classify {
            Some(classify) => classify,
            None => default_classifier(&self.kind)
                .ok_or_else(|| RegistryError::MissingClassifier(self.name.to_string()))?,
        };

        let settings = RegistrySettings {
            name: self.name.clone(),
            kind: self.kind,
            classify,
            factory: self.factory,
            capacity: self.capacity,
            idle: self.idle.map(|idle| (idle, self.idle_kinds)),
            flood: self.flood,
            bridge: self.bridge.unwrap_or_default(),
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

        let actor = RegistryActor::new(settings, cmd_rx, event_tx.clone(), scheduler, outbox);
        tokio::spawn(actor.run());
        debug!(registry = %self.name, "Registry actor spawned");

        Ok(RegistryHandle::new(self.name, cmd_tx, event_tx))
    }
}

/// Picks the event field matching a session kind.
fn default_classifier(kind: &SessionKind) -> Option<Classifier> {
    let classify: Classifier = match kind {
        SessionKind::Chat => Arc::new(|event: &Event| event.chat_id.map(Identifier::Int)),
        SessionKind::User => Arc::new(|event: &Event| event.user_id.map(Identifier::Int)),
        SessionKind::Query => {
            Arc::new(|event: &Event| event.query_id.clone().map(Identifier::Text))
        }
        SessionKind::Custom(_) => return None,
    };
    Some(classify)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::NullOutbox;
    use crate::routes::RouteTree;
    use parley_core::FloodAction;

    #[derive(Default)]
    struct Quiet;

    impl SessionHandler for Quiet {
        fn routes(&self) -> RouteTree<Self> {
            RouteTree::new()
        }
    }

    #[test]
    fn test_default_classifiers() {
        let event = Event::callback_query("q-1", 7, 9, "data");

        let chat = default_classifier(&SessionKind::Chat).unwrap();
        let user = default_classifier(&SessionKind::User).unwrap();
        let query = default_classifier(&SessionKind::Query).unwrap();

        assert_eq!(chat(&event), Some(Identifier::Int(7)));
        assert_eq!(user(&event), Some(Identifier::Int(9)));
        assert_eq!(query(&event), Some(Identifier::Text("q-1".into())));
        assert!(default_classifier(&SessionKind::Custom("rooms".into())).is_none());
    }

    #[tokio::test]
    async fn test_custom_kind_needs_classifier() {
        let result = RegistryBuilder::<Quiet>::new("rooms")
            .kind(SessionKind::Custom("rooms".into()))
            .spawn(Scheduler::default(), Arc::new(NullOutbox));
        assert!(matches!(result, Err(RegistryError::MissingClassifier(name)) if name == "rooms"));

        let result = RegistryBuilder::<Quiet>::new("rooms")
            .kind(SessionKind::Custom("rooms".into()))
            .classify(|event| event.text.clone().map(Identifier::Text))
            .spawn(Scheduler::default(), Arc::new(NullOutbox));
        assert!(result.is_ok());
    }

    #[test]
    fn test_apply_config_overrides() {
        let config = RegistryConfig {
            capacity: 10,
            idle_timeout_secs: 60,
            idle_event_kinds: vec![EventKind::Message],
            flood: vec![FloodRule {
                event_kinds: vec![EventKind::Message],
                threshold: 5,
                window_secs: 1,
                action: FloodAction::Close,
            }],
            ..RegistryConfig::new("chats")
        };

        let builder = RegistryBuilder::<Quiet>::new("chats")
            .capacity(3)
            .apply_config(&config);
        assert_eq!(builder.capacity, 10);
        assert_eq!(builder.idle, Some(Duration::from_secs(60)));
        assert_eq!(builder.idle_kinds, vec![EventKind::Message]);
        assert_eq!(builder.flood.len(), 1);
        assert!(!builder.has_bridge());

        // Zero values in the file keep what code set.
        let builder = RegistryBuilder::<Quiet>::new("chats")
            .capacity(3)
            .apply_config(&RegistryConfig::new("chats"));
        assert_eq!(builder.capacity, 3);
        assert_eq!(builder.idle, None);
    }
}
