//! Engine configuration values.
//!
//! Plain numeric/enumerated settings consumed by the engine. Every struct
//! deserializes with defaults for missing fields, so a config file only
//! needs to mention what it overrides.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::event::EventKind;

/// Default scheduler tick cadence in milliseconds.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 100;

/// Default slack applied when deciding whether a scheduled event is due.
pub const DEFAULT_FLUCTUATION_TOLERANCE_MS: u64 = 100;

/// Default timeout for one bridged outbound call.
pub const DEFAULT_BRIDGE_TIMEOUT_MS: u64 = 10_000;

/// Default number of attempts for a bridged call that times out.
pub const DEFAULT_BRIDGE_ATTEMPTS: u32 = 3;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub bridge: BridgeConfig,
    /// Per-registry settings, matched by registry name.
    #[serde(rename = "registry")]
    pub registries: Vec<RegistryConfig>,
}

impl EngineConfig {
    /// Finds the settings for a registry by name.
    pub fn registry(&self, name: &str) -> Option<&RegistryConfig> {
        self.registries.iter().find(|r| r.name == name)
    }
}

/// Scheduler tick settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the tick loop polls for due events.
    pub tick_interval_ms: u64,
    /// Events due within this much of "now" fire on the current tick.
    pub fluctuation_tolerance_ms: u64,
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn fluctuation_tolerance(&self) -> Duration {
        Duration::from_millis(self.fluctuation_tolerance_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            fluctuation_tolerance_ms: DEFAULT_FLUCTUATION_TOLERANCE_MS,
        }
    }
}

/// Settings for blocking-style outbound calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub timeout_ms: u64,
    /// Total attempts, including the first. Only timeouts are retried.
    pub attempts: u32,
}

impl BridgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_BRIDGE_TIMEOUT_MS,
            attempts: DEFAULT_BRIDGE_ATTEMPTS,
        }
    }
}

/// Settings for one session registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub name: String,

    /// Maximum live sessions; 0 means unlimited.
    pub capacity: usize,

    /// Idle eviction delay in seconds; 0 disables the idle timeout.
    pub idle_timeout_secs: u64,

    /// Event kinds that count as activity for the idle timeout. An empty list
    /// counts every kind.
    pub idle_event_kinds: Vec<EventKind>,

    /// Flood monitors installed on every session of this registry.
    pub flood: Vec<FloodRule>,
}

impl RegistryConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Returns the idle timeout, or `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            capacity: 0,
            idle_timeout_secs: 0,
            idle_event_kinds: EventKind::ALL.to_vec(),
            flood: Vec::new(),
        }
    }
}

/// One fixed-window flood limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloodRule {
    pub event_kinds: Vec<EventKind>,
    /// Hits within one window that trip the monitor.
    pub threshold: u32,
    pub window_secs: u64,
    #[serde(default)]
    pub action: FloodAction,
}

impl FloodRule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// What happens when a flood monitor trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloodAction {
    /// Only notify the session's handler.
    #[default]
    Notify,
    /// Notify, then close the session.
    Close,
    /// Notify, then close the session and ignore its identifier.
    Blacklist,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.scheduler.tick_interval(), Duration::from_millis(100));
        assert_eq!(
            config.scheduler.fluctuation_tolerance(),
            Duration::from_millis(100)
        );
        assert_eq!(config.bridge.attempts, DEFAULT_BRIDGE_ATTEMPTS);
        assert!(config.registries.is_empty());
    }

    #[test]
    fn test_idle_timeout_disabled_at_zero() {
        let registry = RegistryConfig::new("chats");
        assert_eq!(registry.idle_timeout(), None);

        let registry = RegistryConfig {
            idle_timeout_secs: 30,
            ..RegistryConfig::new("chats")
        };
        assert_eq!(registry.idle_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_from_toml() {
        let raw = r#"
            [scheduler]
            tick_interval_ms = 50

            [[registry]]
            name = "chats"
            capacity = 500
            idle_timeout_secs = 600

            [[registry.flood]]
            event_kinds = ["message", "callback_query"]
            threshold = 10
            window_secs = 5
            action = "close"
        "#;

        let config: EngineConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.scheduler.tick_interval_ms, 50);
        assert_eq!(
            config.scheduler.fluctuation_tolerance_ms,
            DEFAULT_FLUCTUATION_TOLERANCE_MS
        );

        let chats = config.registry("chats").unwrap();
        assert_eq!(chats.capacity, 500);
        assert_eq!(chats.idle_event_kinds.len(), EventKind::ALL.len());
        assert_eq!(chats.flood.len(), 1);
        assert_eq!(chats.flood[0].action, FloodAction::Close);
        assert_eq!(chats.flood[0].window(), Duration::from_secs(5));
        assert!(config.registry("users").is_none());
    }
}
