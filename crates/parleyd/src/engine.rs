//! Multi-registry fan-out.
//!
//! The engine owns the shared scheduler and its tick task, and offers each
//! inbound event to every registry in registration order. A failing
//! registry never stops the event from reaching the ones after it.

use std::fmt;
use std::sync::Arc;

use parley_core::{EngineConfig, Event, RegistryId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::SyncBridge;
use crate::outbox::{NullOutbox, Outbox};
use crate::registry::{DispatchOutcome, RegistryBuilder, RegistryError, RegistryHandle};
use crate::scheduler::{spawn_scheduler_task, Scheduler};
use crate::session::SessionHandler;

type Spawner = Box<
    dyn FnOnce(&EngineConfig, Scheduler, Arc<dyn Outbox>) -> Result<RegistryHandle, RegistryError>
        + Send,
>;

// ============================================================================
// Builder
// ============================================================================

/// Collects registries before anything is spawned.
pub struct EngineBuilder {
    config: EngineConfig,
    outbox: Option<Arc<dyn Outbox>>,
    registries: Vec<Spawner>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            outbox: None,
            registries: Vec::new(),
        }
    }

    /// Where sessions send outbound requests. Defaults to [`NullOutbox`].
    pub fn outbox(mut self, outbox: Arc<dyn Outbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Adds a registry. Registries see events in the order they are added.
    ///
    /// A `[[registry]]` config entry with the same name is applied on top
    /// of the builder, and the engine-wide bridge settings are used unless
    /// the builder set its own.
    pub fn registry<H: SessionHandler>(mut self, builder: RegistryBuilder<H>) -> Self {
        self.registries.push(Box::new(
            move |config: &EngineConfig, scheduler: Scheduler, outbox: Arc<dyn Outbox>| {
                let mut builder = builder;
                if let Some(file) = config.registry(builder.name().as_str()) {
                    builder = builder.apply_config(file);
                }
                if !builder.has_bridge() {
                    builder = builder.bridge(SyncBridge::from_config(&config.bridge));
                }
                builder.spawn(scheduler, outbox)
            },
        ));
        self
    }

    /// Spawns every registry and the scheduler tick task.
    ///
    /// Must be called inside a tokio runtime. The tick task stops when
    /// `cancel` fires or [`Engine::shutdown`] runs.
    ///
    /// # Errors
    ///
    /// The first registry that fails to spawn. Registries spawned before it
    /// stop on their own once their handles are dropped.
    pub fn start(self, cancel: CancellationToken) -> Result<Engine, RegistryError> {
        let scheduler = Scheduler::from_config(&self.config.scheduler);
        let outbox = self.outbox.unwrap_or_else(|| Arc::new(NullOutbox));

        let mut registries = Vec::with_capacity(self.registries.len());
        for spawn in self.registries {
            registries.push(spawn(&self.config, scheduler.clone(), Arc::clone(&outbox))?);
        }

        let tick_cancel = cancel.child_token();
        spawn_scheduler_task(
            scheduler.clone(),
            self.config.scheduler.tick_interval(),
            tick_cancel.clone(),
        );

        info!(
            registries = registries.len(),
            tick_ms = self.config.scheduler.tick_interval_ms,
            tolerance_ms = self.config.scheduler.fluctuation_tolerance_ms,
            "Engine started"
        );

        Ok(Engine {
            registries: Arc::new(registries),
            scheduler,
            tick_cancel,
        })
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Running engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    registries: Arc<Vec<RegistryHandle>>,
    scheduler: Scheduler,
    tick_cancel: CancellationToken,
}

impl Engine {
    /// Offers `event` to every registry in order.
    pub async fn dispatch(&self, event: Event) -> DispatchReport {
        let mut results = Vec::with_capacity(self.registries.len());

        for registry in self.registries.iter() {
            let outcome = registry.handle(event.clone()).await;
            match &outcome {
                Ok(DispatchOutcome::Faulted(detail)) => {
                    warn!(registry = %registry.name(), detail = %detail, "Registry faulted on event");
                }
                Err(e) => {
                    warn!(registry = %registry.name(), error = %e, "Registry unavailable");
                }
                Ok(_) => {}
            }
            results.push(RegistryResult {
                registry: registry.name().clone(),
                outcome,
            });
        }

        let report = DispatchReport { results };
        debug!(kind = %event.kind, handled_by = ?report.handled_by(), "Event dispatched");
        report
    }

    pub fn registry(&self, name: &str) -> Option<&RegistryHandle> {
        self.registries.iter().find(|r| r.name().as_str() == name)
    }

    pub fn registries(&self) -> &[RegistryHandle] {
        &self.registries
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Shuts every registry down and stops the tick task.
    ///
    /// Returns the total number of sessions removed. Registries that had
    /// already stopped are skipped.
    pub async fn shutdown(&self) -> usize {
        let mut removed = 0;
        for registry in self.registries.iter() {
            match registry.shutdown().await {
                Ok(n) => removed += n,
                Err(e) => {
                    debug!(registry = %registry.name(), error = %e, "Registry already stopped");
                }
            }
        }
        self.tick_cancel.cancel();
        info!(sessions_removed = removed, "Engine stopped");
        removed
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.registries.iter().map(|r| r.name().as_str()).collect();
        f.debug_struct("Engine")
            .field("registries", &names)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

// ============================================================================
// Dispatch report
// ============================================================================

/// What one registry did with one event.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryResult {
    pub registry: RegistryId,
    pub outcome: Result<DispatchOutcome, RegistryError>,
}

impl RegistryResult {
    pub fn is_handled(&self) -> bool {
        matches!(&self.outcome, Ok(outcome) if outcome.is_handled())
    }
}

/// Per-registry outcomes of one [`Engine::dispatch`], in registry order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DispatchReport {
    pub results: Vec<RegistryResult>,
}

impl DispatchReport {
    /// True if at least one registry queued the event on a session.
    pub fn handled(&self) -> bool {
        self.results.iter().any(RegistryResult::is_handled)
    }

    /// Names of the registries that queued the event.
    pub fn handled_by(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.is_handled())
            .map(|r| r.registry.to_string())
            .collect()
    }

    pub fn outcome(&self, registry: &str) -> Option<&Result<DispatchOutcome, RegistryError>> {
        self.results
            .iter()
            .find(|r| r.registry.as_str() == registry)
            .map(|r| &r.outcome)
    }
}
