//! Pipeline engine: builds tasks from configuration and drives their lifecycle.
//!
//! A run goes through five phases:
//!
//! 1. **Build**: instantiate every configured component, validate its
//!    properties, and resolve each producer's downstream. Any failure here
//!    aborts before a single task is opened.
//! 2. **Open**: sources, then operators, then sinks.
//! 3. **Start**: sinks, then operators, then sources, so consumers are ready
//!    before anything produces. Stateful tasks restore first.
//! 4. **Run**: until an OS signal, the first task failure, or exhaustion of
//!    every source.
//! 5. **Stop**: sources, then operators, then sinks. Each task is cancelled,
//!    drained, closed and checkpointed before the next one is touched, so
//!    final flushes reach consumers that are still open.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use athena_types::{AthenaError, Properties, PropertyDescriptor, PropertyKind, Result};

use crate::checkpoint::CheckpointStore;
use crate::component::{EmitFactory, RoleKind};
use crate::events::{EventEmitter, RuntimeEvent};
use crate::registry::ComponentRegistry;
use crate::router::DeliveryMode;
use crate::task::{Supervisor, Task, TaskState, TYPE_PROPERTY};
use crate::topology::{resolve_emit_next, Topology};

const ROLES: [RoleKind; 3] = [RoleKind::Source, RoleKind::Operator, RoleKind::Sink];

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

/// Global (non-component) settings of a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub mode: DeliveryMode,
    pub state_dir: PathBuf,
    pub log_level: String,
}

impl RuntimeConfig {
    pub fn definitions() -> Vec<PropertyDescriptor> {
        vec![
            PropertyDescriptor::optional(
                "mode",
                "Acknowledgment mode: 'ack' or 'snapshot'",
                PropertyKind::String,
                serde_json::json!("ack"),
            ),
            PropertyDescriptor::optional(
                "state-dir",
                "Directory holding per-task checkpoints",
                PropertyKind::String,
                serde_json::json!("state"),
            ),
            PropertyDescriptor::optional(
                "log-level",
                "Default log filter when RUST_LOG is unset",
                PropertyKind::String,
                serde_json::json!("info"),
            ),
        ]
    }

    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let mut global = properties.clone();
        let defs = Self::definitions();
        global.init(&defs)?;
        Ok(Self {
            mode: global.string(&defs[0])?.parse()?,
            state_dir: PathBuf::from(global.string(&defs[1])?),
            log_level: global.string(&defs[2])?,
        })
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::Ack,
            state_dir: PathBuf::from("state"),
            log_level: "info".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owns the registry and configuration; builds and runs pipelines.
pub struct Engine {
    registry: ComponentRegistry,
    properties: Properties,
    events: EventEmitter,
}

impl Engine {
    pub fn new(registry: ComponentRegistry, properties: Properties) -> Self {
        Self {
            registry,
            properties,
            events: EventEmitter::default(),
        }
    }

    /// Lifecycle events of every pipeline built by this engine.
    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn config(&self) -> Result<RuntimeConfig> {
        RuntimeConfig::from_properties(&self.properties)
    }

    /// Instantiate and wire every configured task without opening any.
    pub fn build(&self) -> Result<Pipeline> {
        let config = self.config()?;
        let root = CancellationToken::new();

        let mut tasks = Vec::new();
        for role in ROLES {
            let keys = self.properties.prefix_keys(role.prefix());
            if keys.is_empty() && role != RoleKind::Operator {
                return Err(AthenaError::Configuration(format!(
                    "pipeline needs at least one {role}"
                )));
            }
            for key in keys {
                tasks.push(self.build_task(role, &key, &root)?);
            }
        }

        let entrypoints: BTreeMap<String, EmitFactory> = tasks
            .iter()
            .filter_map(|t| t.role().emit_factory(t.name()).map(|f| (t.name().to_string(), f)))
            .collect();

        let mut topology = Topology::new();
        for task in tasks.iter_mut().filter(|t| t.kind() != RoleKind::Sink) {
            let next = match task.role().emit_configurator() {
                Some(configurator) => {
                    configurator.configure(task.context(), &entrypoints, &mut topology)?
                }
                None => resolve_emit_next(
                    task.name(),
                    &task.selectors()?,
                    &entrypoints,
                    config.mode,
                    &mut topology,
                )?,
            };
            task.set_emit_next(next);
        }

        let sources = tasks.iter().filter(|t| t.kind() == RoleKind::Source).count();
        let supervisor = Supervisor::new(root.clone(), sources, self.events.clone());
        Ok(Pipeline {
            run_id: Uuid::new_v4(),
            config,
            tasks,
            topology,
            root,
            supervisor,
            events: self.events.clone(),
        })
    }

    fn build_task(&self, role: RoleKind, key: &str, root: &CancellationToken) -> Result<Task> {
        let name = format!("{}.{key}", role.prefix());
        if key.is_empty() || key.contains(['/', '\\']) {
            return Err(AthenaError::Configuration(format!(
                "task name '{name}' must be non-empty and free of path separators"
            )));
        }
        let properties = self
            .properties
            .sub(role.prefix())
            .and_then(|section| section.sub(key))
            .ok_or_else(|| {
                AthenaError::Configuration(format!("section '{name}' must be a mapping"))
            })?;
        let type_name = properties
            .get(TYPE_PROPERTY)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                AthenaError::Configuration(format!("task '{name}' has no '{TYPE_PROPERTY}'"))
            })?;
        let component = self.registry.create(role, type_name)?;

        let mut task = Task::new(
            name,
            component,
            properties,
            self.properties.clone(),
            root,
            self.events.clone(),
        );
        task.prepare()?;
        Ok(task)
    }

    /// Build and run until an OS shutdown signal.
    pub async fn run(&self) -> Result<()> {
        self.build()?.run_until(shutdown_signal()).await
    }

    /// Build and run until `shutdown` resolves.
    pub async fn run_until<F: Future<Output = ()>>(&self, shutdown: F) -> Result<()> {
        self.build()?.run_until(shutdown).await
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A fully wired, not yet running set of tasks.
pub struct Pipeline {
    run_id: Uuid,
    config: RuntimeConfig,
    tasks: Vec<Task>,
    topology: Topology,
    root: CancellationToken,
    supervisor: Supervisor,
    events: EventEmitter,
}

impl Pipeline {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Task names in open order.
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(Task::name).collect()
    }

    pub fn task_state(&self, name: &str) -> Option<TaskState> {
        self.tasks.iter().find(|t| t.name() == name).map(Task::state)
    }

    /// Token that stops the pipeline when cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.root.clone()
    }

    pub async fn run_until<F: Future<Output = ()>>(mut self, shutdown: F) -> Result<()> {
        let span = info_span!("pipeline", run_id = %self.run_id);
        async move {
            let started = Instant::now();
            let store = CheckpointStore::new(&self.config.state_dir);
            info!(
                tasks = self.tasks.len(),
                mode = %self.config.mode,
                state_dir = %self.config.state_dir.display(),
                "Starting pipeline"
            );

            self.open_all().await;
            if !self.supervisor.has_failed() {
                self.start_all(&store).await;
            }

            if !self.supervisor.has_failed() {
                self.events.emit(RuntimeEvent::PipelineStarted {
                    run_id: self.run_id.to_string(),
                    task_count: self.tasks.len(),
                });
                info!("Pipeline running");
                tokio::select! {
                    _ = shutdown => info!("Shutdown requested"),
                    _ = self.root.cancelled() => {}
                }
            }
            self.root.cancel();

            for task in self.tasks.iter_mut() {
                if let Err(e) = task.stop(&store).await {
                    self.supervisor.record(e);
                }
            }

            match self.supervisor.take_error() {
                Some(e) => {
                    warn!(error = %e, "Pipeline failed");
                    self.events.emit(RuntimeEvent::PipelineFailed {
                        run_id: self.run_id.to_string(),
                        error: e.to_string(),
                    });
                    Err(e)
                }
                None => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    info!(duration_ms, "Pipeline stopped");
                    self.events.emit(RuntimeEvent::PipelineStopped {
                        run_id: self.run_id.to_string(),
                        duration_ms,
                    });
                    Ok(())
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn open_all(&mut self) {
        for task in self.tasks.iter_mut() {
            if let Err(e) = task.open().await {
                self.supervisor.fail(task.name(), e);
                return;
            }
        }
    }

    async fn start_all(&mut self, store: &CheckpointStore) {
        for task in self.tasks.iter_mut().rev() {
            if let Err(e) = task.start(store, &self.supervisor).await {
                self.supervisor.fail(task.name(), e);
                return;
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("run_id", &self.run_id)
            .field("config", &self.config)
            .field("tasks", &self.tasks)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Resolves on SIGHUP, SIGINT, SIGTERM or SIGQUIT (Ctrl-C elsewhere).
pub async fn shutdown_signal() {
    match wait_for_signal().await {
        Ok(name) => info!(signal = name, "Received shutdown signal"),
        Err(e) => {
            warn!(error = %e, "Signal handlers unavailable, waiting for Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    let name = tokio::select! {
        _ = hangup.recv() => "SIGHUP",
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_config_defaults() {
        let config = RuntimeConfig::from_properties(&Properties::new()).unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn runtime_config_reads_globals() {
        let props = Properties::from_value(serde_json::json!({
            "mode": "snapshot",
            "state-dir": "/var/lib/athena",
            "log-level": "debug",
        }))
        .unwrap();
        let config = RuntimeConfig::from_properties(&props).unwrap();
        assert_eq!(config.mode, DeliveryMode::Snapshot);
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/athena"));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn runtime_config_rejects_unknown_mode() {
        let props = Properties::from_value(serde_json::json!({"mode": "at-most-once"})).unwrap();
        assert!(RuntimeConfig::from_properties(&props)
            .unwrap_err()
            .is_configuration());
    }

    #[test]
    fn build_requires_a_source_and_a_sink() {
        let engine = Engine::new(ComponentRegistry::new(), Properties::new());
        let err = engine.build().unwrap_err();
        assert!(err.to_string().contains("at least one source"));
    }
}
