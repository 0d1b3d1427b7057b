//! Task: one named component instance and its lifecycle.
//!
//! ```text
//! Created ──open──▶ Opened ──start──▶ Running ──stop──▶ Stopping ──▶ Closed
//!    └──────────────────┴──────────────────┴───────────────┴──────▶ Failed
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use athena_types::{AthenaError, Properties, PropertyDescriptor, PropertyKind, Result};

use crate::checkpoint::CheckpointStore;
use crate::component::{ComponentContext, EmitNext, Role, RoleKind};
use crate::events::{EventEmitter, RuntimeEvent};

/// Property every component section carries: the registry type name.
pub const TYPE_PROPERTY: &str = "type";
/// Downstream selectors of producing tasks.
pub const OUTPUTS_PROPERTY: &str = "outputs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Opened,
    Running,
    Stopping,
    Closed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Closed | TaskState::Failed)
    }

    /// Legal forward transitions. `Failed` is reachable from any non-terminal state.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Created, Opened) | (Opened, Running) | (Running, Stopping) | (Stopping, Closed) => {
                true
            }
            // A task opened but never started is stopped during an aborted startup.
            (Opened, Stopping) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Created => "created",
            TaskState::Opened => "opened",
            TaskState::Running => "running",
            TaskState::Stopping => "stopping",
            TaskState::Closed => "closed",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Shared failure and exhaustion bookkeeping for one pipeline run.
///
/// The first fatal error wins and cancels the root token; the last source
/// to finish cancels it too.
#[derive(Clone)]
pub(crate) struct Supervisor {
    root: CancellationToken,
    first_error: Arc<Mutex<Option<AthenaError>>>,
    live_sources: Arc<AtomicUsize>,
    events: EventEmitter,
}

impl Supervisor {
    pub(crate) fn new(root: CancellationToken, sources: usize, events: EventEmitter) -> Self {
        Self {
            root,
            first_error: Arc::new(Mutex::new(None)),
            live_sources: Arc::new(AtomicUsize::new(sources)),
            events,
        }
    }

    /// Record `err` if it is the first, and cancel the pipeline.
    pub(crate) fn fail(&self, task: &str, err: AthenaError) {
        error!(task, error = %err, "Task failed, shutting down pipeline");
        self.events.emit(RuntimeEvent::TaskFailed {
            task: task.to_string(),
            error: err.to_string(),
        });
        self.record(err);
        self.root.cancel();
    }

    /// Keep `err` as the run's result if none was recorded yet.
    pub(crate) fn record(&self, err: AthenaError) {
        let mut slot = self
            .first_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.first_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    pub(crate) fn take_error(&self) -> Option<AthenaError> {
        self.first_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn source_exhausted(&self, task: &str) {
        info!(task, "Source exhausted");
        self.events.emit(RuntimeEvent::SourceExhausted {
            task: task.to_string(),
        });
        if self.live_sources.fetch_sub(1, Ordering::AcqRel) == 1 {
            info!("All sources exhausted, shutting down pipeline");
            self.root.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

pub struct Task {
    name: String,
    role: Role,
    ctx: ComponentContext,
    state: TaskState,
    emit_next: Option<EmitNext>,
    handle: Option<JoinHandle<Result<()>>>,
    events: EventEmitter,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        role: Role,
        properties: Properties,
        global: Properties,
        root: &CancellationToken,
        events: EventEmitter,
    ) -> Self {
        let name = name.into();
        let ctx = ComponentContext::new(name.clone(), properties, global, root.child_token());
        Self {
            name,
            role,
            ctx,
            state: TaskState::Created,
            emit_next: None,
            handle: None,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RoleKind {
        self.role.kind()
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn context(&self) -> &ComponentContext {
        &self.ctx
    }

    /// Framework keys checked for every task on top of the component's own.
    fn framework_definitions(&self) -> Vec<PropertyDescriptor> {
        let mut defs = vec![PropertyDescriptor::required(
            TYPE_PROPERTY,
            "Registered component type",
            PropertyKind::String,
        )];
        if self.role.kind() != RoleKind::Sink && self.role.emit_configurator().is_none() {
            defs.push(PropertyDescriptor::required(
                OUTPUTS_PROPERTY,
                "Regular expressions selecting downstream tasks",
                PropertyKind::StringList,
            ));
        }
        defs
    }

    /// Validate and default this task's properties. Runs while `Created`.
    pub fn prepare(&mut self) -> Result<()> {
        let mut defs = self.framework_definitions();
        defs.extend(self.role.property_definition());
        let rendered = self.ctx.properties_mut().init(&defs).map_err(|e| {
            AthenaError::Configuration(format!("task '{}': {e}", self.name))
        })?;
        info!(task = %self.name, "Properties\n{rendered}");
        Ok(())
    }

    /// Selectors from `outputs`, for tasks that route by selector.
    pub fn selectors(&self) -> Result<Vec<String>> {
        let def = PropertyDescriptor::required(
            OUTPUTS_PROPERTY,
            "Regular expressions selecting downstream tasks",
            PropertyKind::StringList,
        );
        self.ctx.properties().string_list(&def)
    }

    pub fn set_emit_next(&mut self, next: EmitNext) {
        self.emit_next = Some(next);
    }

    fn transition(&mut self, to: TaskState) {
        let from = self.state;
        if !from.can_transition_to(to) {
            warn!(task = %self.name, %from, %to, "Ignoring illegal state transition");
            return;
        }
        debug!(task = %self.name, %from, %to, "Task state changed");
        self.state = to;
        self.events.emit(RuntimeEvent::TaskStateChanged {
            task: self.name.clone(),
            from,
            to,
        });
    }

    pub async fn open(&mut self) -> Result<()> {
        if self.state != TaskState::Created {
            return Err(AthenaError::component(&self.name, "open", format!("task is {}", self.state)));
        }
        match self.role.open(self.ctx.clone()).await {
            Ok(()) => {
                self.transition(TaskState::Opened);
                Ok(())
            }
            Err(e) => {
                self.transition(TaskState::Failed);
                Err(as_component_error(&self.name, "open", e))
            }
        }
    }

    /// Restore from checkpoint, then spawn the blocking entry point.
    pub(crate) async fn start(
        &mut self,
        store: &CheckpointStore,
        supervisor: &Supervisor,
    ) -> Result<()> {
        if self.state != TaskState::Opened {
            return Err(AthenaError::component(&self.name, "start", format!("task is {}", self.state)));
        }
        self.restore(store).await;

        let next = match self.role.kind() {
            RoleKind::Sink => None,
            _ => Some(self.emit_next.clone().ok_or_else(|| AthenaError::NoDownstream {
                task: self.name.clone(),
            })?),
        };

        let role = self.role.clone();
        let token = self.ctx.token().clone();
        let name = self.name.clone();
        let span = info_span!("task", task = %self.name, role = %self.role.kind());
        let inner = tokio::spawn(
            async move {
                match (role, next) {
                    (Role::Source(c), Some(next)) => c.collect(next).await,
                    (Role::Operator(c), Some(next)) => c.collect(next).await,
                    _ => {
                        token.cancelled().await;
                        Ok(())
                    }
                }
            }
            .instrument(span),
        );

        let kind = self.role.kind();
        let supervisor = supervisor.clone();
        let token = self.ctx.token().clone();
        self.handle = Some(tokio::spawn(async move {
            let outcome = match inner.await {
                Ok(result) => result.map_err(|e| as_component_error(&name, "collect", e)),
                Err(join) => Err(AthenaError::component(&name, "collect", join)),
            };
            match outcome {
                Err(e) => {
                    // The supervisor keeps the original; stop() only needs to know it failed.
                    let message = e.to_string();
                    supervisor.fail(&name, e);
                    Err(AthenaError::Other(message))
                }
                Ok(()) => {
                    if kind == RoleKind::Source && !token.is_cancelled() {
                        supervisor.source_exhausted(&name);
                    }
                    Ok(())
                }
            }
        }));

        self.transition(TaskState::Running);
        info!(task = %self.name, "Task started");
        Ok(())
    }

    async fn restore(&self, store: &CheckpointStore) {
        let Some(stateful) = self.role.stateful() else {
            return;
        };
        let snapshot = match store.load(&self.name).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(task = %self.name, "No checkpoint, starting cold");
                return;
            }
            Err(e) => {
                warn!(task = %self.name, error = %e, "Checkpoint unreadable, starting cold");
                self.events.emit(RuntimeEvent::CheckpointSkipped {
                    task: self.name.clone(),
                    reason: e.to_string(),
                });
                return;
            }
        };
        let bytes = snapshot.len();
        match stateful.restore(snapshot).await {
            Ok(()) => {
                info!(task = %self.name, bytes, "Checkpoint restored");
                self.events.emit(RuntimeEvent::CheckpointRestored {
                    task: self.name.clone(),
                    bytes,
                });
            }
            Err(e) => {
                warn!(task = %self.name, error = %e, "Checkpoint rejected, starting cold");
                self.events.emit(RuntimeEvent::CheckpointSkipped {
                    task: self.name.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn checkpoint(&self, store: &CheckpointStore) {
        let Some(stateful) = self.role.stateful() else {
            return;
        };
        let result = match stateful.snapshot().await {
            Ok(snapshot) => store.save(&self.name, &snapshot).await.map(|_| snapshot.len()),
            Err(e) => Err(e),
        };
        match result {
            Ok(bytes) => {
                info!(task = %self.name, bytes, "Checkpoint saved");
                self.events.emit(RuntimeEvent::CheckpointSaved {
                    task: self.name.clone(),
                    bytes,
                });
            }
            Err(e) => error!(task = %self.name, error = %e, "Checkpoint not saved"),
        }
    }

    /// Cancel, wait for the entry point, close, then snapshot.
    ///
    /// Tasks that never ran are closed without snapshotting so a startup
    /// failure cannot overwrite a good checkpoint.
    pub async fn stop(&mut self, store: &CheckpointStore) -> Result<()> {
        let was_running = match self.state {
            TaskState::Running => true,
            TaskState::Opened => false,
            _ => return Ok(()),
        };
        self.transition(TaskState::Stopping);
        self.ctx.token().cancel();

        let mut outcome = Ok(());
        if let Some(handle) = self.handle.take() {
            outcome = match handle.await {
                Ok(result) => result,
                Err(join) => Err(AthenaError::component(&self.name, "collect", join)),
            };
        }
        // Run close on its own task so a panicking component is reported, not unwound.
        let role = self.role.clone();
        let closed = match tokio::spawn(async move { role.close().await }).await {
            Ok(result) => result,
            Err(join) => Err(AthenaError::component(&self.name, "close", join)),
        };
        if let Err(e) = closed {
            let e = as_component_error(&self.name, "close", e);
            error!(task = %self.name, error = %e, "Close failed");
            if outcome.is_ok() {
                outcome = Err(e);
            }
        }
        if was_running {
            self.checkpoint(store).await;
        }

        match outcome {
            Ok(()) => {
                self.transition(TaskState::Closed);
                info!(task = %self.name, "Task closed");
                Ok(())
            }
            Err(e) => {
                self.transition(TaskState::Failed);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("kind", &self.role.kind())
            .field("state", &self.state)
            .finish()
    }
}

/// Attribute a component's error to `task` unless it already names one.
fn as_component_error(task: &str, phase: &str, err: AthenaError) -> AthenaError {
    match err {
        e @ AthenaError::Component { .. } => e,
        e => AthenaError::component(task, phase, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions() {
        use TaskState::*;
        assert!(Created.can_transition_to(Opened));
        assert!(Opened.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Closed));
        assert!(Opened.can_transition_to(Stopping));
    }

    #[test]
    fn no_skipping_or_going_back() {
        use TaskState::*;
        assert!(!Created.can_transition_to(Running));
        assert!(!Running.can_transition_to(Opened));
        assert!(!Closed.can_transition_to(Opened));
        assert!(!Created.can_transition_to(Closed));
    }

    #[test]
    fn failed_from_any_live_state() {
        use TaskState::*;
        for s in [Created, Opened, Running, Stopping] {
            assert!(s.can_transition_to(Failed), "{s}");
        }
        assert!(!Closed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn component_errors_keep_their_origin() {
        let original = AthenaError::component("operator.a", "collect", "boom");
        let e = as_component_error("operator.b", "close", original);
        assert!(e.to_string().contains("operator.a"));

        let wrapped = as_component_error("sink.c", "open", AthenaError::Other("nope".into()));
        assert_eq!(
            wrapped.to_string(),
            "Component 'sink.c' failed during open: nope"
        );
    }

    #[test]
    fn supervisor_keeps_first_error() {
        let root = CancellationToken::new();
        let sup = Supervisor::new(root.clone(), 1, EventEmitter::default());
        sup.fail("a", AthenaError::Other("first".into()));
        sup.fail("b", AthenaError::Other("second".into()));
        assert!(root.is_cancelled());
        assert!(sup.has_failed());
        assert_eq!(sup.take_error().unwrap().to_string(), "first");
    }

    #[test]
    fn last_source_cancels_root() {
        let root = CancellationToken::new();
        let sup = Supervisor::new(root.clone(), 2, EventEmitter::default());
        sup.source_exhausted("source.a");
        assert!(!root.is_cancelled());
        sup.source_exhausted("source.b");
        assert!(root.is_cancelled());
        assert!(!sup.has_failed());
    }
}
