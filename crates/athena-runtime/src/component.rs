//! Component capability model: the contracts every pluggable unit implements.
//!
//! A component plays exactly one [`Role`]: a [`Source`] produces events, an
//! [`Operator`] consumes and produces, a [`Sink`] only consumes. On top of
//! its role a component may expose [`Stateful`] (checkpointing) and
//! [`EmitConfigurator`] (custom downstream routing) through the optional
//! accessors on [`Component`].

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use athena_types::{Event, Properties, PropertyDescriptor, Result};

use crate::topology::Topology;

// ---------------------------------------------------------------------------
// Emit: the ingress contract
// ---------------------------------------------------------------------------

/// Something events can be pushed into: a component's ingress, or a router
/// fanning out to several of them.
#[async_trait]
pub trait Emit: Send + Sync {
    async fn emit(&self, event: Event);
}

/// The resolved downstream delivery function of a producing task.
pub type EmitNext = Arc<dyn Emit>;

/// Produces an ingress entry point scoped to one upstream task.
#[derive(Clone)]
pub struct EmitFactory {
    target: String,
    build: Arc<dyn Fn(&str) -> Arc<dyn Emit> + Send + Sync>,
}

impl EmitFactory {
    pub fn new(
        target: impl Into<String>,
        build: impl Fn(&str) -> Arc<dyn Emit> + Send + Sync + 'static,
    ) -> Self {
        Self {
            target: target.into(),
            build: Arc::new(build),
        }
    }

    /// Name of the task this factory delivers into.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Build the entry point used by `upstream`.
    pub fn generate(&self, upstream: &str) -> Arc<dyn Emit> {
        (self.build)(upstream)
    }
}

impl std::fmt::Debug for EmitFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmitFactory")
            .field("target", &self.target)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// NextSlot: late-bound downstream for operators
// ---------------------------------------------------------------------------

/// Holds an operator's [`EmitNext`] once `collect` hands it over.
///
/// Upstream producers may call an operator's ingress before its `collect`
/// has been scheduled; [`get`](NextSlot::get) waits for the binding instead
/// of dropping the event.
#[derive(Default)]
pub struct NextSlot {
    slot: OnceLock<EmitNext>,
    ready: Notify,
}

impl NextSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the downstream. Later calls are ignored.
    pub fn set(&self, next: EmitNext) {
        if self.slot.set(next).is_ok() {
            self.ready.notify_waiters();
        }
    }

    pub fn try_get(&self) -> Option<EmitNext> {
        self.slot.get().cloned()
    }

    pub async fn get(&self) -> EmitNext {
        loop {
            let notified = self.ready.notified();
            if let Some(next) = self.slot.get() {
                return next.clone();
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentContext
// ---------------------------------------------------------------------------

/// Everything a component receives when it is opened: its topology name,
/// its scoped configuration, the global configuration, and its cancellation
/// scope (a child of the pipeline-wide token).
#[derive(Debug, Clone)]
pub struct ComponentContext {
    name: String,
    properties: Properties,
    global: Properties,
    cancel: CancellationToken,
}

impl ComponentContext {
    pub fn new(
        name: impl Into<String>,
        properties: Properties,
        global: Properties,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            properties,
            global,
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub(crate) fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    pub fn global(&self) -> &Properties {
        &self.global
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// The base contract shared by all roles.
///
/// All methods take `&self`: upstream tasks call an operator's or sink's
/// ingress concurrently with its own `collect`, so implementations keep
/// their mutable state behind their own synchronization.
#[async_trait]
pub trait Component: Send + Sync {
    /// Configuration keys this component recognizes.
    fn property_definition(&self) -> Vec<PropertyDescriptor> {
        Vec::new()
    }

    /// Called once with the validated, defaulted configuration.
    async fn open(&self, ctx: ComponentContext) -> Result<()>;

    /// Called once after the blocking entry point has returned.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn as_stateful(&self) -> Option<&dyn Stateful> {
        None
    }

    fn as_emit_configurator(&self) -> Option<&dyn EmitConfigurator> {
        None
    }
}

#[async_trait]
pub trait Source: Component {
    /// Block until cancelled or the input is exhausted, pushing every record
    /// into `next`. Returning `Ok` before cancellation means exhaustion.
    async fn collect(&self, next: EmitNext) -> Result<()>;
}

#[async_trait]
pub trait Operator: Component {
    /// Drive background work (timers, flushes) until cancelled.
    async fn collect(&self, next: EmitNext) -> Result<()>;

    /// Ingress used by the upstream task named `upstream`.
    fn generate_emit(self: Arc<Self>, upstream: &str) -> Arc<dyn Emit>;
}

pub trait Sink: Component {
    /// Ingress used by the upstream task named `upstream`.
    fn generate_emit(self: Arc<Self>, upstream: &str) -> Arc<dyn Emit>;
}

/// Opaque snapshot/restore of internal state across restarts.
///
/// `restore` must leave the component in its zero-value state when it fails,
/// e.g. by decoding fully before applying anything.
#[async_trait]
pub trait Stateful: Send + Sync {
    async fn snapshot(&self) -> Result<Bytes>;
    async fn restore(&self, snapshot: Bytes) -> Result<()>;
}

/// Supplies a component's own downstream routing instead of selector matching.
///
/// The implementation must record every edge it creates in `topology`.
pub trait EmitConfigurator: Send + Sync {
    fn configure(
        &self,
        ctx: &ComponentContext,
        entrypoints: &BTreeMap<String, EmitFactory>,
        topology: &mut Topology,
    ) -> Result<EmitNext>;
}

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    Source,
    Operator,
    Sink,
}

impl RoleKind {
    /// Configuration section prefix, also the first segment of task names.
    pub fn prefix(&self) -> &'static str {
        match self {
            RoleKind::Source => "source",
            RoleKind::Operator => "operator",
            RoleKind::Sink => "sink",
        }
    }
}

impl std::fmt::Display for RoleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A component instance tagged with the role it plays.
#[derive(Clone)]
pub enum Role {
    Source(Arc<dyn Source>),
    Operator(Arc<dyn Operator>),
    Sink(Arc<dyn Sink>),
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Source(_) => RoleKind::Source,
            Role::Operator(_) => RoleKind::Operator,
            Role::Sink(_) => RoleKind::Sink,
        }
    }

    pub fn property_definition(&self) -> Vec<PropertyDescriptor> {
        match self {
            Role::Source(c) => c.property_definition(),
            Role::Operator(c) => c.property_definition(),
            Role::Sink(c) => c.property_definition(),
        }
    }

    pub async fn open(&self, ctx: ComponentContext) -> Result<()> {
        match self {
            Role::Source(c) => c.open(ctx).await,
            Role::Operator(c) => c.open(ctx).await,
            Role::Sink(c) => c.open(ctx).await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            Role::Source(c) => c.close().await,
            Role::Operator(c) => c.close().await,
            Role::Sink(c) => c.close().await,
        }
    }

    pub fn stateful(&self) -> Option<&dyn Stateful> {
        match self {
            Role::Source(c) => c.as_stateful(),
            Role::Operator(c) => c.as_stateful(),
            Role::Sink(c) => c.as_stateful(),
        }
    }

    pub fn emit_configurator(&self) -> Option<&dyn EmitConfigurator> {
        match self {
            Role::Source(c) => c.as_emit_configurator(),
            Role::Operator(c) => c.as_emit_configurator(),
            Role::Sink(c) => c.as_emit_configurator(),
        }
    }

    /// Ingress factory for operators and sinks; sources have none.
    pub fn emit_factory(&self, name: &str) -> Option<EmitFactory> {
        match self {
            Role::Source(_) => None,
            Role::Operator(c) => {
                let c = c.clone();
                Some(EmitFactory::new(name, move |upstream| {
                    c.clone().generate_emit(upstream)
                }))
            }
            Role::Sink(c) => {
                let c = c.clone();
                Some(EmitFactory::new(name, move |upstream| {
                    c.clone().generate_emit(upstream)
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use athena_types::Meta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl Emit for Counter {
        async fn emit(&self, _event: Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn next_slot_waits_for_binding() {
        let slot = Arc::new(NextSlot::new());
        assert!(slot.try_get().is_none());

        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move {
                slot.get().await.emit(Event::new(Meta::new(), "late")).await;
            })
        };
        tokio::task::yield_now().await;

        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        slot.set(counter.clone());
        waiter.await.unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn next_slot_keeps_first_binding() {
        let slot = NextSlot::new();
        let first = Arc::new(Counter(AtomicUsize::new(0)));
        let second = Arc::new(Counter(AtomicUsize::new(0)));
        slot.set(first.clone());
        slot.set(second.clone());
        slot.get().await.emit(Event::new(Meta::new(), "x")).await;
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn emit_factory_passes_upstream_name() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let factory = EmitFactory::new("sink.echo", move |upstream| {
            recorder.lock().unwrap().push(upstream.to_string());
            Arc::new(Counter(AtomicUsize::new(0))) as Arc<dyn Emit>
        });
        factory.generate("source.a");
        factory.generate("operator.b");
        assert_eq!(factory.target(), "sink.echo");
        assert_eq!(*seen.lock().unwrap(), vec!["source.a", "operator.b"]);
    }

    #[test]
    fn role_kind_prefixes() {
        assert_eq!(RoleKind::Source.prefix(), "source");
        assert_eq!(RoleKind::Operator.to_string(), "operator");
        assert_eq!(RoleKind::Sink.prefix(), "sink");
    }
}
