//! `switch` operator: content-based routing on a meta field.
//!
//! Instead of `outputs` selectors the operator wires itself: each entry of
//! `cases` maps a field value to the exact name of a consumer task, and
//! `default` names the consumer for everything else. Events with no route
//! are acknowledged and dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tracing::{debug, trace};

use athena_runtime::{
    Component, ComponentContext, DeliveryMode, Emit, EmitConfigurator, EmitFactory, EmitNext,
    NextSlot, Operator, ReplicatingRouter, Topology,
};
use athena_types::{AthenaError, Event, PropertyDescriptor, PropertyKind, Result, Value};

use crate::opened;

fn field_def() -> PropertyDescriptor {
    PropertyDescriptor::required("field", "Meta field to route on", PropertyKind::String)
}

fn cases_def() -> PropertyDescriptor {
    PropertyDescriptor::required(
        "cases",
        "Mapping of field value to consumer task name",
        PropertyKind::Object,
    )
}

fn default_def() -> PropertyDescriptor {
    PropertyDescriptor::optional(
        "default",
        "Consumer for unmatched events; empty to drop them",
        PropertyKind::String,
        serde_json::json!(""),
    )
}

/// Textual routing key of a meta value. Only printable scalars route.
fn route_key(value: &Value) -> Option<String> {
    match value {
        Value::Str(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Char(c) => Some(c.to_string()),
        _ => None,
    }
}

/// The downstream delivery function built by [`SwitchOperator::configure`].
pub struct SwitchRouter {
    field: String,
    routes: HashMap<String, Arc<dyn Emit>>,
    default: Option<Arc<dyn Emit>>,
}

impl SwitchRouter {
    fn route(&self, event: &Event) -> Option<&Arc<dyn Emit>> {
        event
            .meta
            .get(&self.field)
            .and_then(route_key)
            .and_then(|key| self.routes.get(&key))
            .or(self.default.as_ref())
    }
}

#[async_trait]
impl Emit for SwitchRouter {
    async fn emit(&self, mut event: Event) {
        match self.route(&event) {
            Some(target) => target.emit(event).await,
            None => {
                trace!(field = %self.field, "No route, dropping event");
                event.ack();
            }
        }
    }
}

#[derive(Default)]
pub struct SwitchOperator {
    ctx: OnceLock<ComponentContext>,
    next: NextSlot,
}

impl SwitchOperator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Component for SwitchOperator {
    fn property_definition(&self) -> Vec<PropertyDescriptor> {
        vec![field_def(), cases_def(), default_def()]
    }

    async fn open(&self, ctx: ComponentContext) -> Result<()> {
        let _ = self.ctx.set(ctx);
        Ok(())
    }

    fn as_emit_configurator(&self) -> Option<&dyn EmitConfigurator> {
        Some(self)
    }
}

impl EmitConfigurator for SwitchOperator {
    fn configure(
        &self,
        ctx: &ComponentContext,
        entrypoints: &BTreeMap<String, EmitFactory>,
        topology: &mut Topology,
    ) -> Result<EmitNext> {
        let name = ctx.name();
        let props = ctx.properties();
        let mode = DeliveryMode::from_properties(ctx.global())?;
        let field = props.string(&field_def())?;
        let default = props.string(&default_def())?;

        let mut cases: Vec<(String, String)> = Vec::new();
        for (value, target) in props.object(&cases_def())?.iter() {
            let target = target.as_str().ok_or_else(|| {
                AthenaError::Configuration(format!(
                    "task '{name}': case '{value}' must name a task"
                ))
            })?;
            cases.push((value.clone(), target.to_string()));
        }

        // One ingress per consumer, however many cases share it.
        let mut targets: BTreeMap<String, Arc<dyn Emit>> = BTreeMap::new();
        let mut connect = |target: &str| -> Result<Arc<dyn Emit>> {
            if let Some(emit) = targets.get(target) {
                return Ok(emit.clone());
            }
            let factory = entrypoints
                .get(target)
                .filter(|_| target != name)
                .ok_or_else(|| {
                    AthenaError::Configuration(format!(
                        "task '{name}' routes to unknown task '{target}'"
                    ))
                })?;
            topology.add_edge(name, target);
            let emit: Arc<dyn Emit> = Arc::new(ReplicatingRouter::new(
                mode,
                vec![(target.to_string(), factory.generate(name))],
            ));
            targets.insert(target.to_string(), emit.clone());
            Ok(emit)
        };

        let mut routes = HashMap::new();
        for (value, target) in &cases {
            routes.insert(value.clone(), connect(target)?);
        }
        let default = if default.is_empty() {
            None
        } else {
            Some(connect(&default)?)
        };

        if routes.is_empty() && default.is_none() {
            return Err(AthenaError::NoDownstream {
                task: name.to_string(),
            });
        }
        debug!(task = name, field = %field, cases = routes.len(), default = default.is_some(), "Switch wired");
        Ok(Arc::new(SwitchRouter {
            field,
            routes,
            default,
        }))
    }
}

#[async_trait]
impl Operator for SwitchOperator {
    async fn collect(&self, next: EmitNext) -> Result<()> {
        let ctx = opened(&self.ctx, "switch", "collect")?;
        self.next.set(next);
        ctx.cancelled().await;
        Ok(())
    }

    fn generate_emit(self: Arc<Self>, _upstream: &str) -> Arc<dyn Emit> {
        self
    }
}

#[async_trait]
impl Emit for SwitchOperator {
    async fn emit(&self, event: Event) {
        self.next.get().await.emit(event).await;
    }
}
