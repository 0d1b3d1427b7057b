//! `window-count` operator: counts events per time bucket.
//!
//! Each finalized bucket yields one event:
//!
//! ```text
//! meta:    { window: "<id>", bucket: <bucket start> }
//! message: { count: <total>, groups: { <group-by value>: <count>, ... } }
//! ```
//!
//! `groups` is present only when `group-by` is set.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use athena_runtime::{
    Accumulator, Component, ComponentContext, Emit, EmitNext, NextSlot, Operator, WindowConfig,
    WindowedAggregator,
};
use athena_types::{AthenaError, Event, Message, Meta, PropertyDescriptor, PropertyKind, Result, Value};

use crate::opened;

fn duration_def(name: &'static str, description: &'static str, default: &str) -> PropertyDescriptor {
    PropertyDescriptor::optional(name, description, PropertyKind::Duration, serde_json::json!(default))
}

fn bucket_def() -> PropertyDescriptor {
    duration_def("bucket", "Width of a time bucket", "1m")
}

fn idle_timeout_def() -> PropertyDescriptor {
    duration_def("idle-timeout", "Finalize a bucket after this long without writes", "30s")
}

fn hard_timeout_def() -> PropertyDescriptor {
    duration_def("hard-timeout", "Finalize a bucket this long after its first write", "5m")
}

fn tick_def() -> PropertyDescriptor {
    duration_def("tick", "How often buckets are checked for expiry", "10s")
}

fn group_by_def() -> PropertyDescriptor {
    PropertyDescriptor::optional(
        "group-by",
        "Meta field whose values are counted separately",
        PropertyKind::String,
        serde_json::json!(""),
    )
}

pub struct CountAccumulator {
    group_by: Option<String>,
    total: i64,
    groups: HashMap<String, i64>,
}

impl CountAccumulator {
    pub fn new(group_by: Option<String>) -> Self {
        Self {
            group_by,
            total: 0,
            groups: HashMap::new(),
        }
    }
}

impl Accumulator for CountAccumulator {
    fn add(&mut self, event: &Event) {
        self.total += 1;
        if let Some(field) = &self.group_by {
            let key = match event.meta.get(field) {
                Some(Value::Str(s)) => s.clone(),
                Some(Value::Int(i)) => i.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                Some(Value::Char(c)) => c.to_string(),
                _ => String::new(),
            };
            *self.groups.entry(key).or_default() += 1;
        }
    }

    fn finish(self, id: &str, bucket: DateTime<Utc>) -> Vec<Event> {
        let mut meta = Meta::new();
        meta.insert("window".into(), Value::from(id));
        meta.insert("bucket".into(), Value::Time(bucket));

        let mut message = HashMap::new();
        message.insert("count".to_string(), Message::from(self.total));
        if self.group_by.is_some() {
            let groups: HashMap<String, Message> = self
                .groups
                .into_iter()
                .map(|(k, n)| (k, Message::from(n)))
                .collect();
            message.insert("groups".to_string(), Message::from(groups));
        }
        vec![Event::with_time(meta, message, bucket)]
    }
}

#[derive(Default)]
pub struct WindowCountOperator {
    ctx: OnceLock<ComponentContext>,
    window: OnceLock<WindowedAggregator<CountAccumulator>>,
    next: NextSlot,
}

impl WindowCountOperator {
    pub fn new() -> Self {
        Self::default()
    }

    fn window(&self) -> Result<&WindowedAggregator<CountAccumulator>> {
        self.window
            .get()
            .ok_or_else(|| AthenaError::component("window-count", "collect", "component was not opened"))
    }
}

#[async_trait]
impl Component for WindowCountOperator {
    fn property_definition(&self) -> Vec<PropertyDescriptor> {
        vec![
            bucket_def(),
            idle_timeout_def(),
            hard_timeout_def(),
            tick_def(),
            group_by_def(),
        ]
    }

    async fn open(&self, ctx: ComponentContext) -> Result<()> {
        let props = ctx.properties();
        let config = WindowConfig {
            bucket: props.duration(&bucket_def())?,
            idle_timeout: props.duration(&idle_timeout_def())?,
            hard_timeout: props.duration(&hard_timeout_def())?,
            tick: props.duration(&tick_def())?,
        };
        if config.bucket.is_zero() || config.tick.is_zero() {
            return Err(AthenaError::Configuration(format!(
                "task '{}': bucket and tick must be positive",
                ctx.name()
            )));
        }
        let group_by = Some(props.string(&group_by_def())?).filter(|g| !g.is_empty());

        let _ = self.window.set(WindowedAggregator::new(config, move |_| {
            CountAccumulator::new(group_by.clone())
        }));
        let _ = self.ctx.set(ctx);
        Ok(())
    }

    /// Flush whatever is still open; consumers are closed after this task.
    async fn close(&self) -> Result<()> {
        let Some(window) = self.window.get() else {
            return Ok(());
        };
        let outputs = window.flush_all();
        if outputs.is_empty() {
            return Ok(());
        }
        match self.next.try_get() {
            Some(next) => {
                for event in outputs {
                    next.emit(event).await;
                }
            }
            None => tracing::warn!(dropped = outputs.len(), "No downstream bound, dropping final windows"),
        }
        Ok(())
    }
}

#[async_trait]
impl Operator for WindowCountOperator {
    async fn collect(&self, next: EmitNext) -> Result<()> {
        let ctx = opened(&self.ctx, "window-count", "collect")?;
        let window = self.window()?;
        self.next.set(next.clone());
        window.run_ticker(next, ctx.token().clone()).await;
        Ok(())
    }

    fn generate_emit(self: Arc<Self>, _upstream: &str) -> Arc<dyn Emit> {
        self
    }
}

#[async_trait]
impl Emit for WindowCountOperator {
    async fn emit(&self, event: Event) {
        let Some(window) = self.window.get() else {
            return;
        };
        if event.is_watermark() {
            let next = self.next.get().await;
            window.ingest(event, &next).await;
        } else {
            window.add(event);
        }
    }
}
