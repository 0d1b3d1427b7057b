//! `sample` operator: keeps one event out of every `rate`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use athena_runtime::{Component, ComponentContext, Emit, EmitNext, NextSlot, Operator};
use athena_types::{AthenaError, Event, PropertyDescriptor, PropertyKind, Result};

use crate::opened;

fn rate_def() -> PropertyDescriptor {
    PropertyDescriptor::optional(
        "rate",
        "Forward one event out of this many",
        PropertyKind::Unsigned,
        serde_json::json!(10),
    )
}

#[derive(Default)]
pub struct SampleOperator {
    ctx: OnceLock<ComponentContext>,
    rate: AtomicU64,
    seen: AtomicU64,
    next: NextSlot,
}

impl SampleOperator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the event just counted is the `rate`-th one.
    fn admit(&self) -> bool {
        let rate = self.rate.load(Ordering::Relaxed).max(1);
        self.seen.fetch_add(1, Ordering::AcqRel) % rate == rate - 1
    }
}

#[async_trait]
impl Component for SampleOperator {
    fn property_definition(&self) -> Vec<PropertyDescriptor> {
        vec![rate_def()]
    }

    async fn open(&self, ctx: ComponentContext) -> Result<()> {
        let rate = ctx.properties().u64(&rate_def())?;
        if rate == 0 {
            return Err(AthenaError::Configuration(format!(
                "task '{}': rate must be at least 1",
                ctx.name()
            )));
        }
        self.rate.store(rate, Ordering::Relaxed);
        let _ = self.ctx.set(ctx);
        Ok(())
    }
}

#[async_trait]
impl Operator for SampleOperator {
    async fn collect(&self, next: EmitNext) -> Result<()> {
        let ctx = opened(&self.ctx, "sample", "collect")?;
        self.next.set(next);
        ctx.cancelled().await;
        Ok(())
    }

    fn generate_emit(self: Arc<Self>, _upstream: &str) -> Arc<dyn Emit> {
        self
    }
}

#[async_trait]
impl Emit for SampleOperator {
    async fn emit(&self, mut event: Event) {
        if self.admit() {
            self.next.get().await.emit(event).await;
        } else {
            event.ack();
        }
    }
}
