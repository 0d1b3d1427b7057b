//! `echo` sink: writes every event to the log.

use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use tracing::{debug, error, info, warn, Level};

use athena_runtime::{Component, ComponentContext, Emit, Sink};
use athena_types::{AthenaError, Event, PropertyDescriptor, PropertyKind, Result};

fn level_def() -> PropertyDescriptor {
    PropertyDescriptor::optional(
        "level",
        "Log level for echoed events: debug, info, warn or error",
        PropertyKind::String,
        serde_json::json!("info"),
    )
}

fn batch_def() -> PropertyDescriptor {
    PropertyDescriptor::optional(
        "batch",
        "Events buffered before they are written and acknowledged",
        PropertyKind::Unsigned,
        serde_json::json!(1),
    )
}

fn parse_level(task: &str, raw: &str) -> Level {
    match raw.to_ascii_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        other => {
            warn!(task, level = other, "Unknown echo level, using info");
            Level::INFO
        }
    }
}

struct EchoSettings {
    name: String,
    level: Level,
    batch: usize,
}

#[derive(Default)]
pub struct EchoSink {
    settings: OnceLock<EchoSettings>,
    pending: Mutex<Vec<(String, Event)>>,
}

impl EchoSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(settings: &EchoSettings, upstream: &str, mut event: Event) {
        let task = settings.name.as_str();
        let rendered = event.to_json();
        match settings.level {
            Level::ERROR => error!(task, upstream, event = %rendered, "echo"),
            Level::WARN => warn!(task, upstream, event = %rendered, "echo"),
            Level::DEBUG | Level::TRACE => debug!(task, upstream, event = %rendered, "echo"),
            _ => info!(task, upstream, event = %rendered, "echo"),
        }
        event.ack();
    }

    fn drain(&self) -> Vec<(String, Event)> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *pending)
    }

    fn accept(&self, upstream: &str, event: Event) {
        let Some(settings) = self.settings.get() else {
            // Never opened; nothing to write to, but upstream must not stall.
            let mut event = event;
            event.ack();
            return;
        };
        if settings.batch <= 1 {
            Self::write(settings, upstream, event);
            return;
        }
        let full = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pending.push((upstream.to_string(), event));
            if pending.len() >= settings.batch {
                std::mem::take(&mut *pending)
            } else {
                Vec::new()
            }
        };
        for (upstream, event) in full {
            Self::write(settings, &upstream, event);
        }
    }
}

#[async_trait]
impl Component for EchoSink {
    fn property_definition(&self) -> Vec<PropertyDescriptor> {
        vec![level_def(), batch_def()]
    }

    async fn open(&self, ctx: ComponentContext) -> Result<()> {
        let props = ctx.properties();
        let batch = usize::try_from(props.u64(&batch_def())?).map_err(|_| {
            AthenaError::Configuration(format!("task '{}': batch is too large", ctx.name()))
        })?;
        let settings = EchoSettings {
            name: ctx.name().to_string(),
            level: parse_level(ctx.name(), &props.string(&level_def())?),
            batch,
        };
        let _ = self.settings.set(settings);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let Some(settings) = self.settings.get() else {
            return Ok(());
        };
        let rest = self.drain();
        if !rest.is_empty() {
            debug!(task = %settings.name, events = rest.len(), "Flushing partial batch");
        }
        for (upstream, event) in rest {
            Self::write(settings, &upstream, event);
        }
        Ok(())
    }
}

impl Sink for EchoSink {
    fn generate_emit(self: Arc<Self>, upstream: &str) -> Arc<dyn Emit> {
        Arc::new(EchoIngress {
            sink: self,
            upstream: upstream.to_string(),
        })
    }
}

/// Per-upstream ingress, so log lines name the producer.
struct EchoIngress {
    sink: Arc<EchoSink>,
    upstream: String,
}

#[async_trait]
impl Emit for EchoIngress {
    async fn emit(&self, event: Event) {
        self.sink.accept(&self.upstream, event);
    }
}
