//! `mock` source: a fixed access-log line on a timer. For demos and load tests.

use std::sync::OnceLock;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;

use athena_runtime::{Component, ComponentContext, EmitNext, Source};
use athena_types::{AthenaError, Event, Meta, PropertyDescriptor, PropertyKind, Result, Value};

use crate::opened;

pub const MOCK_LINE: &str = r#"dx-edge-1-10-101-1-145 58.44.196.169 st.dl.example.com "application/octet-stream" [06/Jan/2022:11:32:12 +0800] "GET http://st.dl.example.com/depot/578081/chunk/305816807006b3ee HTTP/1.1" 200 1015545 "-" "Valve/Steam HTTP Client 1.0" 6 1014848 HIT NONE -"#;

fn interval_def() -> PropertyDescriptor {
    PropertyDescriptor::optional(
        "interval",
        "Delay between generated records",
        PropertyKind::Duration,
        serde_json::json!("100ms"),
    )
}

fn count_def() -> PropertyDescriptor {
    PropertyDescriptor::optional(
        "count",
        "Records to generate before finishing, 0 for unbounded",
        PropertyKind::Unsigned,
        serde_json::json!(0),
    )
}

#[derive(Default)]
pub struct MockSource {
    ctx: OnceLock<ComponentContext>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Component for MockSource {
    fn property_definition(&self) -> Vec<PropertyDescriptor> {
        vec![interval_def(), count_def()]
    }

    async fn open(&self, ctx: ComponentContext) -> Result<()> {
        if ctx.properties().duration(&interval_def())?.is_zero() {
            return Err(AthenaError::Configuration(format!(
                "task '{}': interval must be positive",
                ctx.name()
            )));
        }
        let _ = self.ctx.set(ctx);
        Ok(())
    }
}

#[async_trait]
impl Source for MockSource {
    async fn collect(&self, next: EmitNext) -> Result<()> {
        let ctx = opened(&self.ctx, "mock", "collect")?;
        let interval = ctx.properties().duration(&interval_def())?;
        let count = ctx.properties().u64(&count_def())?;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut emitted = 0u64;
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let mut meta = Meta::new();
                    meta.insert("source".into(), Value::from(ctx.name()));
                    next.emit(Event::new(meta, MOCK_LINE)).await;
                    emitted += 1;
                    if count > 0 && emitted >= count {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use athena_runtime::Emit;
    use athena_types::{Message, Properties};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Event>>);

    #[async_trait]
    impl Emit for Collect {
        async fn emit(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    async fn opened_source(props: serde_json::Value, cancel: CancellationToken) -> MockSource {
        let mut props = Properties::from_value(props).unwrap();
        props.init(&MockSource::new().property_definition()).unwrap();
        let source = MockSource::new();
        source
            .open(ComponentContext::new("source.mock", props, Properties::new(), cancel))
            .await
            .unwrap();
        source
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_mock_finishes_after_count() {
        let source = opened_source(
            serde_json::json!({"interval": "1s", "count": 3}),
            CancellationToken::new(),
        )
        .await;
        let sink = Arc::new(Collect::default());

        source.collect(sink.clone()).await.unwrap();

        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].message, Message::from(MOCK_LINE));
        assert_eq!(events[0].meta["source"], Value::from("source.mock"));
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        for interval in [serde_json::json!(0), serde_json::json!("0s")] {
            let source = MockSource::new();
            let mut props =
                Properties::from_value(serde_json::json!({ "interval": interval, "count": 1 }))
                    .unwrap();
            props.init(&source.property_definition()).unwrap();
            let err = source
                .open(ComponentContext::new(
                    "source.mock",
                    props,
                    Properties::new(),
                    CancellationToken::new(),
                ))
                .await
                .unwrap_err();
            assert!(err.is_configuration(), "{err}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_mock_runs_until_cancelled() {
        let cancel = CancellationToken::new();
        let source =
            Arc::new(opened_source(serde_json::json!({"interval": "100ms"}), cancel.clone()).await);
        let sink = Arc::new(Collect::default());

        let handle = {
            let source = source.clone();
            let sink = sink.clone();
            tokio::spawn(async move { source.collect(sink).await })
        };
        tokio::time::sleep(Duration::from_millis(1050)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        // Ticks at 0, 100, ..., 1000 ms.
        let n = sink.0.lock().unwrap().len();
        assert!((10..=11).contains(&n), "got {n}");
    }
}
