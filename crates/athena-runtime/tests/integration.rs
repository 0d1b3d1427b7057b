//! End-to-end tests for the Athena runtime.
//!
//! Each test registers small in-test components, builds a pipeline from a
//! JSON configuration, runs it to completion and inspects what the
//! components observed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use athena_runtime::{
    Component, ComponentContext, ComponentRegistry, DeliveryMode, Emit, EmitNext, Engine,
    NextSlot, Operator, RuntimeEvent, Sink, Source, Stateful,
};
use athena_types::{
    Ack, AthenaError, Event, Meta, Properties, PropertyDescriptor, PropertyKind, Result, Value,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Shared observation point for every component of one test.
#[derive(Default)]
struct Probe {
    acked: AtomicUsize,
    received: Mutex<Vec<(String, Event)>>,
    log: Mutex<Vec<String>>,
}

impl Probe {
    fn log(&self, line: String) {
        self.log.lock().unwrap().push(line);
    }

    fn lines(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn received_by(&self, sink: &str) -> Vec<i64> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == sink)
            .map(|(_, e)| e.message.as_scalar().and_then(Value::as_i64).unwrap())
            .collect()
    }

    fn ack_token(self: &Arc<Self>) -> Ack {
        let probe = self.clone();
        Ack::new(move || {
            probe.acked.fetch_add(1, Ordering::SeqCst);
        })
    }
}

fn count_def() -> PropertyDescriptor {
    PropertyDescriptor::optional("count", "events to emit", PropertyKind::Unsigned, 3.into())
}

fn hold_def() -> PropertyDescriptor {
    PropertyDescriptor::optional("hold", "wait for cancellation", PropertyKind::Bool, false.into())
}

/// Emits `count` integers, then returns (or waits for cancellation if `hold`).
struct ListSource {
    probe: Arc<Probe>,
    ctx: OnceLock<ComponentContext>,
}

#[async_trait]
impl Component for ListSource {
    fn property_definition(&self) -> Vec<PropertyDescriptor> {
        vec![count_def(), hold_def()]
    }
    async fn open(&self, ctx: ComponentContext) -> Result<()> {
        self.probe.log(format!("open:{}", ctx.name()));
        let _ = self.ctx.set(ctx);
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        self.probe.log(format!("close:{}", self.ctx.get().unwrap().name()));
        Ok(())
    }
}

#[async_trait]
impl Source for ListSource {
    async fn collect(&self, next: EmitNext) -> Result<()> {
        let ctx = self.ctx.get().unwrap();
        let count = ctx.properties().u64(&count_def())?;
        for i in 0..count {
            let event = Event::new(Meta::new(), i as i64).with_ack(self.probe.ack_token());
            next.emit(event).await;
        }
        if ctx.properties().bool(&hold_def())? {
            ctx.cancelled().await;
        }
        Ok(())
    }
}

/// Stateful source that resumes counting where the last run stopped.
struct CounterSource {
    probe: Arc<Probe>,
    ctx: OnceLock<ComponentContext>,
    next_value: Mutex<i64>,
}

#[async_trait]
impl Component for CounterSource {
    fn property_definition(&self) -> Vec<PropertyDescriptor> {
        vec![count_def()]
    }
    async fn open(&self, ctx: ComponentContext) -> Result<()> {
        let _ = self.ctx.set(ctx);
        Ok(())
    }
    fn as_stateful(&self) -> Option<&dyn Stateful> {
        Some(self)
    }
}

#[async_trait]
impl Stateful for CounterSource {
    async fn snapshot(&self) -> Result<Bytes> {
        Ok(Bytes::from(self.next_value.lock().unwrap().to_string()))
    }
    async fn restore(&self, snapshot: Bytes) -> Result<()> {
        let text = std::str::from_utf8(&snapshot).map_err(|e| AthenaError::Other(e.to_string()))?;
        let value: i64 = text
            .parse()
            .map_err(|e: std::num::ParseIntError| AthenaError::Other(e.to_string()))?;
        *self.next_value.lock().unwrap() = value;
        self.probe.log(format!("restored:{value}"));
        Ok(())
    }
}

#[async_trait]
impl Source for CounterSource {
    async fn collect(&self, next: EmitNext) -> Result<()> {
        let count = self.ctx.get().unwrap().properties().u64(&count_def())?;
        for _ in 0..count {
            let value = {
                let mut guard = self.next_value.lock().unwrap();
                let v = *guard;
                *guard += 1;
                v
            };
            next.emit(Event::new(Meta::new(), value)).await;
        }
        Ok(())
    }
}

/// Forwards every event; fails its entry point when `fail` is set.
struct PassOperator {
    probe: Arc<Probe>,
    ctx: OnceLock<ComponentContext>,
    next: NextSlot,
}

struct PassIngress(Arc<PassOperator>);

#[async_trait]
impl Emit for PassIngress {
    async fn emit(&self, event: Event) {
        self.0.next.get().await.emit(event).await;
    }
}

#[async_trait]
impl Component for PassOperator {
    fn property_definition(&self) -> Vec<PropertyDescriptor> {
        vec![
            PropertyDescriptor::optional("fail", "fail on start", PropertyKind::Bool, false.into()),
            PropertyDescriptor::optional(
                "panic-on-close",
                "panic inside close",
                PropertyKind::Bool,
                false.into(),
            ),
        ]
    }
    async fn open(&self, ctx: ComponentContext) -> Result<()> {
        self.probe.log(format!("open:{}", ctx.name()));
        let _ = self.ctx.set(ctx);
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        let ctx = self.ctx.get().unwrap();
        if ctx.properties().get("panic-on-close") == Some(&serde_json::json!(true)) {
            panic!("close exploded");
        }
        self.probe.log(format!("close:{}", ctx.name()));
        Ok(())
    }
}

#[async_trait]
impl Operator for PassOperator {
    async fn collect(&self, next: EmitNext) -> Result<()> {
        let ctx = self.ctx.get().unwrap();
        self.next.set(next);
        if ctx.properties().get("fail") == Some(&serde_json::json!(true)) {
            return Err(AthenaError::component(ctx.name(), "collect", "boom"));
        }
        ctx.cancelled().await;
        Ok(())
    }

    fn generate_emit(self: Arc<Self>, _upstream: &str) -> Arc<dyn Emit> {
        Arc::new(PassIngress(self))
    }
}

/// Records every event; acknowledges unless `ack` is false.
struct CollectSink {
    probe: Arc<Probe>,
    ctx: OnceLock<ComponentContext>,
}

struct CollectIngress(Arc<CollectSink>);

#[async_trait]
impl Emit for CollectIngress {
    async fn emit(&self, mut event: Event) {
        let ctx = self.0.ctx.get().unwrap();
        if ctx.properties().get("ack") != Some(&serde_json::json!(false)) {
            event.ack();
        }
        self.0
            .probe
            .received
            .lock()
            .unwrap()
            .push((ctx.name().to_string(), event));
    }
}

#[async_trait]
impl Component for CollectSink {
    fn property_definition(&self) -> Vec<PropertyDescriptor> {
        vec![PropertyDescriptor::optional(
            "ack",
            "acknowledge received events",
            PropertyKind::Bool,
            true.into(),
        )]
    }
    async fn open(&self, ctx: ComponentContext) -> Result<()> {
        self.probe.log(format!("open:{}", ctx.name()));
        let _ = self.ctx.set(ctx);
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        self.probe.log(format!("close:{}", self.ctx.get().unwrap().name()));
        Ok(())
    }
}

impl Sink for CollectSink {
    fn generate_emit(self: Arc<Self>, _upstream: &str) -> Arc<dyn Emit> {
        Arc::new(CollectIngress(self))
    }
}

fn registry(probe: &Arc<Probe>) -> ComponentRegistry {
    let mut reg = ComponentRegistry::new();
    let p = probe.clone();
    reg.register_source("list", move || ListSource {
        probe: p.clone(),
        ctx: OnceLock::new(),
    });
    let p = probe.clone();
    reg.register_source("counter", move || CounterSource {
        probe: p.clone(),
        ctx: OnceLock::new(),
        next_value: Mutex::new(0),
    });
    let p = probe.clone();
    reg.register_operator("pass", move || PassOperator {
        probe: p.clone(),
        ctx: OnceLock::new(),
        next: NextSlot::new(),
    });
    let p = probe.clone();
    reg.register_sink("collect", move || CollectSink {
        probe: p.clone(),
        ctx: OnceLock::new(),
    });
    reg
}

fn engine(probe: &Arc<Probe>, config: serde_json::Value) -> Engine {
    Engine::new(registry(probe), Properties::from_value(config).unwrap())
}

async fn run_to_end(engine: &Engine) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(10), engine.run_until(std::future::pending()))
        .await
        .expect("pipeline did not stop on its own")
}

// ---------------------------------------------------------------------------
// Delivery and acknowledgment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fan_out_delivers_to_every_sink_and_acks_once() {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let engine = engine(
        &probe,
        serde_json::json!({
            "state-dir": dir.path(),
            "source": { "gen": { "type": "list", "count": 3, "outputs": ["^sink"] } },
            "sink": { "a": { "type": "collect" }, "b": { "type": "collect" } },
        }),
    );

    run_to_end(&engine).await.unwrap();

    assert_eq!(probe.received_by("sink.a"), vec![0, 1, 2]);
    assert_eq!(probe.received_by("sink.b"), vec![0, 1, 2]);
    assert_eq!(probe.acked.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn ack_mode_waits_for_the_slowest_consumer() {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let engine = engine(
        &probe,
        serde_json::json!({
            "state-dir": dir.path(),
            "source": { "gen": { "type": "list", "count": 2, "outputs": ["^sink"] } },
            "sink": {
                "fast": { "type": "collect" },
                "stuck": { "type": "collect", "ack": false },
            },
        }),
    );

    run_to_end(&engine).await.unwrap();

    assert_eq!(probe.received_by("sink.stuck").len(), 2);
    assert_eq!(probe.acked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn snapshot_mode_acks_on_handoff() {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let engine = engine(
        &probe,
        serde_json::json!({
            "mode": "snapshot",
            "state-dir": dir.path(),
            "source": { "gen": { "type": "list", "count": 2, "outputs": ["^sink"] } },
            "sink": { "stuck": { "type": "collect", "ack": false } },
        }),
    );
    assert_eq!(engine.config().unwrap().mode, DeliveryMode::Snapshot);

    run_to_end(&engine).await.unwrap();
    assert_eq!(probe.acked.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn operator_forwards_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let engine = engine(
        &probe,
        serde_json::json!({
            "state-dir": dir.path(),
            "source": { "gen": { "type": "list", "count": 50, "outputs": ["operator.pass"] } },
            "operator": { "pass": { "type": "pass", "outputs": ["sink.out"] } },
            "sink": { "out": { "type": "collect" } },
        }),
    );

    run_to_end(&engine).await.unwrap();
    assert_eq!(probe.received_by("sink.out"), (0..50).collect::<Vec<_>>());
    assert_eq!(probe.acked.load(Ordering::SeqCst), 50);
}

// ---------------------------------------------------------------------------
// Build-time failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn no_downstream_aborts_before_any_task_opens() {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let engine = engine(
        &probe,
        serde_json::json!({
            "state-dir": dir.path(),
            "source": { "gen": { "type": "list", "outputs": ["^nothing"] } },
            "sink": { "a": { "type": "collect" } },
        }),
    );

    let err = run_to_end(&engine).await.unwrap_err();
    assert!(matches!(err, AthenaError::NoDownstream { ref task } if task == "source.gen"));
    assert!(probe.lines().is_empty());
}

#[tokio::test]
async fn unknown_type_is_rejected() {
    let probe = Arc::new(Probe::default());
    let engine = engine(
        &probe,
        serde_json::json!({
            "source": { "gen": { "type": "kafka", "outputs": [".*"] } },
            "sink": { "a": { "type": "collect" } },
        }),
    );
    let err = engine.build().unwrap_err();
    assert!(matches!(err, AthenaError::UnknownComponent { .. }));
}

#[tokio::test]
async fn missing_outputs_is_rejected() {
    let probe = Arc::new(Probe::default());
    let engine = engine(
        &probe,
        serde_json::json!({
            "source": { "gen": { "type": "list" } },
            "sink": { "a": { "type": "collect" } },
        }),
    );
    let err = engine.build().unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("outputs"), "{err}");
}

#[tokio::test]
async fn wrongly_typed_property_is_rejected() {
    let probe = Arc::new(Probe::default());
    let engine = engine(
        &probe,
        serde_json::json!({
            "source": { "gen": { "type": "list", "count": "many", "outputs": [".*"] } },
            "sink": { "a": { "type": "collect" } },
        }),
    );
    let err = engine.build().unwrap_err();
    assert!(err.to_string().contains("count"), "{err}");
}

#[tokio::test]
async fn build_exposes_topology() {
    let probe = Arc::new(Probe::default());
    let engine = engine(
        &probe,
        serde_json::json!({
            "source": { "gen": { "type": "list", "outputs": ["operator"] } },
            "operator": { "pass": { "type": "pass", "outputs": ["sink"] } },
            "sink": { "a": { "type": "collect" }, "b": { "type": "collect" } },
        }),
    );
    let pipeline = engine.build().unwrap();
    let edges: Vec<(&str, &str)> = pipeline.topology().edges().collect();
    assert_eq!(
        edges,
        vec![
            ("operator.pass", "sink.a"),
            ("operator.pass", "sink.b"),
            ("source.gen", "operator.pass"),
        ]
    );
    assert_eq!(
        pipeline.task_names(),
        vec!["source.gen", "operator.pass", "sink.a", "sink.b"]
    );
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn open_and_close_follow_role_order() {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let engine = engine(
        &probe,
        serde_json::json!({
            "state-dir": dir.path(),
            "source": { "gen": { "type": "list", "count": 1, "outputs": ["operator"] } },
            "operator": { "pass": { "type": "pass", "outputs": ["sink"] } },
            "sink": { "out": { "type": "collect" } },
        }),
    );

    run_to_end(&engine).await.unwrap();
    assert_eq!(
        probe.lines(),
        vec![
            "open:source.gen",
            "open:operator.pass",
            "open:sink.out",
            "close:source.gen",
            "close:operator.pass",
            "close:sink.out",
        ]
    );
}

#[tokio::test]
async fn failing_task_stops_the_pipeline_with_its_error() {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let engine = engine(
        &probe,
        serde_json::json!({
            "state-dir": dir.path(),
            "source": { "gen": { "type": "list", "count": 0, "hold": true, "outputs": ["operator"] } },
            "operator": { "pass": { "type": "pass", "fail": true, "outputs": ["sink"] } },
            "sink": { "out": { "type": "collect" } },
        }),
    );
    let mut events = engine.events().subscribe();

    let err = run_to_end(&engine).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Component 'operator.pass' failed during collect: boom"
    );

    // Every task was still closed.
    let lines = probe.lines();
    assert!(lines.contains(&"close:source.gen".to_string()));
    assert!(lines.contains(&"close:sink.out".to_string()));

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if let RuntimeEvent::TaskFailed { task, .. } = event {
            assert_eq!(task, "operator.pass");
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[tokio::test]
async fn panic_in_close_is_reported_and_later_tasks_still_close() {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let engine = engine(
        &probe,
        serde_json::json!({
            "state-dir": dir.path(),
            "source": { "gen": { "type": "list", "count": 2, "outputs": ["operator"] } },
            "operator": { "pass": { "type": "pass", "panic-on-close": true, "outputs": ["sink"] } },
            "sink": { "out": { "type": "collect" } },
        }),
    );

    let err = run_to_end(&engine).await.unwrap_err();
    assert!(matches!(err, AthenaError::Component { .. }), "{err}");
    let message = err.to_string();
    assert!(message.contains("operator.pass"), "{message}");
    assert!(message.contains("close"), "{message}");

    assert_eq!(probe.received_by("sink.out"), vec![0, 1]);
    let lines = probe.lines();
    assert!(lines.contains(&"close:source.gen".to_string()));
    assert!(lines.contains(&"close:sink.out".to_string()));
    assert!(!lines.contains(&"close:operator.pass".to_string()));
}

#[tokio::test]
async fn external_shutdown_stops_a_long_running_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let engine = engine(
        &probe,
        serde_json::json!({
            "state-dir": dir.path(),
            "source": { "gen": { "type": "list", "count": 1, "hold": true, "outputs": ["sink"] } },
            "sink": { "out": { "type": "collect" } },
        }),
    );
    let mut events = engine.events().subscribe();

    engine
        .run_until(tokio::time::sleep(Duration::from_millis(50)))
        .await
        .unwrap();

    assert_eq!(probe.received_by("sink.out"), vec![0]);
    let mut stopped = false;
    while let Ok(event) = events.try_recv() {
        stopped |= matches!(event, RuntimeEvent::PipelineStopped { .. });
    }
    assert!(stopped);
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

fn counter_config(dir: &std::path::Path) -> serde_json::Value {
    serde_json::json!({
        "state-dir": dir,
        "source": { "counter": { "type": "counter", "count": 3, "outputs": ["sink"] } },
        "sink": { "out": { "type": "collect" } },
    })
}

#[tokio::test]
async fn stateful_source_resumes_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();

    let first = Arc::new(Probe::default());
    run_to_end(&engine(&first, counter_config(dir.path())))
        .await
        .unwrap();
    assert_eq!(first.received_by("sink.out"), vec![0, 1, 2]);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("source.counter")).unwrap(),
        "3"
    );

    let second = Arc::new(Probe::default());
    run_to_end(&engine(&second, counter_config(dir.path())))
        .await
        .unwrap();
    assert_eq!(second.received_by("sink.out"), vec![3, 4, 5]);
    assert!(second.lines().contains(&"restored:3".to_string()));
}

#[tokio::test]
async fn corrupt_checkpoint_starts_cold() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("source.counter"), b"not a number").unwrap();

    let probe = Arc::new(Probe::default());
    let engine = engine(&probe, counter_config(dir.path()));
    let mut events = engine.events().subscribe();

    run_to_end(&engine).await.unwrap();
    assert_eq!(probe.received_by("sink.out"), vec![0, 1, 2]);

    let mut skipped = false;
    while let Ok(event) = events.try_recv() {
        skipped |= matches!(event, RuntimeEvent::CheckpointSkipped { ref task, .. } if task == "source.counter");
    }
    assert!(skipped);
}

#[tokio::test]
async fn missing_checkpoint_starts_cold() {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    run_to_end(&engine(&probe, counter_config(&dir.path().join("fresh"))))
        .await
        .unwrap();
    assert_eq!(probe.received_by("sink.out"), vec![0, 1, 2]);
    assert!(dir.path().join("fresh").join("source.counter").exists());
}
