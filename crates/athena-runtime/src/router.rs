//! Replicating router: the default delivery function of a producing task.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;

use athena_types::{AthenaError, Event, Properties, Result};

use crate::ack::AckBarrier;
use crate::component::Emit;

/// How acknowledgment interacts with fan-out. Read once per router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The upstream token fires only after every replica is acknowledged.
    #[default]
    Ack,
    /// The upstream token fires as soon as the replicas are handed off.
    Snapshot,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Ack => "ack",
            DeliveryMode::Snapshot => "snapshot",
        }
    }

    /// Read the global `mode` key, defaulting to [`DeliveryMode::Ack`].
    pub fn from_properties(global: &Properties) -> Result<Self> {
        match global.get("mode") {
            None => Ok(DeliveryMode::default()),
            Some(serde_json::Value::String(s)) => s.parse(),
            Some(other) => Err(AthenaError::Configuration(format!(
                "property 'mode' must be a string, found {other}"
            ))),
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = AthenaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ack" => Ok(DeliveryMode::Ack),
            "snapshot" => Ok(DeliveryMode::Snapshot),
            other => Err(AthenaError::Configuration(format!(
                "unknown delivery mode '{other}' (expected 'ack' or 'snapshot')"
            ))),
        }
    }
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Route {
    name: String,
    emit: Arc<dyn Emit>,
}

/// Delivers a copy of every event to each target, in target order.
///
/// Each target gets an independent deep copy; the last one receives the
/// original. Delivery to one target completes before the next begins, so
/// per-edge ordering follows emission order.
pub struct ReplicatingRouter {
    mode: DeliveryMode,
    routes: Vec<Route>,
}

impl ReplicatingRouter {
    pub fn new(mode: DeliveryMode, targets: Vec<(String, Arc<dyn Emit>)>) -> Self {
        Self {
            mode,
            routes: targets
                .into_iter()
                .map(|(name, emit)| Route { name, emit })
                .collect(),
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn fan_out(&self) -> usize {
        self.routes.len()
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.name.as_str())
    }
}

#[async_trait]
impl Emit for ReplicatingRouter {
    async fn emit(&self, mut event: Event) {
        let Some((last, rest)) = self.routes.split_last() else {
            // Nothing to deliver to; release the producer.
            event.ack();
            return;
        };

        let upstream = event.take_ack();
        let (mut members, deferred) = match (self.mode, upstream) {
            (DeliveryMode::Ack, Some(ack)) => (AckBarrier::split(ack, self.routes.len()), None),
            (DeliveryMode::Snapshot, Some(ack)) => (Vec::new(), Some(ack)),
            (_, None) => (Vec::new(), None),
        };
        // Members are popped from the back, so reverse to keep target order.
        members.reverse();

        for route in rest {
            let mut replica = event.deep_copy();
            replica.set_ack(members.pop());
            trace!(target_task = %route.name, "routing replica");
            route.emit.emit(replica).await;
        }
        event.set_ack(members.pop());
        trace!(target_task = %last.name, "routing event");
        last.emit.emit(event).await;

        if let Some(ack) = deferred {
            ack.fire();
        }
    }
}
