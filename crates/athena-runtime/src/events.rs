//! Runtime event system for observability.
//!
//! Emits [`RuntimeEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (tests, metrics collectors, a CLI status line) can
//! follow the pipeline lifecycle without coupling to the engine internals.

use serde::{Deserialize, Serialize};

use crate::task::TaskState;

/// Lifecycle events emitted while a pipeline runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RuntimeEvent {
    PipelineStarted {
        run_id: String,
        task_count: usize,
    },
    PipelineStopped {
        run_id: String,
        duration_ms: u64,
    },
    PipelineFailed {
        run_id: String,
        error: String,
    },
    TaskStateChanged {
        task: String,
        from: TaskState,
        to: TaskState,
    },
    TaskFailed {
        task: String,
        error: String,
    },
    SourceExhausted {
        task: String,
    },
    CheckpointRestored {
        task: String,
        bytes: usize,
    },
    CheckpointSaved {
        task: String,
        bytes: usize,
    },
    CheckpointSkipped {
        task: String,
        reason: String,
    },
}

/// Cloneable publisher for [`RuntimeEvent`]s.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RuntimeEvent>,
}

impl EventEmitter {
    /// Slow subscribers lag once more than `capacity` events are queued.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to whoever is subscribed right now; a no-op without subscribers.
    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}
