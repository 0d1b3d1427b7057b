//! Pipeline runtime: component contracts, task lifecycle, topology routing,
//! acknowledgment, and checkpoints.
//!
//! An [`Engine`] reads a configuration tree, instantiates components from a
//! [`ComponentRegistry`], wires producers to consumers through
//! [`ReplicatingRouter`]s, and supervises the resulting [`Task`]s until
//! shutdown.

pub mod ack;
pub mod checkpoint;
pub mod component;
pub mod engine;
pub mod events;
pub mod registry;
pub mod router;
pub mod task;
pub mod topology;
pub mod window;

pub use ack::AckBarrier;
pub use checkpoint::CheckpointStore;
pub use component::{
    Component, ComponentContext, Emit, EmitConfigurator, EmitFactory, EmitNext, NextSlot, Operator,
    Role, RoleKind, Sink, Source, Stateful,
};
pub use engine::{shutdown_signal, Engine, Pipeline, RuntimeConfig};
pub use events::{EventEmitter, RuntimeEvent};
pub use registry::{ComponentDefinition, ComponentRegistry};
pub use router::{DeliveryMode, ReplicatingRouter};
pub use task::{Task, TaskState};
pub use topology::{resolve_emit_next, select_downstream, Topology};
pub use window::{Accumulator, WindowConfig, WindowedAggregator};
