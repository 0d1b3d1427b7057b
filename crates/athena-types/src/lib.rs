//! Shared types, errors, and configuration for the Athena pipeline engine.
//!
//! This crate provides the foundational types used across all other Athena crates:
//! - `AthenaError`: unified error taxonomy
//! - `Event` / `Ack`: the record flowing through a pipeline and its acknowledgment token
//! - `Value` / `Message` / `Meta`: the closed data model an event carries
//! - `Properties` / `PropertyDescriptor`: scoped configuration and its declaration contract

pub mod event;
pub mod properties;
pub mod value;

pub use event::{Ack, Event};
pub use properties::{parse_duration, Properties, PropertyDescriptor, PropertyKind};
pub use value::{meta_from_json, meta_to_json, Message, Meta, Value};

/// Unified error type for all Athena subsystems.
#[derive(Debug, thiserror::Error)]
pub enum AthenaError {
    // === Event Errors ===
    #[error("Event validation failed on '{field}': {message}")]
    Validation { field: String, message: String },

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Task '{task}' has no downstream consumer")]
    NoDownstream { task: String },

    #[error("No {role} registered for type '{type_name}'")]
    UnknownComponent { role: String, type_name: String },

    // === Component Errors ===
    #[error("Component '{component}' failed during {phase}: {message}")]
    Component {
        component: String,
        phase: String,
        message: String,
    },

    // === Checkpoint Errors ===
    #[error("Checkpoint for '{task}' failed: {message}")]
    Persistence { task: String, message: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl AthenaError {
    /// Shorthand for a [`AthenaError::Component`] failure.
    pub fn component(
        component: impl Into<String>,
        phase: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        AthenaError::Component {
            component: component.into(),
            phase: phase.into(),
            message: message.to_string(),
        }
    }

    /// Returns `true` for errors raised while building the pipeline from configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AthenaError::Configuration(_)
                | AthenaError::NoDownstream { .. }
                | AthenaError::UnknownComponent { .. }
        )
    }

    /// Returns `true` if the error is handled locally and never stops the pipeline.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AthenaError::Persistence { .. })
    }

    /// Returns `true` if the error must cancel the whole pipeline.
    pub fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }
}

/// A convenience alias for `Result<T, AthenaError>`.
pub type Result<T> = std::result::Result<T, AthenaError>;
