//! Component registry: maps `(role, type name)` to a constructor.
//!
//! Registration is explicit; the binary populates one registry at startup
//! and hands it to the engine. Each task gets a fresh instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use athena_types::{AthenaError, PropertyDescriptor, Result};

use crate::component::{Operator, Role, RoleKind, Sink, Source};

type SourceFactory = Arc<dyn Fn() -> Arc<dyn Source> + Send + Sync>;
type OperatorFactory = Arc<dyn Fn() -> Arc<dyn Operator> + Send + Sync>;
type SinkFactory = Arc<dyn Fn() -> Arc<dyn Sink> + Send + Sync>;

/// A registered component type and the properties it declares.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentDefinition {
    pub role: RoleKind,
    pub type_name: String,
    pub properties: Vec<PropertyDescriptor>,
}

#[derive(Clone, Default)]
pub struct ComponentRegistry {
    sources: BTreeMap<String, SourceFactory>,
    operators: BTreeMap<String, OperatorFactory>,
    sinks: BTreeMap<String, SinkFactory>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source<S, F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        S: Source + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.sources.insert(
            type_name.into(),
            Arc::new(move || Arc::new(factory()) as Arc<dyn Source>),
        );
    }

    pub fn register_operator<O, F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        O: Operator + 'static,
        F: Fn() -> O + Send + Sync + 'static,
    {
        self.operators.insert(
            type_name.into(),
            Arc::new(move || Arc::new(factory()) as Arc<dyn Operator>),
        );
    }

    pub fn register_sink<K, F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        K: Sink + 'static,
        F: Fn() -> K + Send + Sync + 'static,
    {
        self.sinks.insert(
            type_name.into(),
            Arc::new(move || Arc::new(factory()) as Arc<dyn Sink>),
        );
    }

    pub fn contains(&self, role: RoleKind, type_name: &str) -> bool {
        match role {
            RoleKind::Source => self.sources.contains_key(type_name),
            RoleKind::Operator => self.operators.contains_key(type_name),
            RoleKind::Sink => self.sinks.contains_key(type_name),
        }
    }

    /// Instantiate a fresh component of `type_name` for `role`.
    pub fn create(&self, role: RoleKind, type_name: &str) -> Result<Role> {
        let created = match role {
            RoleKind::Source => self.sources.get(type_name).map(|f| Role::Source(f())),
            RoleKind::Operator => self.operators.get(type_name).map(|f| Role::Operator(f())),
            RoleKind::Sink => self.sinks.get(type_name).map(|f| Role::Sink(f())),
        };
        created.ok_or_else(|| AthenaError::UnknownComponent {
            role: role.to_string(),
            type_name: type_name.to_string(),
        })
    }

    /// Every registered type, sources first, each role sorted by name.
    pub fn definitions(&self) -> Vec<ComponentDefinition> {
        let sources = self
            .sources
            .iter()
            .map(|(name, f)| (RoleKind::Source, name, Role::Source(f())));
        let operators = self
            .operators
            .iter()
            .map(|(name, f)| (RoleKind::Operator, name, Role::Operator(f())));
        let sinks = self
            .sinks
            .iter()
            .map(|(name, f)| (RoleKind::Sink, name, Role::Sink(f())));

        sources
            .chain(operators)
            .chain(sinks)
            .map(|(role, name, instance)| ComponentDefinition {
                role,
                type_name: name.clone(),
                properties: instance.property_definition(),
            })
            .collect()
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("operators", &self.operators.keys().collect::<Vec<_>>())
            .field("sinks", &self.sinks.keys().collect::<Vec<_>>())
            .finish()
    }
}
