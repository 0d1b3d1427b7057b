//! Topology: the directed producer → consumer graph, and selector resolution.
//!
//! A producing task lists downstream selectors in its `outputs` property.
//! Each selector is an unanchored regular expression matched against the
//! names of all operator and sink tasks; every match becomes a consumer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use athena_types::{AthenaError, Result};

use crate::component::{Emit, EmitFactory, EmitNext};
use crate::router::{DeliveryMode, ReplicatingRouter};

/// Directed edges between task names. Built once, read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `from → to`. Returns `false` if the edge already existed.
    pub fn add_edge(&mut self, from: &str, to: &str) -> bool {
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string())
    }

    pub fn downstream(&self, task: &str) -> Vec<&str> {
        self.edges
            .get(task)
            .map(|targets| targets.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn upstream(&self, task: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, targets)| targets.contains(task))
            .map(|(from, _)| from.as_str())
            .collect()
    }

    pub fn contains_edge(&self, from: &str, to: &str) -> bool {
        self.edges.get(from).is_some_and(|t| t.contains(to))
    }

    /// All edges in name order.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.edges
            .iter()
            .flat_map(|(from, targets)| targets.iter().map(move |to| (from.as_str(), to.as_str())))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.edge_count() == 0
    }
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (from, to) in self.edges() {
            writeln!(f, "{from} -> {to}")?;
        }
        Ok(())
    }
}

fn compile(task: &str, selector: &str) -> Result<Regex> {
    Regex::new(selector).map_err(|e| {
        AthenaError::Configuration(format!(
            "task '{task}' has an invalid output selector '{selector}': {e}"
        ))
    })
}

/// Entry points whose name matches any of `selectors`, excluding `task`
/// itself. Each consumer appears once however many selectors match it.
pub fn select_downstream<'a>(
    task: &str,
    selectors: &[String],
    entrypoints: &'a BTreeMap<String, EmitFactory>,
) -> Result<Vec<&'a EmitFactory>> {
    let patterns = selectors
        .iter()
        .map(|s| compile(task, s))
        .collect::<Result<Vec<_>>>()?;

    let matched: Vec<&EmitFactory> = entrypoints
        .iter()
        .filter(|(name, _)| name.as_str() != task)
        .filter(|(name, _)| patterns.iter().any(|p| p.is_match(name)))
        .map(|(_, factory)| factory)
        .collect();

    if matched.is_empty() {
        return Err(AthenaError::NoDownstream {
            task: task.to_string(),
        });
    }
    Ok(matched)
}

/// Resolve `task`'s selectors into a [`ReplicatingRouter`], recording the
/// edges in `topology`.
pub fn resolve_emit_next(
    task: &str,
    selectors: &[String],
    entrypoints: &BTreeMap<String, EmitFactory>,
    mode: DeliveryMode,
    topology: &mut Topology,
) -> Result<EmitNext> {
    let targets: Vec<(String, Arc<dyn Emit>)> = select_downstream(task, selectors, entrypoints)?
        .into_iter()
        .map(|factory| {
            topology.add_edge(task, factory.target());
            (factory.target().to_string(), factory.generate(task))
        })
        .collect();

    debug!(
        task,
        consumers = ?targets.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
        %mode,
        "resolved downstream"
    );
    Ok(Arc::new(ReplicatingRouter::new(mode, targets)))
}
