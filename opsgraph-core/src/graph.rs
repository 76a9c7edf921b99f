//! The declared resource graph.
//!
//! Nodes are keyed by logical name. Dependency edges come from two places:
//! explicit `depends_on` entries and references inside declared property
//! values. The graph is validated (no duplicates, no dangling edges, no
//! cycles) before any diffing or applying happens.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::PropertyValue;

/// A stable, user-assigned identifier for a resource, independent of any
/// provider-assigned physical identifier.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogicalName(String);

impl LogicalName {
    pub fn new(name: impl Into<String>) -> Self {
        LogicalName(name.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LogicalName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LogicalName {
    fn from(s: &str) -> Self {
        LogicalName(s.to_owned())
    }
}

impl From<String> for LogicalName {
    fn from(s: String) -> Self {
        LogicalName(s)
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("duplicate resource name: {name}")]
    DuplicateName { name: LogicalName },

    #[error("dependency cycle: {}", format_cycle(.path))]
    Cycle { path: Vec<LogicalName> },

    #[error("resource {node} depends on {reference}, which is not declared in the graph")]
    DanglingReference {
        node: LogicalName,
        reference: LogicalName,
    },
}

fn format_cycle(path: &[LogicalName]) -> String {
    let mut s = String::new();
    for name in path {
        s.push_str(name.as_str());
        s.push_str(" -> ");
    }
    if let Some(first) = path.first() {
        s.push_str(first.as_str());
    }
    s
}

/// A single declared resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub name: LogicalName,
    /// Selects the provider adapter that handles this resource.
    #[serde(rename = "type")]
    pub type_: String,
    pub properties: BTreeMap<String, PropertyValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<LogicalName>,
}

impl ResourceNode {
    pub fn new(name: impl Into<LogicalName>, type_: impl Into<String>) -> Self {
        ResourceNode {
            name: name.into(),
            type_: type_.into(),
            properties: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_dependency(mut self, name: impl Into<LogicalName>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// All names this node depends on: explicit `depends_on` entries plus
    /// the targets of property references. Sorted and deduplicated.
    pub fn dependencies(&self) -> BTreeSet<LogicalName> {
        let mut deps: BTreeSet<LogicalName> = self.depends_on.iter().cloned().collect();
        for value in self.properties.values() {
            if let Some(r) = value.as_ref_value() {
                deps.insert(r.resource.clone());
            }
        }
        deps
    }
}

/// DFS visit state for cycle detection.
#[derive(Clone, Copy, PartialEq)]
enum Visit {
    InProgress,
    Done,
}

/// The set of declared resources, keyed by logical name.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: BTreeMap<LogicalName, ResourceNode>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the graph. The logical name must not already be taken.
    pub fn add(&mut self, node: ResourceNode) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node.name) {
            return Err(GraphError::DuplicateName {
                name: node.name.clone(),
            });
        }
        self.nodes.insert(node.name.clone(), node);
        Ok(())
    }

    pub fn get(&self, name: &LogicalName) -> Option<&ResourceNode> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &LogicalName) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &LogicalName> {
        self.nodes.keys()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The nodes that depend on `name`, directly.
    pub fn dependents_of(&self, name: &LogicalName) -> BTreeSet<LogicalName> {
        self.nodes
            .values()
            .filter(|n| n.dependencies().contains(name))
            .map(|n| n.name.clone())
            .collect()
    }

    /// Check that every dependency edge resolves to a declared node and
    /// that the dependency relation is acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in self.nodes.values() {
            for dep in node.dependencies() {
                if !self.nodes.contains_key(&dep) {
                    return Err(GraphError::DanglingReference {
                        node: node.name.clone(),
                        reference: dep,
                    });
                }
            }
        }

        // Three-color DFS: absent from `visit` is unvisited, `InProgress`
        // while on the current path, `Done` once fully explored. Reaching an
        // in-progress node again is a cycle. Recursion depth is bounded by
        // the longest dependency chain; declared graphs are small.
        let mut visit: BTreeMap<LogicalName, Visit> = BTreeMap::new();
        let mut path: Vec<LogicalName> = Vec::new();
        for start in self.nodes.keys() {
            self.visit_for_cycles(start, &mut visit, &mut path)?;
        }
        Ok(())
    }

    fn visit_for_cycles(
        &self,
        name: &LogicalName,
        visit: &mut BTreeMap<LogicalName, Visit>,
        path: &mut Vec<LogicalName>,
    ) -> Result<(), GraphError> {
        match visit.get(name) {
            Some(Visit::Done) => return Ok(()),
            Some(Visit::InProgress) => {
                let start = path.iter().position(|p| p == name).unwrap_or(0);
                return Err(GraphError::Cycle {
                    path: path[start..].to_vec(),
                });
            }
            None => {}
        }
        visit.insert(name.clone(), Visit::InProgress);
        path.push(name.clone());
        for dep in self.nodes[name].dependencies() {
            self.visit_for_cycles(&dep, visit, path)?;
        }
        path.pop();
        visit.insert(name.clone(), Visit::Done);
        Ok(())
    }

    /// Nodes in dependency order: every node appears after everything it
    /// depends on. Ties among independent nodes are broken by ascending
    /// logical name, so the order is deterministic.
    ///
    /// The iterator is lazy. On a graph that does not pass [`validate`],
    /// it may end before yielding every node; call [`validate`] first.
    ///
    /// [`validate`]: ResourceGraph::validate
    pub fn topological_order(&self) -> TopologicalOrder<'_> {
        let mut blocked_by: BTreeMap<&LogicalName, BTreeSet<LogicalName>> = BTreeMap::new();
        let mut ready: BTreeSet<&LogicalName> = BTreeSet::new();
        for (name, node) in &self.nodes {
            let deps: BTreeSet<LogicalName> = node
                .dependencies()
                .into_iter()
                .filter(|d| self.nodes.contains_key(d))
                .collect();
            if deps.is_empty() {
                ready.insert(name);
            } else {
                blocked_by.insert(name, deps);
            }
        }
        TopologicalOrder {
            graph: self,
            blocked_by,
            ready,
        }
    }
}

/// Lazy iterator over a graph in dependency order. See
/// [`ResourceGraph::topological_order`].
pub struct TopologicalOrder<'a> {
    graph: &'a ResourceGraph,
    /// Remaining unsatisfied dependencies per blocked node.
    blocked_by: BTreeMap<&'a LogicalName, BTreeSet<LogicalName>>,
    /// Nodes with no unsatisfied dependencies, ordered by name.
    ready: BTreeSet<&'a LogicalName>,
}

impl<'a> Iterator for TopologicalOrder<'a> {
    type Item = &'a ResourceNode;

    fn next(&mut self) -> Option<Self::Item> {
        let name = self.ready.iter().next().copied()?;
        self.ready.remove(name);
        let mut unblocked = Vec::new();
        for (blocked, deps) in self.blocked_by.iter_mut() {
            deps.remove(name);
            if deps.is_empty() {
                unblocked.push(*blocked);
            }
        }
        for b in unblocked {
            self.blocked_by.remove(b);
            self.ready.insert(b);
        }
        Some(&self.graph.nodes[name])
    }
}
