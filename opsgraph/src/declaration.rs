//! Declaration input: the serialized description of a resource graph,
//! consumed at the start of a reconciliation run.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use opsgraph_core::{LogicalName, PropertyValue, ResourceGraph, ResourceNode};

/// The on-disk form of a declared graph.
///
/// ```json
/// {
///   "resources": {
///     "bucket": { "type": "file", "properties": { "path": "b.txt", "contents": "hi" } },
///     "index": {
///       "type": "file",
///       "properties": { "path": { "$from": { "resource": "bucket", "output": "path" } },
///                       "contents": "see bucket" },
///       "depends_on": ["bucket"]
///     }
///   }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    pub resources: BTreeMap<LogicalName, DeclaredResource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredResource {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<LogicalName>,
}

impl Declaration {
    pub fn from_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("could not parse declaration")
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("could not read declaration {}", path.display()))?;
        Self::from_str(&contents)
            .with_context(|| format!("in declaration {}", path.display()))
    }

    /// Build the resource graph. Duplicate names cannot occur here (the map
    /// key is the name), but the graph is not yet validated; call
    /// [`ResourceGraph::validate`] before diffing.
    pub fn to_graph(&self) -> Result<ResourceGraph> {
        let mut graph = ResourceGraph::new();
        for (name, declared) in &self.resources {
            let node = ResourceNode {
                name: name.clone(),
                type_: declared.type_.clone(),
                properties: declared.properties.clone(),
                depends_on: declared.depends_on.clone(),
            };
            graph.add(node)?;
        }
        Ok(graph)
    }
}
