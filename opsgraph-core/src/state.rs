//! Last-known provider-side state, as recorded after successful applies.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::LogicalName;

/// A provider-assigned identifier for the real resource behind a logical
/// name. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhysicalId(String);

impl PhysicalId {
    pub fn new(id: impl Into<String>) -> Self {
        PhysicalId(id.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PhysicalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What we know about one resource from its last successful apply.
///
/// Created on first successful apply, rewritten on every later one, removed
/// when the resource is torn down. Input properties are stored fully
/// resolved: references have been replaced by the values they had at apply
/// time, so the differ can compare without re-resolving history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    #[serde(rename = "type")]
    pub type_: String,
    pub physical_id: PhysicalId,
    pub inputs: BTreeMap<String, Value>,
    pub outputs: BTreeMap<String, Value>,
    /// Dependencies the resource had when it was applied. Needed to order
    /// teardown after the node has left the declared graph.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<LogicalName>,
}
