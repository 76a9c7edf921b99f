//! Computing the change set: declared graph vs. recorded state.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde_json::Value;

use opsgraph_core::{
    Action, ChangeEntry, ChangeSet, LogicalName, OutputRef, ResourceGraph, ResourceNode,
    StateRecord,
};

/// Compare the declared graph against the recorded state.
///
/// Policy per node: absent from state means create; present with differing
/// declared properties means update; identical means no-op. Records whose
/// node has left the graph become deletes, appended after the graph's
/// entries. Given identical inputs the result is identical, byte for byte.
///
/// The graph must have passed [`ResourceGraph::validate`].
pub fn diff(
    graph: &ResourceGraph,
    state: &BTreeMap<LogicalName, StateRecord>,
) -> Result<ChangeSet> {
    let mut entries = Vec::with_capacity(graph.len());
    let mut decided: BTreeMap<LogicalName, Action> = BTreeMap::new();

    // Dependency-first: a node's references can only be judged once the
    // action for each referenced node is known.
    for node in graph.topological_order() {
        let action = match state.get(&node.name) {
            None => Action::Create,
            Some(record) => {
                if record.type_ != node.type_ {
                    // A type change is a different resource wearing the same
                    // name. Refusing is safer than guessing a replacement.
                    bail!(
                        "resource {} changed type from {} to {}; remove it and re-declare instead",
                        node.name,
                        record.type_,
                        node.type_
                    );
                }
                match resolve_against_state(node, state, &decided) {
                    // A reference into a resource that will itself change is
                    // pending; we cannot prove this node unchanged, so it is
                    // conservatively an update and the executor resolves the
                    // reference from fresh outputs.
                    Resolution::Pending => Action::Update,
                    Resolution::Resolved(inputs) => {
                        if inputs == record.inputs {
                            Action::NoOp
                        } else {
                            Action::Update
                        }
                    }
                }
            }
        };
        decided.insert(node.name.clone(), action);
        entries.push(ChangeEntry {
            name: node.name.clone(),
            action,
            before: state.get(&node.name).map(|r| r.inputs.clone()),
            after: Some(node.properties.clone()),
        });
    }

    // Records with no declared node left: tear down. Ordered by name here;
    // the executor sequences them against each other in reverse dependency
    // order using the recorded dependencies.
    for (name, record) in state {
        if !graph.contains(name) {
            entries.push(ChangeEntry {
                name: name.clone(),
                action: Action::Delete,
                before: Some(record.inputs.clone()),
                after: None,
            });
        }
    }

    Ok(ChangeSet::new(entries))
}

enum Resolution {
    Resolved(BTreeMap<String, Value>),
    Pending,
}

/// Resolve a node's declared properties using recorded outputs, as far as
/// the already-decided actions allow. Only a dependency that is a no-op has
/// trustworthy recorded outputs.
fn resolve_against_state(
    node: &ResourceNode,
    state: &BTreeMap<LogicalName, StateRecord>,
    decided: &BTreeMap<LogicalName, Action>,
) -> Resolution {
    let mut resolved = BTreeMap::new();
    for (key, value) in &node.properties {
        let lookup = |r: &OutputRef| -> Option<Value> {
            match decided.get(&r.resource) {
                Some(Action::NoOp) => state
                    .get(&r.resource)
                    .and_then(|rec| rec.outputs.get(&r.output).cloned()),
                _ => None,
            }
        };
        match value.resolve(lookup) {
            Some(v) => {
                resolved.insert(key.clone(), v);
            }
            None => return Resolution::Pending,
        }
    }
    Resolution::Resolved(resolved)
}
