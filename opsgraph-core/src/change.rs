//! Change sets: the computed difference between the declared graph and the
//! recorded state. Computed fresh on every run, never persisted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::LogicalName;
use crate::value::PropertyValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
    NoOp,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::NoOp => "no-op",
        };
        write!(f, "{}", s)
    }
}

/// One planned action.
///
/// `before` holds the last-applied input properties (resolved literals),
/// `after` the declared properties, which may still contain references to
/// outputs that only exist once a dependency has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub name: LogicalName,
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<BTreeMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<BTreeMap<String, PropertyValue>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    entries: Vec<ChangeEntry>,
}

impl ChangeSet {
    pub fn new(entries: Vec<ChangeEntry>) -> Self {
        ChangeSet { entries }
    }

    pub fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }

    pub fn get(&self, name: &LogicalName) -> Option<&ChangeEntry> {
        self.entries.iter().find(|e| &e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when nothing would change: every entry is a no-op.
    pub fn is_settled(&self) -> bool {
        self.entries.iter().all(|e| e.action == Action::NoOp)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_means_all_noop() {
        let cs = ChangeSet::new(vec![
            ChangeEntry {
                name: LogicalName::new("a"),
                action: Action::NoOp,
                before: None,
                after: None,
            },
            ChangeEntry {
                name: LogicalName::new("b"),
                action: Action::NoOp,
                before: None,
                after: None,
            },
        ]);
        assert!(cs.is_settled());

        let cs = ChangeSet::new(vec![ChangeEntry {
            name: LogicalName::new("a"),
            action: Action::Create,
            before: None,
            after: None,
        }]);
        assert!(!cs.is_settled());
        assert!(ChangeSet::default().is_settled());
    }
}
