//! Core data model for the opsgraph reconciler.
//!
//! This crate defines the vocabulary shared by the engine and the provider
//! interface: resource nodes and graphs, property values with cross-resource
//! references, state records, change sets and reconciliation reports.
//! It contains no I/O and no provider logic.

pub mod change;
pub mod graph;
pub mod report;
pub mod state;
pub mod value;

pub use change::{Action, ChangeEntry, ChangeSet};
pub use graph::{GraphError, LogicalName, ResourceGraph, ResourceNode};
pub use report::{EntryReport, EntryStatus, Report, RunOutcome};
pub use state::{PhysicalId, StateRecord};
pub use value::{OutputRef, PropertyValue};
