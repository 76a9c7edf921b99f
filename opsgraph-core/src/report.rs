//! Reconciliation reports: the structured outcome of one run.
//!
//! The report always enumerates every entry's terminal status, even on
//! total failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::change::Action;
use crate::graph::LogicalName;

/// Terminal status of one change-set entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Applied and committed to state.
    Succeeded,
    /// Nothing to do; declared and recorded state already match.
    NoOp,
    /// Provider operation failed (after retries, or non-transiently).
    Failed,
    /// Not attempted because an ancestor failed or was skipped.
    Skipped,
    /// Not attempted because the run was cancelled before it started.
    Cancelled,
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntryStatus::Succeeded => "succeeded",
            EntryStatus::NoOp => "no-op",
            EntryStatus::Failed => "failed",
            EntryStatus::Skipped => "skipped",
            EntryStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryReport {
    pub name: LogicalName,
    pub action: Action,
    pub status: EntryStatus,
    /// Error chain for failed entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// For skipped entries: the ancestor whose failure blocked this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_on: Option<LogicalName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Run-level outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every entry succeeded or was a no-op.
    Complete,
    /// Some entries failed or were skipped. Not fatal to the process, but
    /// surfaced to the caller as a non-zero outcome.
    PartialFailure,
    /// The run was cancelled; some entries never started.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One entry per change-set entry, ordered by logical name.
    pub entries: Vec<EntryReport>,
}

impl Report {
    /// Derive the run outcome from the entry statuses.
    pub fn outcome_of(entries: &[EntryReport]) -> RunOutcome {
        let any = |s: EntryStatus| entries.iter().any(|e| e.status == s);
        if any(EntryStatus::Failed) || any(EntryStatus::Skipped) {
            RunOutcome::PartialFailure
        } else if any(EntryStatus::Cancelled) {
            RunOutcome::Interrupted
        } else {
            RunOutcome::Complete
        }
    }

    pub fn is_complete(&self) -> bool {
        self.outcome == RunOutcome::Complete
    }

    pub fn count(&self, status: EntryStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    pub fn get(&self, name: &LogicalName) -> Option<&EntryReport> {
        self.entries.iter().find(|e| &e.name == name)
    }
}
