//! The issue aggregate: one row per `(project, fingerprint)`.

use crate::{EventType, Severity};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Lifecycle status of an issue. Transitions are manual; ingest never changes
/// the status of an existing issue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    /// Newly created or reopened by an operator.
    #[default]
    Open,
    /// Marked fixed by an operator.
    Resolved,
    /// Muted by an operator.
    Ignored,
}

impl IssueStatus {
    /// The lowercase wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
            Self::Ignored => "ignored",
        }
    }
}

impl Display for IssueStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate of all events sharing a fingerprint within one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    /// Owning project.
    pub project_id: String,
    /// The grouping fingerprint.
    pub fingerprint: String,
    /// Timestamp (ms) of the first observed occurrence.
    pub first_seen_at: i64,
    /// Timestamp (ms) of the latest observed occurrence.
    pub last_seen_at: i64,
    /// Number of occurrences; at least 1.
    pub event_count: u64,
    /// Operator-managed lifecycle status.
    pub status: IssueStatus,
    /// Kind of the underlying events.
    pub event_type: EventType,
    /// Severity of the latest occurrence, if classified.
    pub severity: Option<Severity>,
    /// Display title derived from the first occurrence.
    pub title: String,
}
