//! State carried in the shared cache for one asynchronous query.

use crate::{Facet, QueryRequest, QueryResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Lifecycle status of an asynchronous query.
///
/// Transitions follow `pending → in_progress → (completed | failed | cancelled)`
/// with no back-edges; terminal states never mutate again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// Submitted, not yet picked up by an executor.
    Pending,
    /// An executor is scanning partitions.
    InProgress,
    /// Result stored.
    Completed,
    /// Execution failed; `error` carries the message.
    Failed,
    /// Cancelled cooperatively.
    Cancelled,
}

impl QueryStatus {
    /// Whether the status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The snake_case wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Display for QueryStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one deferred facet batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacetBatchStatus {
    /// Enqueued, not yet computed.
    Pending,
    /// Facets appended.
    Completed,
    /// Computation failed; `error` carries the message.
    Failed,
}

/// State of one deferred facet batch inside [`AsyncQueryState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetBatchState {
    /// Batch status; `pending → (completed | failed)` at most once.
    pub status: FacetBatchStatus,
    /// The batch's facet contribution, set on completion.
    #[serde(default)]
    pub facets: Vec<Facet>,
    /// Failure message, set on failure.
    #[serde(default)]
    pub error: Option<String>,
}

impl FacetBatchState {
    /// A freshly initialized pending batch.
    pub fn pending() -> Self {
        Self {
            status: FacetBatchStatus::Pending,
            facets: vec![],
            error: None,
        }
    }
}

/// Everything the lifecycle subsystem knows about one query, as stored in the
/// shared cache under the query id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncQueryState {
    /// UUIDv7 identity of the query.
    pub query_id: String,
    /// Lifecycle status.
    pub status: QueryStatus,
    /// Progress percentage in `[0, 100]`, monotonically non-decreasing.
    pub progress: u8,
    /// The submitted request.
    pub query_request: QueryRequest,
    /// Submitting user.
    pub user_id: String,
    /// Organization scope.
    pub organization_id: String,
    /// The result, present once `status == completed`.
    #[serde(default)]
    pub result: Option<QueryResult>,
    /// Failure message, present once `status == failed`.
    #[serde(default)]
    pub error: Option<String>,
    /// Set at most once, and only while non-terminal.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Submission timestamp, ms since epoch.
    pub created_at: i64,
    /// Timestamp of the latest mutation, ms since epoch.
    pub updated_at: i64,
    /// Set when a terminal status is reached.
    #[serde(default)]
    pub completed_at: Option<i64>,
    /// Deferred facet batches, keyed by batch id; initialized exactly once.
    #[serde(default)]
    pub facet_batches: BTreeMap<String, FacetBatchState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!QueryStatus::Pending.is_terminal());
        assert!(!QueryStatus::InProgress.is_terminal());
        assert!(QueryStatus::Completed.is_terminal());
        assert!(QueryStatus::Failed.is_terminal());
        assert!(QueryStatus::Cancelled.is_terminal());
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = AsyncQueryState {
            query_id: "q1".into(),
            status: QueryStatus::Pending,
            progress: 0,
            query_request: QueryRequest::default(),
            user_id: "u1".into(),
            organization_id: "o1".into(),
            result: None,
            error: None,
            cancel_requested: false,
            created_at: 1,
            updated_at: 1,
            completed_at: None,
            facet_batches: BTreeMap::new(),
        };
        state
            .facet_batches
            .insert("device".into(), FacetBatchState::pending());

        let json = serde_json::to_string(&state).unwrap();
        let back: AsyncQueryState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert!(json.contains("\"queryId\""));
        assert!(json.contains("\"in_progress\"") || json.contains("\"pending\""));
    }
}
