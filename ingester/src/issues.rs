//! The issue aggregate repository.
//!
//! One row per `(project, fingerprint)`. Ingest creates the row on the first
//! occurrence and bumps `last_seen_at`/`event_count` afterwards; lifecycle
//! status only ever changes through [`IssueRepository::set_status`].

use async_trait::async_trait;
use data_types::{Issue, IssueStatus, WideEvent};
use parking_lot::Mutex;
use snafu::Snafu;
use std::collections::HashMap;
use std::fmt::Debug;

/// Errors surfaced by issue repositories.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Event carries no fingerprint"))]
    NoFingerprint,
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Storage of issue aggregates.
///
/// The organization/project relational model around issues is an external
/// collaborator; only ids cross this boundary.
#[async_trait]
pub trait IssueRepository: Debug + Send + Sync + 'static {
    /// Creates the issue for the event's fingerprint or folds the event into
    /// the existing one. Returns the resulting aggregate.
    async fn upsert_from_event(&self, event: &WideEvent) -> Result<Issue>;

    /// The issue for a fingerprint, if any.
    async fn get(&self, project_id: &str, fingerprint: &str) -> Result<Option<Issue>>;

    /// Operator-driven status change. Returns the updated issue, or `None`
    /// if the fingerprint is unknown.
    async fn set_status(
        &self,
        project_id: &str,
        fingerprint: &str,
        status: IssueStatus,
    ) -> Result<Option<Issue>>;

    /// Issues of a project, most recently seen first.
    async fn list_for_project(&self, project_id: &str, limit: usize) -> Result<Vec<Issue>>;
}

/// Display title of the issue an event belongs to.
fn issue_title(event: &WideEvent) -> String {
    event
        .exception_type
        .as_deref()
        .or(event.message.as_deref())
        .or(event.metric_name.as_deref())
        .or(event.operation.as_deref())
        .unwrap_or("untitled")
        .to_string()
}

/// In-memory [`IssueRepository`].
#[derive(Debug, Default)]
pub struct MemIssueRepository {
    issues: Mutex<HashMap<(String, String), Issue>>,
}

impl MemIssueRepository {
    /// New empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IssueRepository for MemIssueRepository {
    async fn upsert_from_event(&self, event: &WideEvent) -> Result<Issue> {
        let fingerprint = event.fingerprint.clone().ok_or(Error::NoFingerprint)?;
        let key = (event.project_id.clone(), fingerprint.clone());

        let mut issues = self.issues.lock();
        let issue = issues
            .entry(key)
            .and_modify(|issue| {
                issue.first_seen_at = issue.first_seen_at.min(event.timestamp);
                issue.last_seen_at = issue.last_seen_at.max(event.timestamp);
                issue.event_count += 1;
                issue.severity = event.severity.or(issue.severity);
            })
            .or_insert_with(|| Issue {
                project_id: event.project_id.clone(),
                fingerprint,
                first_seen_at: event.timestamp,
                last_seen_at: event.timestamp,
                event_count: 1,
                status: IssueStatus::Open,
                event_type: event.event_type,
                severity: event.severity,
                title: issue_title(event),
            });
        Ok(issue.clone())
    }

    async fn get(&self, project_id: &str, fingerprint: &str) -> Result<Option<Issue>> {
        let key = (project_id.to_string(), fingerprint.to_string());
        Ok(self.issues.lock().get(&key).cloned())
    }

    async fn set_status(
        &self,
        project_id: &str,
        fingerprint: &str,
        status: IssueStatus,
    ) -> Result<Option<Issue>> {
        let key = (project_id.to_string(), fingerprint.to_string());
        let mut issues = self.issues.lock();
        Ok(issues.get_mut(&key).map(|issue| {
            issue.status = status;
            issue.clone()
        }))
    }

    async fn list_for_project(&self, project_id: &str, limit: usize) -> Result<Vec<Issue>> {
        let issues = self.issues.lock();
        let mut result: Vec<Issue> = issues
            .values()
            .filter(|issue| issue.project_id == project_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            b.last_seen_at
                .cmp(&a.last_seen_at)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        result.truncate(limit);
        Ok(result)
    }
}
