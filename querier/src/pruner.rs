//! Candidate partition enumeration.
//!
//! Specified tenant dimensions become literal path segments; unspecified ones
//! are enumerated by listing the corresponding directory level. Date ranges
//! are expanded one day at a time so the store only ever lists directories
//! that could hold matching rows.

use chrono::NaiveDate;
use data_types::EventType;
use observability_deps::tracing::debug;
use snafu::{ResultExt, Snafu};
use storage::{dates_in_range, ObjectBackend, PartitionPath};

/// Errors surfaced during partition enumeration.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Failed to enumerate partitions: {}", source))]
    Enumerate { source: storage::Error },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Which slice of the partition space a read touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSelector {
    /// Literal organization, or every organization.
    pub organization_id: Option<String>,
    /// Literal project, or every project.
    pub project_id: Option<String>,
    /// Literal event type, or every type.
    pub event_type: Option<EventType>,
    /// Inclusive range start, ms since epoch.
    pub from_millis: Option<i64>,
    /// Inclusive range end, ms since epoch (extends to the end of its day).
    pub to_millis: Option<i64>,
}

impl PartitionSelector {
    /// Whether the range is inverted and can never match.
    pub fn is_empty_range(&self) -> bool {
        matches!(
            (self.from_millis, self.to_millis),
            (Some(from), Some(to)) if to < from
        )
    }
}

/// Enumerates the partition directories a selector may touch, sorted for
/// deterministic scan order.
pub async fn candidate_partitions(
    backend: &ObjectBackend,
    selector: &PartitionSelector,
) -> Result<Vec<PartitionPath>> {
    if selector.is_empty_range() {
        return Ok(vec![]);
    }

    let organizations = expand_level(
        backend,
        "",
        "organization_id=",
        selector.organization_id.as_deref(),
    )
    .await?;

    let mut projects = vec![];
    for organization in &organizations {
        projects
            .extend(expand_level(backend, organization, "project_id=", selector.project_id.as_deref()).await?);
    }

    let mut typed = vec![];
    for project in &projects {
        typed.extend(
            expand_level(
                backend,
                project,
                "event_type=",
                selector.event_type.map(|t| t.as_str()),
            )
            .await?,
        );
    }

    let mut partitions = vec![];
    for prefix in &typed {
        match (selector.from_millis, selector.to_millis) {
            // a fully bounded range is expanded without listing
            (Some(from), Some(to)) => {
                for date in dates_in_range(from, to) {
                    let path = format!("{prefix}/dt={}", date.format("%Y-%m-%d"));
                    if let Ok(partition) = PartitionPath::parse(&path) {
                        partitions.push(partition);
                    }
                }
            }
            // a half-open range lists what exists and keeps the overlap
            (from, to) => {
                let from_date = from.map(data_types::date_of_timestamp_millis);
                let to_date = to.map(data_types::date_of_timestamp_millis);
                for dir in backend.list_dirs(prefix).await.context(EnumerateSnafu)? {
                    let Ok(partition) = PartitionPath::parse(&dir) else {
                        continue;
                    };
                    if in_date_bounds(partition.date, from_date, to_date) {
                        partitions.push(partition);
                    }
                }
            }
        }
    }

    partitions.sort();
    debug!(candidates = partitions.len(), "enumerated candidate partitions");
    Ok(partitions)
}

fn in_date_bounds(date: NaiveDate, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
    from.is_none_or(|f| date >= f) && to.is_none_or(|t| date <= t)
}

/// One enumeration level: a literal segment when the dimension is specified,
/// a directory listing otherwise.
async fn expand_level(
    backend: &ObjectBackend,
    prefix: &str,
    segment_prefix: &str,
    literal: Option<&str>,
) -> Result<Vec<String>> {
    match literal {
        Some(value) => {
            let path = if prefix.is_empty() {
                format!("{segment_prefix}{value}")
            } else {
                format!("{prefix}/{segment_prefix}{value}")
            };
            Ok(vec![path])
        }
        None => {
            let dirs = backend.list_dirs(prefix).await.context(EnumerateSnafu)?;
            Ok(dirs
                .into_iter()
                .filter(|dir| {
                    storage::file_name_of(dir).starts_with(segment_prefix)
                })
                .collect())
        }
    }
}
