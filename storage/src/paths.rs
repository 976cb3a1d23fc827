//! The partition layout grammar.
//!
//! This module is the single authority for both the directory grammar
//! (`organization_id=…/project_id=…/event_type=…/dt=YYYY-MM-DD`) and the two
//! file-name classes inside a partition:
//!
//! - `events_<HHMMSS>_<uuidv7>.parquet`: small, written live
//! - `block_<HHMMSS>_<idx2>_<uuidv7>.parquet`: large, written by compaction
//!
//! Compaction correctness depends on the two classes never sharing a name, so
//! nothing outside this module builds or parses either form.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use data_types::{date_of_timestamp_millis, EventType, PartitionKey};
use snafu::{OptionExt, Snafu};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Extension of all data files.
pub const DATA_FILE_EXTENSION: &str = "parquet";

/// Error parsing a partition directory path.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(display("'{}' is not a valid partition path", path))]
pub struct InvalidPartitionPath {
    /// The offending input.
    pub path: String,
}

/// A partition directory, relative to the backend root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionPath {
    /// Organization segment value.
    pub organization_id: String,
    /// Project segment value.
    pub project_id: String,
    /// Event-type segment value.
    pub event_type: EventType,
    /// The `dt=` day.
    pub date: NaiveDate,
}

impl PartitionPath {
    /// The directory of a partition key.
    pub fn new(key: &PartitionKey) -> Self {
        Self {
            organization_id: key.organization_id.clone(),
            project_id: key.project_id.clone(),
            event_type: key.event_type,
            date: key.date,
        }
    }

    /// Parses `organization_id=…/project_id=…/event_type=…/dt=…`.
    pub fn parse(path: &str) -> Result<Self, InvalidPartitionPath> {
        let mut segments = path.trim_matches('/').split('/');
        let organization_id = segment(segments.next(), "organization_id=").context(
            InvalidPartitionPathSnafu { path },
        )?;
        let project_id =
            segment(segments.next(), "project_id=").context(InvalidPartitionPathSnafu { path })?;
        let event_type: EventType = segment(segments.next(), "event_type=")
            .and_then(|s| s.parse().ok())
            .context(InvalidPartitionPathSnafu { path })?;
        let date: NaiveDate = segment(segments.next(), "dt=")
            .and_then(|s| s.parse().ok())
            .context(InvalidPartitionPathSnafu { path })?;
        if segments.next().is_some() {
            return Err(InvalidPartitionPath {
                path: path.to_string(),
            });
        }
        Ok(Self {
            organization_id: organization_id.to_string(),
            project_id: project_id.to_string(),
            event_type,
            date,
        })
    }

    /// The partition key this directory encodes.
    pub fn key(&self) -> PartitionKey {
        PartitionKey {
            organization_id: self.organization_id.clone(),
            project_id: self.project_id.clone(),
            event_type: self.event_type,
            date: self.date,
        }
    }

    /// Path of a file inside this partition.
    pub fn file_path(&self, file_name: &str) -> String {
        format!("{self}/{file_name}")
    }
}

impl Display for PartitionPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "organization_id={}/project_id={}/event_type={}/dt={}",
            self.organization_id,
            self.project_id,
            self.event_type,
            self.date.format("%Y-%m-%d"),
        )
    }
}

fn segment<'a>(segment: Option<&'a str>, prefix: &str) -> Option<&'a str> {
    segment
        .and_then(|s| s.strip_prefix(prefix))
        .filter(|s| !s.is_empty())
}

/// Class of a data file inside a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFile {
    /// A live-written event file.
    Events {
        /// Time-of-day tag from the name.
        time_of_day: NaiveTime,
        /// The file's unique id.
        id: Uuid,
    },
    /// A compacted block file.
    Block {
        /// Time-of-day tag from the name.
        time_of_day: NaiveTime,
        /// Chunk index within its compaction run.
        index: u8,
        /// The file's unique id.
        id: Uuid,
    },
}

impl DataFile {
    /// Whether this is a live-written `events_*` file.
    pub fn is_events(&self) -> bool {
        matches!(self, Self::Events { .. })
    }
}

/// Builds the name of a live-written event file.
pub fn events_file_name(at: DateTime<Utc>, id: Uuid) -> String {
    format!(
        "events_{}_{}.{}",
        at.format("%H%M%S"),
        id,
        DATA_FILE_EXTENSION
    )
}

/// Builds the name of a compacted block file.
pub fn block_file_name(at: DateTime<Utc>, index: u8, id: Uuid) -> String {
    format!(
        "block_{}_{:02}_{}.{}",
        at.format("%H%M%S"),
        index,
        id,
        DATA_FILE_EXTENSION
    )
}

/// Parses a file name into its class, or `None` for foreign files.
pub fn parse_data_file_name(name: &str) -> Option<DataFile> {
    let stem = name.strip_suffix(&format!(".{DATA_FILE_EXTENSION}"))?;
    if let Some(rest) = stem.strip_prefix("events_") {
        let (time, id) = rest.split_once('_')?;
        Some(DataFile::Events {
            time_of_day: NaiveTime::parse_from_str(time, "%H%M%S").ok()?,
            id: id.parse().ok()?,
        })
    } else if let Some(rest) = stem.strip_prefix("block_") {
        let mut parts = rest.splitn(3, '_');
        let time = NaiveTime::parse_from_str(parts.next()?, "%H%M%S").ok()?;
        let index = parts.next()?.parse().ok()?;
        let id = parts.next()?.parse().ok()?;
        Some(DataFile::Block {
            time_of_day: time,
            index,
            id,
        })
    } else {
        None
    }
}

/// The file-name portion of an object path.
pub fn file_name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Enumerates the UTC days covered by an inclusive millisecond range.
///
/// The end bound extends to the end of its day; `to < from` yields nothing.
pub fn dates_in_range(from_millis: i64, to_millis: i64) -> Vec<NaiveDate> {
    if to_millis < from_millis {
        return vec![];
    }
    let mut date = date_of_timestamp_millis(from_millis);
    let last = date_of_timestamp_millis(to_millis);
    let mut dates = vec![];
    while date <= last {
        dates.push(date);
        date = match date.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    dates
}
