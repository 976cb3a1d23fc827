//! Projected reads over the partitioned store.
//!
//! The reader prunes partitions first (directory grammar), then row groups
//! (parquet timestamp statistics), then rows (timestamp range and attribute
//! filters). Unreadable files are tolerated: a read only fails as a whole if
//! every candidate file failed.

use crate::{candidate_partitions, matches_all, PartitionSelector};
use async_stream::try_stream;
use bytes::Bytes;
use chrono::NaiveDate;
use data_types::{date_of_timestamp_millis, EventFilter, WideEvent};
use futures::stream::BoxStream;
use futures::StreamExt;
use observability_deps::tracing::{debug, warn};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ProjectionMask;
use parquet::file::statistics::Statistics;
use snafu::{ResultExt, Snafu};
use storage::{parse_data_file_name, file_name_of, ObjectBackend, PartitionPath};

/// Errors surfaced by the reader.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Failed to enumerate partitions: {}", source))]
    Prune { source: crate::pruner::Error },

    #[snafu(display("Every candidate file failed to read"))]
    AllFilesFailed,
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Parameters of one read.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Which slice of the partition space to touch.
    pub selector: PartitionSelector,
    /// Conjunctive row filters.
    pub filters: Vec<EventFilter>,
    /// Column projection; `None` reads every column.
    pub columns: Option<Vec<String>>,
    /// Stop after this many rows.
    pub limit: Option<usize>,
}

impl ReadOptions {
    /// The columns actually read from files: the requested projection widened
    /// by every filtered attribute plus `timestamp`.
    ///
    /// Filters on `fingerprint`, `trace_id` and `span_id` (like any filtered
    /// attribute) therefore keep their column in the projection even when the
    /// caller did not ask for it.
    pub fn effective_columns(&self) -> Option<Vec<String>> {
        let requested = self.columns.as_ref()?;
        let mut names: Vec<&str> = requested.iter().map(String::as_str).collect();
        names.push("timestamp");
        for filter in &self.filters {
            names.push(filter.attribute.as_str());
        }
        // canonical order, deduplicated, unknown names dropped
        let mut columns: Vec<String> = event_schema::COLUMNS
            .iter()
            .map(|(name, _)| *name)
            .filter(|name| names.contains(name))
            .map(str::to_string)
            .collect();
        columns.dedup();
        Some(columns)
    }

    /// Inclusive row-level timestamp bounds; the end bound extends to the end
    /// of its UTC day.
    pub fn row_bounds(&self) -> (i64, i64) {
        let from = self.selector.from_millis.unwrap_or(i64::MIN);
        let to = match self.selector.to_millis {
            Some(to) => end_of_day_millis(date_of_timestamp_millis(to)),
            None => i64::MAX,
        };
        (from, to)
    }
}

fn end_of_day_millis(date: NaiveDate) -> i64 {
    match date.succ_opt() {
        Some(next) => {
            next.and_hms_opt(0, 0, 0)
                .expect("midnight exists")
                .and_utc()
                .timestamp_millis()
                - 1
        }
        None => i64::MAX,
    }
}

/// Result of scanning one partition.
#[derive(Debug, Default)]
pub struct PartitionScan {
    /// Matching rows, with partition columns synthesized from the path.
    pub events: Vec<WideEvent>,
    /// Files the scan attempted to read.
    pub files_seen: usize,
    /// Files that could not be listed or read.
    pub files_failed: usize,
}

/// Reads wide events back out of the partitioned store.
#[derive(Debug, Clone)]
pub struct EventReader {
    backend: ObjectBackend,
}

impl EventReader {
    /// New reader over the given backend.
    pub fn new(backend: ObjectBackend) -> Self {
        Self { backend }
    }

    /// The partitions a read would touch, in scan order.
    pub async fn partitions(&self, options: &ReadOptions) -> Result<Vec<PartitionPath>> {
        candidate_partitions(&self.backend, &options.selector)
            .await
            .context(PruneSnafu)
    }

    /// Scans one partition, applying projection, timestamp bounds and filters.
    ///
    /// Per-file problems are logged and reflected in the counters instead of
    /// failing the scan; files created after the listing simply do not appear.
    pub async fn scan_partition(
        &self,
        partition: &PartitionPath,
        options: &ReadOptions,
    ) -> PartitionScan {
        let dir = partition.to_string();
        let mut scan = PartitionScan::default();

        let files = match self.backend.list(&dir).await {
            Ok(files) => files,
            Err(error) => {
                warn!(%dir, %error, "failed to list partition, skipping");
                scan.files_seen = 1;
                scan.files_failed = 1;
                return scan;
            }
        };

        let mut paths: Vec<String> = files
            .into_iter()
            .map(|f| f.location)
            .filter(|location| parse_data_file_name(file_name_of(location)).is_some())
            .collect();
        paths.sort();

        let columns = options.effective_columns();
        let bounds = options.row_bounds();

        for path in paths {
            scan.files_seen += 1;
            let data = match self.backend.read(&path).await {
                Ok(data) => data,
                Err(error) => {
                    warn!(%path, %error, "failed to read file, skipping");
                    scan.files_failed += 1;
                    continue;
                }
            };
            let rows = match decode_rows(data, columns.as_deref(), bounds) {
                Ok(rows) => rows,
                Err(error) => {
                    warn!(%path, %error, "failed to decode file, skipping");
                    scan.files_failed += 1;
                    continue;
                }
            };
            for mut event in rows {
                // partition columns are authoritative from the path, whether
                // or not they were stored in the projection
                event.organization_id = Some(partition.organization_id.clone());
                event.project_id = partition.project_id.clone();
                event.event_type = partition.event_type;
                if matches_all(&event, &options.filters) {
                    scan.events.push(event);
                }
            }
        }

        debug!(
            %dir,
            files = scan.files_seen,
            failed = scan.files_failed,
            rows = scan.events.len(),
            "scanned partition",
        );
        scan
    }

    /// Lazily streams matching rows across all candidate partitions.
    ///
    /// The stream is finite, single-pass and stops early once `limit` rows
    /// have been produced.
    pub fn stream_events(&self, options: ReadOptions) -> BoxStream<'_, Result<WideEvent>> {
        try_stream! {
            let partitions = self.partitions(&options).await?;
            let mut files_seen = 0;
            let mut files_failed = 0;
            let mut yielded = 0usize;

            'partitions: for partition in &partitions {
                let scan = self.scan_partition(partition, &options).await;
                files_seen += scan.files_seen;
                files_failed += scan.files_failed;
                for event in scan.events {
                    yield event;
                    yielded += 1;
                    if options.limit.is_some_and(|limit| yielded >= limit) {
                        break 'partitions;
                    }
                }
            }

            if files_seen > 0 && files_failed == files_seen {
                Err(Error::AllFilesFailed)?;
            }
        }
        .boxed()
    }

    /// Materializes a read into a vector.
    pub async fn read_events(&self, options: ReadOptions) -> Result<Vec<WideEvent>> {
        let mut stream = self.stream_events(options);
        let mut events = vec![];
        while let Some(event) = stream.next().await {
            events.push(event?);
        }
        Ok(events)
    }

    /// Projected read: only the named columns are decoded (plus whatever the
    /// filters need), everything else stays null.
    pub async fn read_events_with_columns(
        &self,
        selector: PartitionSelector,
        columns: Vec<String>,
        filters: Vec<EventFilter>,
    ) -> Result<Vec<WideEvent>> {
        self.read_events(ReadOptions {
            selector,
            filters,
            columns: Some(columns),
            limit: None,
        })
        .await
    }

    /// Counts matching rows without materializing them.
    pub async fn count_events(
        &self,
        selector: PartitionSelector,
        filters: Vec<EventFilter>,
    ) -> Result<u64> {
        let columns = count_projection(&filters);
        let options = ReadOptions {
            selector,
            filters,
            columns: Some(columns),
            limit: None,
        };
        let mut stream = self.stream_events(options);
        let mut total = 0;
        while let Some(event) = stream.next().await {
            event?;
            total += 1;
        }
        Ok(total)
    }

    /// The most recent events of one fingerprint, eagerly materialized and
    /// sorted by timestamp descending.
    pub async fn events_by_fingerprint(
        &self,
        fingerprint: &str,
        selector: PartitionSelector,
        limit: usize,
    ) -> Result<Vec<WideEvent>> {
        let options = ReadOptions {
            selector,
            filters: vec![EventFilter::new(
                "fingerprint",
                data_types::FilterOp::Eq,
                fingerprint,
            )],
            columns: None,
            limit: None,
        };
        let mut events = self.read_events(options).await?;
        events.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        events.truncate(limit);
        Ok(events)
    }
}

fn count_projection(filters: &[EventFilter]) -> Vec<String> {
    let mut columns = vec!["event_id".to_string(), "timestamp".to_string()];
    columns.extend(filters.iter().map(|f| f.attribute.clone()));
    columns
}

/// Decodes a parquet buffer with column projection, pruning row groups whose
/// timestamp statistics fall outside the bounds, then filtering rows.
fn decode_rows(
    data: Bytes,
    columns: Option<&[String]>,
    bounds: (i64, i64),
) -> std::result::Result<Vec<WideEvent>, Box<dyn std::error::Error + Send + Sync>> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data)?;

    let timestamp_leaf = event_schema::column_index("timestamp").expect("timestamp is a column");
    let keep: Vec<usize> = builder
        .metadata()
        .row_groups()
        .iter()
        .enumerate()
        .filter(|(_, row_group)| {
            // keep a group unless its stats prove it cannot overlap
            match row_group.column(timestamp_leaf).statistics() {
                Some(Statistics::Int64(stats)) => match (stats.min_opt(), stats.max_opt()) {
                    (Some(min), Some(max)) => *max >= bounds.0 && *min <= bounds.1,
                    _ => true,
                },
                _ => true,
            }
        })
        .map(|(index, _)| index)
        .collect();

    let mut builder = builder.with_row_groups(keep);
    if let Some(columns) = columns {
        let leaves: Vec<usize> = columns
            .iter()
            .filter_map(|name| event_schema::column_index(name))
            .collect();
        let mask = ProjectionMask::leaves(builder.parquet_schema(), leaves);
        builder = builder.with_projection(mask);
    }

    let reader = builder.build()?;
    let mut rows = vec![];
    for batch in reader {
        let batch = batch?;
        for event in event_schema::from_record_batch(&batch)? {
            if event.timestamp >= bounds.0 && event.timestamp <= bounds.1 {
                rows.push(event);
            }
        }
    }
    Ok(rows)
}
