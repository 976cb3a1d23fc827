//! The single-pass query executor.
//!
//! One scan over the pruned partitions feeds the total, the facet counters,
//! and either the grouped buckets or the bounded row list. Results are
//! deterministic for a frozen store: ties on `count` break on value, ties on
//! `timestamp` break on `event_id`.

use crate::{selected_values, EventReader, PartitionSelector, ReadOptions};
use data_types::{
    Facet, FacetValue, FilterOp, GroupedResult, QueryRequest, QueryResult, RequestContext,
    WideEvent,
};
use observability_deps::tracing::debug;
use snafu::Snafu;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Facet attributes computed inline with the main result; the remaining
/// facetable attributes arrive later through deferred batches.
pub const PRIORITY_FACET_ATTRIBUTES: &[&str] = &[
    "event_type",
    "severity",
    "environment",
    "bundle_id",
    "exception_type",
];

/// Errors surfaced by query execution.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Query was cancelled"))]
    Cancelled,

    #[snafu(display("Failed to read events: {}", source))]
    Read { source: crate::reader::Error },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Tunables of the executor.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Facet values kept per attribute.
    pub max_facet_values: usize,
    /// Row cap of the export variant.
    pub export_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_facet_values: 10,
            export_limit: 10_000,
        }
    }
}

/// Executes exploratory queries against the event store.
#[derive(Debug)]
pub struct QueryExecutor {
    reader: EventReader,
    config: ExecutorConfig,
}

impl QueryExecutor {
    /// New executor over the given reader.
    pub fn new(reader: EventReader, config: ExecutorConfig) -> Self {
        Self { reader, config }
    }

    /// Borrow of the underlying reader.
    pub fn reader(&self) -> &EventReader {
        &self.reader
    }

    /// Runs one query.
    ///
    /// `progress` observes the partition scan as a percentage (never reaching
    /// 100; the lifecycle owns the final step). `is_cancelled` is consulted at
    /// least once per scanned partition; a positive answer aborts with
    /// [`Error::Cancelled`].
    pub async fn execute(
        &self,
        request: &QueryRequest,
        context: &RequestContext,
        progress: &mut (dyn FnMut(u8) + Send),
        is_cancelled: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<QueryResult> {
        if request.export {
            return self.export(request, context, is_cancelled).await;
        }

        let facet_attributes: Vec<String> = PRIORITY_FACET_ATTRIBUTES
            .iter()
            .map(|s| s.to_string())
            .collect();
        let options = scan_options(request, context, Some(&facet_attributes));
        let partitions = self.reader.partitions(&options).await.context_read()?;

        let mut aggregation = Aggregation::new(request, &facet_attributes, self.config);
        let total_partitions = partitions.len().max(1);
        for (index, partition) in partitions.iter().enumerate() {
            if is_cancelled() {
                return Err(Error::Cancelled);
            }
            let scan = self.reader.scan_partition(partition, &options).await;
            aggregation.observe_scan(&scan);
            for event in scan.events {
                aggregation.push(event);
            }
            progress((((index + 1) * 100) / total_partitions).min(99) as u8);
        }
        aggregation.check_files()?;

        let result = aggregation.finish(request);
        debug!(
            total = result.total,
            facets = result.facets.len(),
            grouped = result.grouped_results.len(),
            "query executed",
        );
        Ok(result)
    }

    /// Replays the scan to compute the facet distributions of the given
    /// attributes; used by the deferred facet batches.
    pub async fn compute_facets(
        &self,
        request: &QueryRequest,
        context: &RequestContext,
        attributes: &[String],
        is_cancelled: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<Vec<Facet>> {
        let options = scan_options(request, context, Some(attributes));
        let partitions = self.reader.partitions(&options).await.context_read()?;

        let mut aggregation = Aggregation::new(request, attributes, self.config);
        aggregation.facets_only = true;
        for partition in &partitions {
            if is_cancelled() {
                return Err(Error::Cancelled);
            }
            let scan = self.reader.scan_partition(partition, &options).await;
            aggregation.observe_scan(&scan);
            for event in scan.events {
                aggregation.push(event);
            }
        }
        aggregation.check_files()?;
        Ok(aggregation.build_facets(request))
    }

    /// Counts the rows a request matches, with the same pruning as `execute`.
    pub async fn count(&self, request: &QueryRequest, context: &RequestContext) -> Result<u64> {
        let selector = selector_for(request, context);
        self.reader
            .count_events(selector, request.filters.clone())
            .await
            .context_read()
    }

    /// The export variant: full rows, no facets, no grouping.
    async fn export(
        &self,
        request: &QueryRequest,
        context: &RequestContext,
        is_cancelled: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<QueryResult> {
        let options = ReadOptions {
            selector: selector_for(request, context),
            filters: request.filters.clone(),
            columns: None,
            limit: None,
        };
        let partitions = self.reader.partitions(&options).await.context_read()?;

        let mut rows = vec![];
        let mut files_seen = 0;
        let mut files_failed = 0;
        for partition in &partitions {
            if is_cancelled() {
                return Err(Error::Cancelled);
            }
            let scan = self.reader.scan_partition(partition, &options).await;
            files_seen += scan.files_seen;
            files_failed += scan.files_failed;
            rows.extend(scan.events);
        }
        if files_seen > 0 && files_failed == files_seen {
            return Err(Error::Read {
                source: crate::reader::Error::AllFilesFailed,
            });
        }

        sort_rows(&mut rows);
        rows.truncate(self.config.export_limit);
        let total = rows.len() as u64;
        Ok(QueryResult {
            events: rows,
            total,
            facets: vec![],
            grouped_results: vec![],
            page: request.page(),
            limit: request.limit(),
        })
    }
}

/// Scan parameters shared by every execution mode.
fn scan_options(
    request: &QueryRequest,
    context: &RequestContext,
    facet_attributes: Option<&[String]>,
) -> ReadOptions {
    let mut columns: Vec<String> = ["timestamp", "event_id", "user_id", "device_id"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    columns.extend(request.filters.iter().map(|f| f.attribute.clone()));
    if let Some(attributes) = facet_attributes {
        columns.extend(attributes.iter().cloned());
    }
    if let Some(group_by) = &request.group_by {
        columns.push(group_by.clone());
    }

    ReadOptions {
        selector: selector_for(request, context),
        filters: request.filters.clone(),
        columns: Some(columns),
        limit: None,
    }
}

/// Pushes the tenant scope and any `eq` filter on `event_type` down into the
/// partition selector.
fn selector_for(request: &QueryRequest, context: &RequestContext) -> PartitionSelector {
    let event_type = request
        .filters
        .iter()
        .find(|f| f.attribute == "event_type" && f.op == FilterOp::Eq)
        .and_then(|f| f.value.as_str())
        .and_then(|s| s.parse().ok());

    PartitionSelector {
        organization_id: Some(context.organization_id.clone()),
        project_id: request.project_id.clone(),
        event_type,
        from_millis: request.start_date,
        to_millis: request.end_date,
    }
}

/// Sorts rows by timestamp descending, breaking ties on `event_id`.
fn sort_rows(rows: &mut [WideEvent]) {
    rows.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
}

/// State of the single pass.
#[derive(Debug)]
struct Aggregation {
    total: u64,
    facet_counts: BTreeMap<String, HashMap<String, u64>>,
    group_by: Option<String>,
    grouped: HashMap<String, (u64, HashSet<String>)>,
    rows: Vec<WideEvent>,
    row_cap: usize,
    facets_only: bool,
    files_seen: usize,
    files_failed: usize,
    max_facet_values: usize,
}

impl Aggregation {
    fn new(request: &QueryRequest, facet_attributes: &[String], config: ExecutorConfig) -> Self {
        let facet_counts = facet_attributes
            .iter()
            .map(|attribute| (attribute.clone(), HashMap::new()))
            .collect();
        Self {
            total: 0,
            facet_counts,
            group_by: request.group_by.clone(),
            grouped: HashMap::new(),
            rows: vec![],
            row_cap: (request.offset() + request.limit()) as usize,
            facets_only: false,
            files_seen: 0,
            files_failed: 0,
            max_facet_values: config.max_facet_values,
        }
    }

    fn observe_scan(&mut self, scan: &crate::PartitionScan) {
        self.files_seen += scan.files_seen;
        self.files_failed += scan.files_failed;
    }

    fn check_files(&self) -> Result<()> {
        if self.files_seen > 0 && self.files_failed == self.files_seen {
            return Err(Error::Read {
                source: crate::reader::Error::AllFilesFailed,
            });
        }
        Ok(())
    }

    fn push(&mut self, event: WideEvent) {
        self.total += 1;

        for (attribute, counts) in self.facet_counts.iter_mut() {
            if let Some(value) = event.field(attribute) {
                let rendered = value.render();
                if !rendered.is_empty() {
                    *counts.entry(rendered).or_insert(0) += 1;
                }
            }
        }

        if self.facets_only {
            return;
        }

        if let Some(attribute) = &self.group_by {
            // grouped mode never accumulates raw rows
            if let Some(value) = event.field(attribute) {
                let bucket = self
                    .grouped
                    .entry(value.render())
                    .or_insert_with(|| (0, HashSet::new()));
                bucket.0 += 1;
                if let Some(user) = event.user_identity() {
                    bucket.1.insert(user.to_string());
                }
            }
            return;
        }

        self.rows.push(event);
        // keep the buffer bounded; the final sort re-establishes full order
        if self.row_cap > 0 && self.rows.len() >= self.row_cap.saturating_mul(2).max(1024) {
            sort_rows(&mut self.rows);
            self.rows.truncate(self.row_cap);
        }
    }

    fn build_facets(&self, request: &QueryRequest) -> Vec<Facet> {
        self.facet_counts
            .iter()
            .filter(|(_, counts)| !counts.is_empty())
            .map(|(attribute, counts)| {
                let selected = selected_values(&request.filters, attribute);
                let mut values: Vec<FacetValue> = counts
                    .iter()
                    .map(|(value, count)| FacetValue {
                        value: value.clone(),
                        count: *count,
                        selected: selected.contains(value),
                    })
                    .collect();
                values.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
                values.truncate(self.max_facet_values);
                Facet {
                    attribute: attribute.clone(),
                    values,
                }
            })
            .collect()
    }

    fn finish(mut self, request: &QueryRequest) -> QueryResult {
        let facets = self.build_facets(request);

        let (events, grouped_results) = if self.group_by.is_some() {
            let mut buckets: Vec<GroupedResult> = std::mem::take(&mut self.grouped)
                .into_iter()
                .map(|(value, (count, users))| GroupedResult {
                    value,
                    count,
                    users: users.len() as u64,
                })
                .collect();
            buckets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
            (vec![], buckets)
        } else {
            sort_rows(&mut self.rows);
            let offset = request.offset() as usize;
            let limit = request.limit() as usize;
            let page = if offset >= self.rows.len() {
                vec![]
            } else {
                self.rows.into_iter().skip(offset).take(limit).collect()
            };
            (page, vec![])
        };

        QueryResult {
            events,
            total: self.total,
            facets,
            grouped_results,
            page: request.page(),
            limit: request.limit(),
        }
    }
}

trait ReadResultExt<T> {
    fn context_read(self) -> Result<T>;
}

impl<T> ReadResultExt<T> for std::result::Result<T, crate::reader::Error> {
    fn context_read(self) -> Result<T> {
        self.map_err(|source| Error::Read { source })
    }
}
