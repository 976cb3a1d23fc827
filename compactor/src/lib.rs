//! The compaction engine.
//!
//! Periodically merges the many small `events_*.parquet` files of a partition
//! into a few size-bounded `block_*.parquet` files. Source files are deleted
//! only after every output is durably written, so a failure mid-run leaves
//! the partition as a superset of its previous state and the next run simply
//! re-merges.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod lock;

pub use lock::*;

use bytes::Bytes;
use chrono::NaiveDate;
use clock::TimeProvider;
use data_types::{EventType, WideEvent};
use observability_deps::tracing::{debug, info, warn};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use storage::{
    block_file_name, file_name_of, parse_data_file_name, ObjectBackend, PartitionPath,
};
use uuid::Uuid;

/// Default upper bound of a block's estimated uncompressed size.
pub const DEFAULT_MAX_BLOCK_BYTES: u64 = 50 * 1024 * 1024;
/// Default cap of source files merged per partition per run.
pub const DEFAULT_MAX_FILES_PER_BATCH: usize = 100;
/// Default lock lease.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(300);

/// Assumed columnar-compression gain over the JSON size sample.
const COMPRESSION_FACTOR: u64 = 3;
/// Row-count clamp applied to the block size estimate.
const MIN_ROWS_PER_BLOCK: usize = 1_000;
const MAX_ROWS_PER_BLOCK: usize = 1_000_000;

/// Errors internal to one partition's compaction.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Failed to list partition: {}", source))]
    ListPartition { source: storage::Error },

    #[snafu(display("Failed to read '{}': {}", path, source))]
    ReadFile {
        path: String,
        source: storage::Error,
    },

    #[snafu(display("Failed to decode '{}': {}", path, source))]
    DecodeFile {
        path: String,
        source: parquet::errors::ParquetError,
    },

    #[snafu(display("Failed to decode rows of '{}': {}", path, source))]
    DecodeRows {
        path: String,
        source: event_schema::Error,
    },

    #[snafu(display("Failed to encode block: {}", source))]
    EncodeBlock { source: event_schema::Error },

    #[snafu(display("Failed to serialize block '{}': {}", path, source))]
    SerializeBlock {
        path: String,
        source: parquet::errors::ParquetError,
    },

    #[snafu(display("Failed to write block '{}': {}", path, source))]
    WriteBlock {
        path: String,
        source: storage::Error,
    },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Tunables of the compaction engine.
#[derive(Debug, Clone, Copy)]
pub struct CompactorConfig {
    /// Upper bound of a block's estimated uncompressed size.
    pub max_block_bytes: u64,
    /// Cap of source files merged per partition per run.
    pub max_files_per_batch: usize,
    /// Lock lease per partition.
    pub lock_lease: Duration,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            max_block_bytes: DEFAULT_MAX_BLOCK_BYTES,
            max_files_per_batch: DEFAULT_MAX_FILES_PER_BATCH,
            lock_lease: DEFAULT_LOCK_LEASE,
        }
    }
}

/// Which slice of the partition space a run covers; unspecified dimensions
/// are enumerated level by level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionTarget {
    /// Literal organization, or every organization.
    pub organization_id: Option<String>,
    /// Literal project, or every project.
    pub project_id: Option<String>,
    /// Literal event type, or every type.
    pub event_type: Option<EventType>,
    /// Literal day, or every day present.
    pub date: Option<NaiveDate>,
}

/// Outcome of one partition's compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// Sources merged into blocks.
    Compacted,
    /// Sources existed but decoded to zero rows; they were removed.
    Empty,
    /// Nothing to do: no source files.
    NoWork,
    /// Another worker holds the partition lock.
    Skipped,
    /// The partition failed; sources are untouched (possibly alongside some
    /// freshly written blocks).
    Failed,
}

/// Per-partition result of a run.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// The partition.
    pub partition: PartitionPath,
    /// What happened.
    pub outcome: CompactionOutcome,
    /// Source files removed.
    pub files_removed: usize,
    /// Rows carried across.
    pub events: usize,
    /// Block files written.
    pub outputs: Vec<String>,
    /// Failure message for [`CompactionOutcome::Failed`].
    pub error: Option<String>,
}

impl CompactionResult {
    fn new(partition: PartitionPath, outcome: CompactionOutcome) -> Self {
        Self {
            partition,
            outcome,
            files_removed: 0,
            events: 0,
            outputs: vec![],
            error: None,
        }
    }
}

/// Aggregate of one run over many partitions.
#[derive(Debug, Default)]
pub struct CompactionSummary {
    /// Per-partition results, in scan order.
    pub results: Vec<CompactionResult>,
}

impl CompactionSummary {
    /// Partitions that merged or cleaned up successfully.
    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .filter(|r| {
                matches!(
                    r.outcome,
                    CompactionOutcome::Compacted | CompactionOutcome::Empty
                )
            })
            .count()
    }

    /// Partitions skipped because of a held lock.
    pub fn skipped(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == CompactionOutcome::Skipped)
            .count()
    }

    /// Partitions that failed. Failures are non-fatal to the run.
    pub fn errors(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == CompactionOutcome::Failed)
            .count()
    }

    /// Total rows carried into blocks.
    pub fn events(&self) -> usize {
        self.results.iter().map(|r| r.events).sum()
    }
}

impl Display for CompactionSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "compaction: {} partitions, {} succeeded, {} skipped, {} errors, {} events",
            self.results.len(),
            self.succeeded(),
            self.skipped(),
            self.errors(),
            self.events(),
        )
    }
}

/// Merges live-written event files into block files, one partition at a time.
#[derive(Debug)]
pub struct Compactor {
    backend: ObjectBackend,
    locker: Arc<dyn Locker>,
    time_provider: Arc<dyn TimeProvider>,
    config: CompactorConfig,
}

impl Compactor {
    /// New engine over the given collaborators.
    pub fn new(
        backend: ObjectBackend,
        locker: Arc<dyn Locker>,
        time_provider: Arc<dyn TimeProvider>,
        config: CompactorConfig,
    ) -> Self {
        Self {
            backend,
            locker,
            time_provider,
            config,
        }
    }

    /// Runs one compaction pass over every partition the target covers.
    pub async fn run(&self, target: &CompactionTarget) -> CompactionSummary {
        let partitions = match self.enumerate(target).await {
            Ok(partitions) => partitions,
            Err(error) => {
                warn!(%error, "failed to enumerate partitions, nothing compacted");
                return CompactionSummary::default();
            }
        };

        let mut summary = CompactionSummary::default();
        for partition in partitions {
            let result = self.compact_partition(&partition).await;
            summary.results.push(result);
        }
        info!(%summary, "compaction run finished");
        summary
    }

    /// Enumerates target partitions level by level, using literal segments
    /// for specified dimensions.
    async fn enumerate(&self, target: &CompactionTarget) -> Result<Vec<PartitionPath>> {
        let organizations = self
            .level(
                "",
                "organization_id=",
                target.organization_id.as_deref(),
            )
            .await?;

        let mut projects = vec![];
        for organization in &organizations {
            projects.extend(
                self.level(organization, "project_id=", target.project_id.as_deref())
                    .await?,
            );
        }

        let mut typed = vec![];
        for project in &projects {
            typed.extend(
                self.level(project, "event_type=", target.event_type.map(|t| t.as_str()))
                    .await?,
            );
        }

        let date_literal = target.date.map(|d| d.format("%Y-%m-%d").to_string());
        let mut partitions = vec![];
        for prefix in &typed {
            for dir in self.level(prefix, "dt=", date_literal.as_deref()).await? {
                if let Ok(partition) = PartitionPath::parse(&dir) {
                    partitions.push(partition);
                }
            }
        }
        partitions.sort();
        Ok(partitions)
    }

    async fn level(
        &self,
        prefix: &str,
        segment: &str,
        literal: Option<&str>,
    ) -> Result<Vec<String>> {
        match literal {
            Some(value) => Ok(vec![if prefix.is_empty() {
                format!("{segment}{value}")
            } else {
                format!("{prefix}/{segment}{value}")
            }]),
            None => {
                let dirs = self
                    .backend
                    .list_dirs(prefix)
                    .await
                    .context(ListPartitionSnafu)?;
                Ok(dirs
                    .into_iter()
                    .filter(|dir| file_name_of(dir).starts_with(segment))
                    .collect())
            }
        }
    }

    /// Compacts one partition under its lock.
    ///
    /// The conceptual state machine is `Idle → Locked → Reading → Writing →
    /// Finalizing → Idle`; any failure returns to `Idle` with the source
    /// files untouched.
    pub async fn compact_partition(&self, partition: &PartitionPath) -> CompactionResult {
        let lock_name = partition_lock_name(partition);
        let Some(_guard) = self.locker.acquire(&lock_name, self.config.lock_lease) else {
            debug!(%partition, "partition locked elsewhere, skipping");
            return CompactionResult::new(partition.clone(), CompactionOutcome::Skipped);
        };

        match self.compact_locked(partition).await {
            Ok(result) => result,
            Err(error) => {
                warn!(%partition, %error, "partition compaction failed");
                let mut result =
                    CompactionResult::new(partition.clone(), CompactionOutcome::Failed);
                result.error = Some(error.to_string());
                result
            }
        }
    }

    async fn compact_locked(&self, partition: &PartitionPath) -> Result<CompactionResult> {
        // Reading: enumerate sources first; anything written after this
        // listing survives the run untouched
        let dir = partition.to_string();
        let listed = self.backend.list(&dir).await.context(ListPartitionSnafu)?;
        let mut sources: Vec<String> = listed
            .into_iter()
            .map(|f| f.location)
            .filter(|location| {
                parse_data_file_name(file_name_of(location)).is_some_and(|f| f.is_events())
            })
            .collect();
        sources.sort();
        sources.truncate(self.config.max_files_per_batch);

        if sources.is_empty() {
            return Ok(CompactionResult::new(
                partition.clone(),
                CompactionOutcome::NoWork,
            ));
        }

        let mut events = vec![];
        for path in &sources {
            let data = self
                .backend
                .read(path)
                .await
                .context(ReadFileSnafu { path })?;
            events.extend(decode_events(data, path)?);
        }

        // sources that decoded to nothing were rotated empty; just drop them
        if events.is_empty() {
            let files_removed = self.backend.remove_all(&sources).await;
            let mut result = CompactionResult::new(partition.clone(), CompactionOutcome::Empty);
            result.files_removed = files_removed;
            return Ok(result);
        }

        // Writing: size-estimated chunks, fresh UUIDv7 names, no collisions
        let rows_per_block = estimate_rows_per_block(&events, self.config.max_block_bytes);
        let now = self.time_provider.now();
        let mut outputs = vec![];
        for (index, chunk) in events.chunks(rows_per_block).enumerate() {
            let name = block_file_name(now, index as u8, Uuid::now_v7());
            let path = partition.file_path(&name);
            let data = serialize_block(chunk, &path)?;
            self.backend
                .write(&path, data)
                .await
                .context(WriteBlockSnafu { path: path.clone() })?;
            outputs.push(path);
        }

        // Finalizing: all outputs are durable, only now may sources go
        let files_removed = self.backend.remove_all(&sources).await;

        debug!(
            %partition,
            sources = sources.len(),
            blocks = outputs.len(),
            events = events.len(),
            "partition compacted",
        );
        let mut result = CompactionResult::new(partition.clone(), CompactionOutcome::Compacted);
        result.files_removed = files_removed;
        result.events = events.len();
        result.outputs = outputs;
        Ok(result)
    }
}

/// Lock key of a partition.
fn partition_lock_name(partition: &PartitionPath) -> String {
    let digest = Sha256::digest(partition.to_string().as_bytes());
    let mut short = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        short.push_str(&format!("{byte:02x}"));
    }
    format!("compact:{short}")
}

/// Estimates how many rows fit a block from a JSON size sample, assuming the
/// columnar form compresses by a constant factor.
fn estimate_rows_per_block(events: &[WideEvent], max_block_bytes: u64) -> usize {
    let sample_len = events.len().min(100);
    let sample_bytes: usize = events[..sample_len]
        .iter()
        .map(|event| serde_json::to_string(event).map(|s| s.len()).unwrap_or(256))
        .sum();
    let avg = (sample_bytes / sample_len.max(1)).max(1) as u64;
    let rows = (max_block_bytes * COMPRESSION_FACTOR / avg) as usize;
    rows.clamp(MIN_ROWS_PER_BLOCK, MAX_ROWS_PER_BLOCK)
}

fn decode_events(data: Bytes, path: &str) -> Result<Vec<WideEvent>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(data)
        .context(DecodeFileSnafu { path })?
        .build()
        .context(DecodeFileSnafu { path })?;
    let mut events = vec![];
    for batch in reader {
        let batch = batch
            .map_err(parquet::errors::ParquetError::from)
            .context(DecodeFileSnafu { path })?;
        events.extend(event_schema::from_record_batch(&batch).context(DecodeRowsSnafu { path })?);
    }
    Ok(events)
}

fn serialize_block(events: &[WideEvent], path: &str) -> Result<Bytes> {
    let batch = event_schema::to_record_batch(events).context(EncodeBlockSnafu)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))
        .context(SerializeBlockSnafu { path })?;
    writer.write(&batch).context(SerializeBlockSnafu { path })?;
    writer.close().context(SerializeBlockSnafu { path })?;
    Ok(Bytes::from(buffer))
}
