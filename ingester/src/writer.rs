//! The partitioned columnar writer.
//!
//! Events are bucketed in memory by partition key. A bucket is flushed when it
//! reaches the configured batch size, on an explicit flush, or on shutdown.
//! Each flush produces exactly one immutable `events_*.parquet` file whose
//! path is fully determined by the first event of the batch; there is no
//! append. On a failed flush the bucket is restored so no event is lost and
//! the caller (usually the queue's redelivery) can retry.

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use data_types::{PartitionKey, WideEvent};
use observability_deps::tracing::{debug, warn};
use parking_lot::Mutex;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use snafu::{ensure, ResultExt, Snafu};
use std::collections::HashMap;
use storage::{events_file_name, ObjectBackend, PartitionPath};
use uuid::Uuid;

/// Default number of buffered events that triggers a partition flush.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Errors surfaced by the writer.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Cannot write an empty batch"))]
    EmptyBatch,

    #[snafu(display("Failed to encode events to columnar form: {}", source))]
    Encode { source: event_schema::Error },

    #[snafu(display("Failed to serialize parquet for '{}': {}", path, source))]
    Serialize {
        path: String,
        source: parquet::errors::ParquetError,
    },

    #[snafu(display("Failed to store '{}': {}", path, source))]
    Store {
        path: String,
        source: storage::Error,
    },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether retrying the same write can succeed.
    ///
    /// Store failures are transient and retried by the queue; encoding and
    /// serialization failures are schema problems and are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store { .. })
    }
}

/// Buffers events per partition and flushes them as parquet files.
#[derive(Debug)]
pub struct PartitionedWriter {
    backend: ObjectBackend,
    batch_size: usize,
    buffers: Mutex<HashMap<PartitionKey, Vec<WideEvent>>>,
}

impl PartitionedWriter {
    /// New writer over the given backend.
    pub fn new(backend: ObjectBackend, batch_size: usize) -> Self {
        Self {
            backend,
            batch_size: batch_size.max(1),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Buffers one event, flushing its partition when the batch fills.
    pub async fn add_event(&self, event: WideEvent) -> Result<()> {
        let key = PartitionKey::for_event(&event);
        let full = {
            let mut buffers = self.buffers.lock();
            let buffer = buffers.entry(key.clone()).or_default();
            buffer.push(event);
            buffer.len() >= self.batch_size
        };
        if full {
            self.flush_partition(&key).await?;
        }
        Ok(())
    }

    /// Buffers many events, flushing any partition whose batch fills.
    pub async fn add_events(&self, events: Vec<WideEvent>) -> Result<()> {
        let mut full = vec![];
        {
            let mut buffers = self.buffers.lock();
            for event in events {
                let key = PartitionKey::for_event(&event);
                let buffer = buffers.entry(key.clone()).or_default();
                buffer.push(event);
                if buffer.len() >= self.batch_size && !full.contains(&key) {
                    full.push(key);
                }
            }
        }
        for key in full {
            self.flush_partition(&key).await?;
        }
        Ok(())
    }

    /// Flushes one partition buffer, if it holds anything.
    ///
    /// Returns the written file path. On failure the buffer is restored with
    /// the unflushed events in front and the error propagates.
    pub async fn flush_partition(&self, key: &PartitionKey) -> Result<Option<String>> {
        let Some(events) = self.take_buffer(key) else {
            return Ok(None);
        };
        match self.write_events(&events).await {
            Ok(path) => Ok(Some(path)),
            Err(error) => {
                warn!(partition=%key, %error, "flush failed, buffer retained");
                self.restore_buffer(key, events);
                Err(error)
            }
        }
    }

    /// Flushes every partition with buffered events.
    ///
    /// All partitions are attempted; the first error is returned after the
    /// remaining partitions had their chance, with every failed buffer
    /// retained.
    pub async fn flush(&self) -> Result<Vec<String>> {
        let keys: Vec<PartitionKey> = self.buffers.lock().keys().cloned().collect();
        let mut written = vec![];
        let mut first_error = None;
        for key in keys {
            match self.flush_partition(&key).await {
                Ok(Some(path)) => written.push(path),
                Ok(None) => {}
                Err(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(written),
        }
    }

    /// Writes a batch of events straight to one parquet file, bypassing the
    /// buffers. All events must belong to the partition of the first one.
    pub async fn write_events(&self, events: &[WideEvent]) -> Result<String> {
        ensure!(!events.is_empty(), EmptyBatchSnafu);

        let first = &events[0];
        let partition = PartitionPath::new(&PartitionKey::for_event(first));
        let written_at = Utc
            .timestamp_millis_opt(first.timestamp)
            .single()
            .unwrap_or_else(Utc::now);
        let file_name = events_file_name(written_at, Uuid::now_v7());
        let path = partition.file_path(&file_name);

        let data = serialize_events(events, &path)?;
        self.backend
            .write(&path, data)
            .await
            .context(StoreSnafu { path: path.clone() })?;

        debug!(%path, events = events.len(), "wrote event file");
        Ok(path)
    }

    /// Number of currently buffered events across all partitions.
    pub fn buffered_events(&self) -> usize {
        self.buffers.lock().values().map(Vec::len).sum()
    }

    fn take_buffer(&self, key: &PartitionKey) -> Option<Vec<WideEvent>> {
        let mut buffers = self.buffers.lock();
        match buffers.remove(key) {
            Some(events) if !events.is_empty() => Some(events),
            _ => None,
        }
    }

    fn restore_buffer(&self, key: &PartitionKey, mut events: Vec<WideEvent>) {
        let mut buffers = self.buffers.lock();
        // anything buffered while the flush was in flight goes behind the
        // restored events to keep arrival order
        if let Some(newer) = buffers.remove(key) {
            events.extend(newer);
        }
        buffers.insert(key.clone(), events);
    }
}

/// Serializes events into a fully-formed parquet buffer.
fn serialize_events(events: &[WideEvent], path: &str) -> Result<Bytes> {
    let batch = event_schema::to_record_batch(events).context(EncodeSnafu)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))
        .context(SerializeSnafu { path })?;
    writer.write(&batch).context(SerializeSnafu { path })?;
    writer.close().context(SerializeSnafu { path })?;
    Ok(Bytes::from(buffer))
}
