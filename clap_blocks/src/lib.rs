//! Shared configuration blocks.
//!
//! Every configuration key of the system maps to one flag here, each with an
//! environment fallback and a documented default, flattened into the binary's
//! commands.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::{ResultExt, Snafu};
use storage::{ObjectBackend, S3Options};

/// Errors building collaborators from configuration.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ParseError {
    #[snafu(display("S3 storage requires --storage-s3-bucket"))]
    MissingBucket,

    #[snafu(display("Cannot initialize storage backend: {}", source))]
    Backend { source: storage::Error },
}

/// Which storage implementation to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StorageKind {
    /// Local filesystem.
    Local,
    /// S3-compatible object store.
    S3,
}

/// Storage backend configuration.
#[derive(Debug, Clone, clap::Parser)]
pub struct StorageConfig {
    /// Which backend to use.
    #[clap(
        long = "storage-kind",
        env = "SIGNALHOUSE_STORAGE_KIND",
        value_enum,
        default_value = "local"
    )]
    pub kind: StorageKind,

    /// Root directory (local) or key prefix inside the bucket (s3).
    #[clap(
        long = "storage-base-path",
        env = "SIGNALHOUSE_STORAGE_BASE_PATH",
        default_value = "./data"
    )]
    pub base_path: String,

    /// S3 bucket name.
    #[clap(long = "storage-s3-bucket", env = "SIGNALHOUSE_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// Custom S3 endpoint for S3-compatible stores.
    #[clap(long = "storage-s3-endpoint", env = "SIGNALHOUSE_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// S3 region.
    #[clap(long = "storage-s3-region", env = "SIGNALHOUSE_S3_REGION")]
    pub s3_region: Option<String>,

    /// S3 access key id.
    #[clap(long = "storage-s3-key", env = "SIGNALHOUSE_S3_KEY")]
    pub s3_key: Option<String>,

    /// S3 secret access key.
    #[clap(long = "storage-s3-secret", env = "SIGNALHOUSE_S3_SECRET")]
    pub s3_secret: Option<String>,
}

impl StorageConfig {
    /// Builds the configured backend.
    pub fn make_backend(&self) -> Result<ObjectBackend, ParseError> {
        match self.kind {
            StorageKind::Local => {
                std::fs::create_dir_all(&self.base_path).ok();
                ObjectBackend::new_local(self.base_path.clone()).context(BackendSnafu)
            }
            StorageKind::S3 => {
                let bucket = self.s3_bucket.clone().ok_or(ParseError::MissingBucket)?;
                ObjectBackend::new_s3(S3Options {
                    bucket,
                    endpoint: self.s3_endpoint.clone(),
                    region: self.s3_region.clone(),
                    access_key_id: self.s3_key.clone(),
                    secret_access_key: self.s3_secret.clone(),
                    prefix: Some(self.base_path.clone()).filter(|p| p != "./data"),
                })
                .context(BackendSnafu)
            }
        }
    }
}

/// Writer configuration.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct WriterConfig {
    /// Buffered events per partition that trigger a flush.
    #[clap(
        long = "writer-batch-size",
        env = "SIGNALHOUSE_WRITER_BATCH_SIZE",
        default_value = "1000"
    )]
    pub batch_size: usize,
}

/// Compaction configuration.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct CompactionConfig {
    /// Upper bound of a block's estimated uncompressed size in bytes.
    #[clap(
        long = "compaction-max-block-bytes",
        env = "SIGNALHOUSE_COMPACTION_MAX_BLOCK_BYTES",
        default_value = "52428800"
    )]
    pub max_block_bytes: u64,

    /// Source files merged per partition per run.
    #[clap(
        long = "compaction-max-files-per-batch",
        env = "SIGNALHOUSE_COMPACTION_MAX_FILES_PER_BATCH",
        default_value = "100"
    )]
    pub max_files_per_batch: usize,

    /// Partition lock lease in seconds.
    #[clap(
        long = "compaction-lock-lease-seconds",
        env = "SIGNALHOUSE_COMPACTION_LOCK_LEASE_SECONDS",
        default_value = "300"
    )]
    pub lock_lease_seconds: u64,

    /// Run compaction on this interval inside `run`; off when unset.
    #[clap(
        long = "compaction-interval-seconds",
        env = "SIGNALHOUSE_COMPACTION_INTERVAL_SECONDS"
    )]
    pub interval_seconds: Option<u64>,
}

/// Async query lifecycle configuration.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct QueryConfig {
    /// Lifetime of pending/in-progress queries in seconds.
    #[clap(
        long = "query-ttl-pending-seconds",
        env = "SIGNALHOUSE_QUERY_TTL_PENDING_SECONDS",
        default_value = "3600"
    )]
    pub ttl_pending_seconds: u64,

    /// Lifetime of terminal queries in seconds.
    #[clap(
        long = "query-ttl-completed-seconds",
        env = "SIGNALHOUSE_QUERY_TTL_COMPLETED_SECONDS",
        default_value = "300"
    )]
    pub ttl_completed_seconds: u64,

    /// Facet values kept per attribute.
    #[clap(
        long = "facet-max-values",
        env = "SIGNALHOUSE_FACET_MAX_VALUES",
        default_value = "10"
    )]
    pub max_values_per_facet: usize,
}

/// SSE streamer configuration.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct SseConfig {
    /// Store poll interval in microseconds.
    #[clap(
        long = "sse-poll-micros",
        env = "SIGNALHOUSE_SSE_POLL_MICROS",
        default_value = "500000"
    )]
    pub poll_micros: u64,

    /// Heartbeat interval in seconds.
    #[clap(
        long = "sse-heartbeat-seconds",
        env = "SIGNALHOUSE_SSE_HEARTBEAT_SECONDS",
        default_value = "15"
    )]
    pub heartbeat_seconds: u64,

    /// Hard cap on stream lifetime in seconds.
    #[clap(
        long = "sse-max-seconds",
        env = "SIGNALHOUSE_SSE_MAX_SECONDS",
        default_value = "120"
    )]
    pub max_seconds: u64,
}

/// Ingest authentication configuration.
#[derive(Debug, Clone, clap::Parser)]
pub struct IngestConfig {
    /// API key entries, `key:organization:project:environment`, repeatable.
    #[clap(
        long = "ingest-api-key",
        env = "SIGNALHOUSE_INGEST_API_KEYS",
        value_delimiter = ','
    )]
    pub api_keys: Vec<String>,
}

/// HTTP surface configuration.
#[derive(Debug, Clone, clap::Parser)]
pub struct RunConfig {
    /// Bind address of the HTTP surface.
    #[clap(
        long = "http-bind",
        env = "SIGNALHOUSE_HTTP_BIND",
        default_value = "127.0.0.1:8080"
    )]
    pub http_bind: String,
}
