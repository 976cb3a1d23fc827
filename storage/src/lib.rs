//! Uniform object storage for the wide-event store.
//!
//! Everything below the partition layout is delegated to the `object_store`
//! crate: the local backend stages writes through a temporary file and
//! renames, the S3 backend uploads fully-formed objects in a single PUT, so
//! neither ever exposes a partial file under its final name.
//!
//! Directory listings are best-effort on object stores; [`ObjectBackend::list`]
//! retries transient failures with bounded backoff before giving up.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod paths;
mod retry;

pub use paths::*;
pub use retry::RetryConfig;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{DynObjectStore, ObjectStore, PutPayload};
use observability_deps::tracing::warn;
use snafu::{ResultExt, Snafu};
use std::sync::Arc;

/// Errors surfaced by the storage backend.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Failed to list '{}': {}", prefix, source))]
    List {
        prefix: String,
        source: object_store::Error,
    },

    #[snafu(display("Failed to read '{}': {}", path, source))]
    Read {
        path: String,
        source: object_store::Error,
    },

    #[snafu(display("Failed to write '{}': {}", path, source))]
    Write {
        path: String,
        source: object_store::Error,
    },

    #[snafu(display("Failed to delete '{}': {}", path, source))]
    Delete {
        path: String,
        source: object_store::Error,
    },

    #[snafu(display("Invalid S3 configuration: {}", source))]
    S3Config { source: object_store::Error },

    #[snafu(display("Invalid local storage root '{}': {}", path, source))]
    LocalRoot {
        path: String,
        source: object_store::Error,
    },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the underlying failure was "object does not exist".
    pub fn is_not_found(&self) -> bool {
        let source = match self {
            Self::List { source, .. }
            | Self::Read { source, .. }
            | Self::Write { source, .. }
            | Self::Delete { source, .. }
            | Self::S3Config { source }
            | Self::LocalRoot { source, .. } => source,
        };
        matches!(source, object_store::Error::NotFound { .. })
    }
}

/// Which concrete store a backend talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Local filesystem rooted at the configured base path.
    Local,
    /// S3-compatible object store.
    S3,
    /// Process-local store for tests.
    Memory,
}

impl BackendKind {
    /// Lowercase name as used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::S3 => "s3",
            Self::Memory => "memory",
        }
    }
}

/// Listing entry for one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    /// Path of the object relative to the backend root.
    pub location: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time as reported by the store.
    pub last_modified: DateTime<Utc>,
}

/// Credentials and addressing for an S3-compatible store.
#[derive(Debug, Clone, Default)]
pub struct S3Options {
    /// Bucket name.
    pub bucket: String,
    /// Custom endpoint for S3-compatible stores; empty for AWS.
    pub endpoint: Option<String>,
    /// Region.
    pub region: Option<String>,
    /// Access key id.
    pub access_key_id: Option<String>,
    /// Secret access key.
    pub secret_access_key: Option<String>,
    /// Key prefix inside the bucket; everything lives under it.
    pub prefix: Option<String>,
}

/// An object storage backend with the partition-layout contract on top.
#[derive(Debug, Clone)]
pub struct ObjectBackend {
    store: Arc<DynObjectStore>,
    kind: BackendKind,
    base_path: String,
    prefix: Option<ObjectPath>,
    retry: RetryConfig,
}

impl ObjectBackend {
    /// Backend over the local filesystem rooted at `root`.
    ///
    /// `root` must exist; intermediate directories below it are created on
    /// write by the store itself.
    pub fn new_local(root: impl Into<String>) -> Result<Self> {
        let root = root.into();
        let store =
            LocalFileSystem::new_with_prefix(&root).context(LocalRootSnafu { path: root.as_str() })?;
        Ok(Self {
            store: Arc::new(store),
            kind: BackendKind::Local,
            base_path: root,
            prefix: None,
            retry: RetryConfig::default(),
        })
    }

    /// Backend over an S3-compatible object store.
    pub fn new_s3(options: S3Options) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&options.bucket);
        if let Some(endpoint) = &options.endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }
        if let Some(region) = &options.region {
            builder = builder.with_region(region);
        }
        if let Some(key) = &options.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = &options.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        let store = builder.build().context(S3ConfigSnafu)?;

        let prefix = options
            .prefix
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(ObjectPath::from);
        let base_path = match &prefix {
            Some(p) => format!("{}/{}", options.bucket, p),
            None => options.bucket.clone(),
        };
        Ok(Self {
            store: Arc::new(store),
            kind: BackendKind::S3,
            base_path,
            prefix,
            retry: RetryConfig::default(),
        })
    }

    /// Process-local backend for tests.
    pub fn new_in_memory() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
            kind: BackendKind::Memory,
            base_path: "memory".to_string(),
            prefix: None,
            retry: RetryConfig::default(),
        }
    }

    /// Override the list retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Which concrete store this backend talks to.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Root of the backend (directory, or bucket plus optional prefix).
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> ObjectPath {
        match &self.prefix {
            Some(prefix) => prefix.parts().chain(ObjectPath::from(path).parts()).collect(),
            None => ObjectPath::from(path),
        }
    }

    fn strip_prefix(&self, location: &ObjectPath) -> String {
        let location = location.to_string();
        match &self.prefix {
            Some(prefix) => location
                .strip_prefix(&format!("{prefix}/"))
                .map(str::to_string)
                .unwrap_or(location),
            None => location,
        }
    }

    /// Lists all objects under `prefix`, retrying transient failures.
    ///
    /// Listings are not atomic with respect to concurrent writes or deletes;
    /// callers must tolerate both stale and missing entries.
    pub async fn list(&self, prefix: &str) -> Result<Vec<FileStatus>> {
        let full = (!prefix.is_empty() || self.prefix.is_some()).then(|| self.full_path(prefix));
        let outcome = self
            .retry
            .clone()
            .run("list", || async {
                self.store
                    .list(full.as_ref())
                    .try_collect::<Vec<_>>()
                    .await
            })
            .await;

        let metas = match outcome {
            Ok(metas) => metas,
            Err(object_store::Error::NotFound { .. }) => vec![],
            Err(source) => {
                return Err(Error::List {
                    prefix: prefix.to_string(),
                    source,
                })
            }
        };

        Ok(metas
            .into_iter()
            .map(|meta| FileStatus {
                location: self.strip_prefix(&meta.location),
                size: meta.size as u64,
                last_modified: meta.last_modified,
            })
            .collect())
    }

    /// Lists the immediate child "directories" of `prefix`.
    ///
    /// Used for wildcard enumeration of partition levels.
    pub async fn list_dirs(&self, prefix: &str) -> Result<Vec<String>> {
        let full = (!prefix.is_empty() || self.prefix.is_some()).then(|| self.full_path(prefix));
        let result = self
            .store
            .list_with_delimiter(full.as_ref())
            .await
            .context(ListSnafu { prefix })?;
        Ok(result
            .common_prefixes
            .iter()
            .map(|p| self.strip_prefix(p))
            .collect())
    }

    /// Reads a whole object.
    pub async fn read(&self, path: &str) -> Result<Bytes> {
        let full = self.full_path(path);
        let result = self.store.get(&full).await.context(ReadSnafu { path })?;
        result.bytes().await.context(ReadSnafu { path })
    }

    /// Writes a fully-formed object in one shot.
    pub async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        let full = self.full_path(path);
        self.store
            .put(&full, PutPayload::from(data))
            .await
            .context(WriteSnafu { path })?;
        Ok(())
    }

    /// Removes an object. Returns `false` if it did not exist.
    pub async fn remove(&self, path: &str) -> Result<bool> {
        let full = self.full_path(path);
        match self.store.delete(&full).await {
            Ok(()) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(source) => Err(Error::Delete {
                path: path.to_string(),
                source,
            }),
        }
    }

    /// Whether an object exists.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.full_path(path);
        match self.store.head(&full).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(source) => Err(Error::Read {
                path: path.to_string(),
                source,
            }),
        }
    }

    /// Best-effort removal of many objects; failures are logged, not raised.
    pub async fn remove_all(&self, paths: &[String]) -> usize {
        let mut removed = 0;
        for path in paths {
            match self.remove(path).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!(%path, %error, "failed to remove object");
                }
            }
        }
        removed
    }
}
