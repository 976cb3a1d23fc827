//! Component wiring and the long-running service loops.

use clap_blocks::{
    CompactionConfig, IngestConfig, QueryConfig, RunConfig, SseConfig, StorageConfig, WriterConfig,
};
use clock::{SystemProvider, TimeProvider};
use compactor::{Compactor, CompactorConfig, CompactionTarget, InProcessLocker, Locker};
use event_bus::{queues, MemoryBus, MessageBus};
use ingester::{EventProcessor, IssueRepository, MemIssueRepository, PartitionedWriter};
use kv_cache::{KeyValueCache, MemoryCache};
use observability_deps::tracing::{info, warn};
use querier::{EventReader, ExecutorConfig, QueryExecutor};
use query_lifecycle::{AsyncQueryStore, QueryLifecycle, StoreConfig};
use router::{ApiKeyResolver, Intake, StaticApiKeys};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Interval of the background writer flush, so sparse partitions do not sit
/// in memory until shutdown.
const WRITER_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid config: {0}")]
    Config(#[from] clap_blocks::ParseError),

    #[error("Cannot bind '{addr}': {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("HTTP server failed: {0}")]
    Serve(std::io::Error),
}

/// Flags of the `run` command.
#[derive(Debug, clap::Parser)]
pub struct RunArgs {
    #[clap(flatten)]
    pub run: RunConfig,

    #[clap(flatten)]
    pub storage: StorageConfig,

    #[clap(flatten)]
    pub writer: WriterConfig,

    #[clap(flatten)]
    pub compaction: CompactionConfig,

    #[clap(flatten)]
    pub query: QueryConfig,

    #[clap(flatten)]
    pub sse: SseConfig,

    #[clap(flatten)]
    pub ingest: IngestConfig,
}

/// Flags of the one-shot `compact` command.
#[derive(Debug, clap::Parser)]
pub struct CompactArgs {
    #[clap(flatten)]
    pub storage: StorageConfig,

    #[clap(flatten)]
    pub compaction: CompactionConfig,

    /// Restrict the pass to one organization.
    #[clap(long = "organization-id")]
    pub organization_id: Option<String>,

    /// Restrict the pass to one project.
    #[clap(long = "project-id")]
    pub project_id: Option<String>,

    /// Restrict the pass to one event type.
    #[clap(long = "event-type")]
    pub event_type: Option<data_types::EventType>,

    /// Restrict the pass to one day (YYYY-MM-DD).
    #[clap(long = "date")]
    pub date: Option<chrono::NaiveDate>,
}

/// Everything the HTTP surface and the background loops share.
#[derive(Clone)]
pub struct Components {
    pub writer: Arc<PartitionedWriter>,
    pub processor: Arc<EventProcessor>,
    pub issues: Arc<dyn IssueRepository>,
    pub reader: Arc<EventReader>,
    pub lifecycle: Arc<QueryLifecycle>,
    pub intake: Arc<Intake>,
    pub resolver: Arc<dyn ApiKeyResolver>,
    pub bus: Arc<MemoryBus>,
    pub compactor: Arc<Compactor>,
    pub sse: query_lifecycle::SseConfig,
}

impl Components {
    /// Wires every component from configuration.
    pub fn build(args: &RunArgs) -> Result<Self, Error> {
        let backend = args.storage.make_backend()?;
        let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());

        let bus = Arc::new(MemoryBus::new());
        let cache: Arc<dyn KeyValueCache> =
            Arc::new(MemoryCache::new(Arc::clone(&time_provider)));

        let writer = Arc::new(PartitionedWriter::new(
            backend.clone(),
            args.writer.batch_size,
        ));
        let issues: Arc<dyn IssueRepository> = Arc::new(MemIssueRepository::new());
        let processor = Arc::new(EventProcessor::new(
            Arc::clone(&issues),
            Arc::clone(&writer),
        ));

        let reader = Arc::new(EventReader::new(backend.clone()));
        let executor = Arc::new(QueryExecutor::new(
            EventReader::new(backend.clone()),
            ExecutorConfig {
                max_facet_values: args.query.max_values_per_facet,
                ..Default::default()
            },
        ));
        let store = Arc::new(AsyncQueryStore::new(
            cache,
            Arc::clone(&time_provider),
            StoreConfig {
                ttl_pending: Duration::from_secs(args.query.ttl_pending_seconds),
                ttl_terminal: Duration::from_secs(args.query.ttl_completed_seconds),
            },
        ));
        let lifecycle = Arc::new(QueryLifecycle::new(
            store,
            executor,
            Arc::clone(&bus) as Arc<dyn MessageBus>,
        ));

        let intake = Arc::new(Intake::new(Arc::clone(&bus) as Arc<dyn MessageBus>));
        let resolver: Arc<dyn ApiKeyResolver> = Arc::new(StaticApiKeys::from_entries(
            args.ingest.api_keys.iter().map(String::as_str),
        ));

        let locker: Arc<dyn Locker> =
            Arc::new(InProcessLocker::new(Arc::clone(&time_provider)));
        let compactor = Arc::new(Compactor::new(
            backend,
            locker,
            time_provider,
            CompactorConfig {
                max_block_bytes: args.compaction.max_block_bytes,
                max_files_per_batch: args.compaction.max_files_per_batch,
                lock_lease: Duration::from_secs(args.compaction.lock_lease_seconds),
            },
        ));

        Ok(Self {
            writer,
            processor,
            issues,
            reader,
            lifecycle,
            intake,
            resolver,
            bus,
            compactor,
            sse: query_lifecycle::SseConfig {
                poll_interval: Duration::from_micros(args.sse.poll_micros),
                heartbeat: Duration::from_secs(args.sse.heartbeat_seconds),
                max_duration: Duration::from_secs(args.sse.max_seconds),
            },
        })
    }
}

/// Runs everything until SIGINT.
pub async fn run(args: RunArgs) -> Result<(), Error> {
    let components = Components::build(&args)?;
    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    // event processing
    {
        let processor = Arc::clone(&components.processor);
        let consumer = components.bus.consumer(queues::PROCESS_EVENTS);
        let token = shutdown.clone();
        tasks.spawn(async move { processor.run(consumer, token).await });
    }
    // query execution
    {
        let lifecycle = Arc::clone(&components.lifecycle);
        let consumer = components.bus.consumer(queues::EXECUTE_QUERIES);
        let token = shutdown.clone();
        tasks.spawn(async move { lifecycle.run_execute_loop(consumer, token).await });
    }
    // deferred facet batches
    {
        let lifecycle = Arc::clone(&components.lifecycle);
        let consumer = components.bus.consumer(queues::FACET_BATCHES);
        let token = shutdown.clone();
        tasks.spawn(async move { lifecycle.run_facet_loop(consumer, token).await });
    }
    // periodic writer flush
    {
        let writer = Arc::clone(&components.writer);
        let token = shutdown.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(WRITER_FLUSH_INTERVAL) => {}
                    _ = token.cancelled() => return,
                }
                if let Err(error) = writer.flush().await {
                    warn!(%error, "periodic flush failed");
                }
            }
        });
    }
    // scheduled compaction, when enabled
    if let Some(interval) = args.compaction.interval_seconds {
        let compactor = Arc::clone(&components.compactor);
        let token = shutdown.clone();
        tasks.spawn(async move {
            let interval = Duration::from_secs(interval);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = token.cancelled() => return,
                }
                compactor.run(&CompactionTarget::default()).await;
            }
        });
    }

    let app = crate::http::router(crate::http::AppState::new(&components));
    let addr = args.run.http_bind.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| Error::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!(%addr, "listening");

    let serve_token = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_token.cancelled().await });

    tokio::select! {
        result = async { server.await } => result.map_err(Error::Serve)?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}
    Ok(())
}

/// One compaction pass over the targeted partitions.
pub async fn compact(args: CompactArgs) -> Result<(), Error> {
    let backend = args.storage.make_backend()?;
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
    let locker: Arc<dyn Locker> = Arc::new(InProcessLocker::new(Arc::clone(&time_provider)));
    let compactor = Compactor::new(
        backend,
        locker,
        time_provider,
        CompactorConfig {
            max_block_bytes: args.compaction.max_block_bytes,
            max_files_per_batch: args.compaction.max_files_per_batch,
            lock_lease: Duration::from_secs(args.compaction.lock_lease_seconds),
        },
    );

    let target = CompactionTarget {
        organization_id: args.organization_id,
        project_id: args.project_id,
        event_type: args.event_type,
        date: args.date,
    };
    let summary = compactor.run(&target).await;
    println!("{summary}");
    Ok(())
}
