//! Query dispatch and the deferred facet batch fan-out.
//!
//! Submitting a query stores a `pending` entry and enqueues an
//! `ExecuteQuery`. The executor handler runs the scan, stores the result and
//! fans out one `ComputeFacetBatch` per deferred attribute group; each batch
//! replays the reader with its own projection and appends its facets back
//! into the stored result, so consumers observe facets progressively.

use crate::AsyncQueryStore;
use data_types::{AsyncQueryState, QueryRequest, RequestContext};
use event_bus::{queues, Message, MessageBus, QueueConsumer};
use observability_deps::tracing::{debug, warn};
use querier::QueryExecutor;
use snafu::{ResultExt, Snafu};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The deferred facet batches: id → attribute set.
pub const DEFERRED_FACET_BATCHES: &[(&str, &[&str])] = &[
    ("device", &["device_model", "os_name", "os_version"]),
    ("app", &["app_version", "app_build"]),
    ("trace", &["operation", "span_status"]),
    ("user", &["user_id", "locale"]),
];

/// Attribute set of a deferred batch.
pub fn batch_attributes(batch_id: &str) -> Option<&'static [&'static str]> {
    DEFERRED_FACET_BATCHES
        .iter()
        .find(|(id, _)| *id == batch_id)
        .map(|(_, attributes)| *attributes)
}

/// Errors surfaced by the lifecycle service.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Failed to enqueue message: {}", source))]
    Publish { source: event_bus::Error },

    #[snafu(display("Store refused the transition: {}", source))]
    Store { source: crate::store::Error },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Front door and message handlers of the asynchronous query subsystem.
#[derive(Debug)]
pub struct QueryLifecycle {
    store: Arc<AsyncQueryStore>,
    executor: Arc<QueryExecutor>,
    bus: Arc<dyn MessageBus>,
}

impl QueryLifecycle {
    /// New lifecycle over the given collaborators.
    pub fn new(
        store: Arc<AsyncQueryStore>,
        executor: Arc<QueryExecutor>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            store,
            executor,
            bus,
        }
    }

    /// Borrow of the state store.
    pub fn store(&self) -> &Arc<AsyncQueryStore> {
        &self.store
    }

    /// Accepts a query: stores the `pending` entry and enqueues execution.
    pub async fn submit(
        &self,
        request: QueryRequest,
        context: RequestContext,
    ) -> Result<AsyncQueryState> {
        let state = self.store.initialize_query(request.clone(), &context);
        self.bus
            .publish(
                queues::EXECUTE_QUERIES,
                Message::ExecuteQuery {
                    query_id: state.query_id.clone(),
                    request,
                    context,
                },
            )
            .await
            .context(PublishSnafu)?;
        Ok(state)
    }

    /// Handles one `ExecuteQuery` message.
    pub async fn handle_execute(&self, message: Message) {
        let Message::ExecuteQuery {
            query_id,
            request,
            context,
        } = message
        else {
            warn!("foreign message on the execute queue, dropping");
            return;
        };

        // a cancellation that raced submission wins before any work starts
        if self.store.is_cancelled(&query_id) {
            if let Err(error) = self.store.mark_cancelled(&query_id) {
                debug!(%query_id, %error, "query gone before execution");
            }
            return;
        }

        if let Err(error) = self.store.mark_in_progress(&query_id, 0) {
            // a redelivered message must not restart a running or settled query
            debug!(%query_id, %error, "skipping execution");
            return;
        }

        let store = Arc::clone(&self.store);
        let progress_id = query_id.clone();
        let mut on_progress = move |progress: u8| {
            if let Err(error) = store.update_progress(&progress_id, progress) {
                debug!(query_id = %progress_id, %error, "progress update dropped");
            }
        };
        let cancel_store = Arc::clone(&self.store);
        let cancel_id = query_id.clone();
        let is_cancelled = move || cancel_store.is_cancelled(&cancel_id);

        match self
            .executor
            .execute(&request, &context, &mut on_progress, &is_cancelled)
            .await
        {
            Ok(result) => {
                if let Err(error) = self.store.store_result(&query_id, result) {
                    warn!(%query_id, %error, "result dropped");
                    return;
                }
                self.dispatch_facet_batches(&query_id, &request, &context)
                    .await;
            }
            Err(querier::ExecError::Cancelled) => {
                if let Err(error) = self.store.mark_cancelled(&query_id) {
                    debug!(%query_id, %error, "cancellation already settled");
                }
            }
            Err(error) => {
                if let Err(store_error) = self.store.store_error(&query_id, &error.to_string()) {
                    warn!(%query_id, %store_error, "failure dropped");
                }
            }
        }
    }

    /// Initializes the deferred batches and enqueues one message per batch.
    async fn dispatch_facet_batches(
        &self,
        query_id: &str,
        request: &QueryRequest,
        context: &RequestContext,
    ) {
        let batch_ids: Vec<&str> = DEFERRED_FACET_BATCHES.iter().map(|(id, _)| *id).collect();
        if let Err(error) = self.store.initialize_facet_batches(query_id, &batch_ids) {
            warn!(%query_id, %error, "facet batches not initialized");
            return;
        }
        for batch_id in batch_ids {
            let message = Message::ComputeFacetBatch {
                query_id: query_id.to_string(),
                batch_id: batch_id.to_string(),
                request: request.clone(),
                context: context.clone(),
            };
            if let Err(error) = self.bus.publish(queues::FACET_BATCHES, message).await {
                warn!(%query_id, batch_id, %error, "facet batch not enqueued");
            }
        }
    }

    /// Handles one `ComputeFacetBatch` message.
    pub async fn handle_facet_batch(&self, message: Message) {
        let Message::ComputeFacetBatch {
            query_id,
            batch_id,
            request,
            context,
        } = message
        else {
            warn!("foreign message on the facet batch queue, dropping");
            return;
        };

        // cancelled queries leave their batches pending
        if self.store.is_cancelled(&query_id) {
            debug!(%query_id, batch_id, "query cancelled, batch skipped");
            return;
        }

        let Some(attributes) = batch_attributes(&batch_id) else {
            warn!(%query_id, batch_id, "unknown facet batch id");
            return;
        };
        let attributes: Vec<String> = attributes.iter().map(|s| s.to_string()).collect();

        let cancel_store = Arc::clone(&self.store);
        let cancel_id = query_id.clone();
        let is_cancelled = move || cancel_store.is_cancelled(&cancel_id);

        match self
            .executor
            .compute_facets(&request, &context, &attributes, &is_cancelled)
            .await
        {
            Ok(facets) => {
                if let Err(error) = self.store.append_facets(&query_id, &batch_id, facets) {
                    debug!(%query_id, batch_id, %error, "facets not appended");
                }
            }
            Err(querier::ExecError::Cancelled) => {
                debug!(%query_id, batch_id, "batch cancelled mid-scan, left pending");
            }
            Err(error) => {
                if let Err(store_error) =
                    self.store
                        .mark_facet_batch_failed(&query_id, &batch_id, &error.to_string())
                {
                    debug!(%query_id, batch_id, %store_error, "batch failure dropped");
                }
            }
        }
    }

    /// Runs the execute-queries consume loop until shutdown.
    pub async fn run_execute_loop(&self, consumer: QueueConsumer, shutdown: CancellationToken) {
        loop {
            let message = tokio::select! {
                message = consumer.recv() => message,
                _ = shutdown.cancelled() => None,
            };
            let Some(message) = message else { break };
            self.handle_execute(message).await;
        }
    }

    /// Runs the facet-batches consume loop until shutdown.
    pub async fn run_facet_loop(&self, consumer: QueueConsumer, shutdown: CancellationToken) {
        loop {
            let message = tokio::select! {
                message = consumer.recv() => message,
                _ = shutdown.cancelled() => None,
            };
            let Some(message) = message else { break };
            self.handle_facet_batch(message).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::{MockProvider, TimeProvider};
    use data_types::{
        EventFilter, EventType, FilterOp, QueryStatus, Severity, WideEvent,
    };
    use event_bus::MemoryBus;
    use ingester::PartitionedWriter;
    use kv_cache::MemoryCache;
    use querier::{EventReader, ExecutorConfig};
    use serde_json::json;
    use storage::ObjectBackend;

    const DAY1: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z

    fn context() -> RequestContext {
        RequestContext {
            user_id: "user-1".into(),
            organization_id: "org-a".into(),
        }
    }

    fn event(n: u8) -> WideEvent {
        WideEvent {
            event_id: format!("0191e2f0-0000-7000-8000-0000000000{n:02}"),
            timestamp: DAY1 + i64::from(n) * 60_000,
            organization_id: Some("org-a".into()),
            project_id: "proj-a".into(),
            event_type: EventType::Error,
            severity: Some(Severity::Error),
            device_model: Some("Pixel 8".into()),
            app_version: Some("1.2.3".into()),
            operation: Some("GET /users".into()),
            span_status: Some("ok".into()),
            user_id: Some("user-9".into()),
            locale: Some("en-US".into()),
            ..Default::default()
        }
    }

    struct Fixture {
        bus: Arc<MemoryBus>,
        lifecycle: QueryLifecycle,
    }

    async fn fixture(events: Vec<WideEvent>) -> Fixture {
        let backend = ObjectBackend::new_in_memory();
        if !events.is_empty() {
            let writer = PartitionedWriter::new(backend.clone(), 1000);
            writer.write_events(&events).await.unwrap();
        }

        let time_provider: Arc<dyn TimeProvider> =
            Arc::new(MockProvider::from_timestamp_millis(DAY1));
        let cache = Arc::new(MemoryCache::new(Arc::clone(&time_provider)));
        let store = Arc::new(AsyncQueryStore::new(
            cache,
            time_provider,
            crate::StoreConfig::default(),
        ));
        let executor = Arc::new(QueryExecutor::new(
            EventReader::new(backend),
            ExecutorConfig::default(),
        ));
        let bus = Arc::new(MemoryBus::new());
        let lifecycle = QueryLifecycle::new(store, executor, Arc::clone(&bus) as _);
        Fixture { bus, lifecycle }
    }

    fn request() -> QueryRequest {
        QueryRequest {
            project_id: Some("proj-a".into()),
            filters: vec![EventFilter::new("event_type", FilterOp::Eq, json!("error"))],
            start_date: Some(DAY1),
            end_date: Some(DAY1 + 86_399_999),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn happy_path_executes_and_dispatches_batches() {
        let f = fixture((1..=4).map(event).collect()).await;

        let state = f.lifecycle.submit(request(), context()).await.unwrap();
        assert_eq!(state.status, QueryStatus::Pending);
        assert_eq!(f.bus.depth(queues::EXECUTE_QUERIES), 1);

        let message = f.bus.consumer(queues::EXECUTE_QUERIES).try_recv().unwrap();
        f.lifecycle.handle_execute(message).await;

        let state = f
            .lifecycle
            .store()
            .get_query_state(&state.query_id)
            .unwrap();
        assert_eq!(state.status, QueryStatus::Completed);
        let result = state.result.as_ref().unwrap();
        assert_eq!(result.total, 4);

        // one message per deferred batch
        assert_eq!(f.bus.depth(queues::FACET_BATCHES), 4);
        assert_eq!(state.facet_batches.len(), 4);
        let pending = f
            .lifecycle
            .store()
            .get_pending_facet_batches(&state.query_id)
            .unwrap();
        assert_eq!(pending.len(), 4);
    }

    #[tokio::test]
    async fn facet_batches_append_progressively() {
        let f = fixture((1..=4).map(event).collect()).await;
        let state = f.lifecycle.submit(request(), context()).await.unwrap();
        let query_id = state.query_id.clone();

        let execute = f.bus.consumer(queues::EXECUTE_QUERIES).try_recv().unwrap();
        f.lifecycle.handle_execute(execute).await;
        let baseline = f
            .lifecycle
            .store()
            .get_query_state(&query_id)
            .unwrap()
            .result
            .unwrap()
            .facets
            .len();

        let consumer = f.bus.consumer(queues::FACET_BATCHES);
        let mut facet_count = baseline;
        for _ in 0..4 {
            let message = consumer.try_recv().unwrap();
            f.lifecycle.handle_facet_batch(message).await;
            let facets = f
                .lifecycle
                .store()
                .get_query_state(&query_id)
                .unwrap()
                .result
                .unwrap()
                .facets
                .len();
            assert!(facets >= facet_count);
            facet_count = facets;
        }

        assert!(f
            .lifecycle
            .store()
            .are_facet_batches_complete(&query_id)
            .unwrap());
        let completed = f
            .lifecycle
            .store()
            .get_completed_facet_batches(&query_id)
            .unwrap();
        assert_eq!(completed.len(), 4);
        // every deferred attribute with data contributed a facet
        let state = f.lifecycle.store().get_query_state(&query_id).unwrap();
        let attributes: Vec<String> = state
            .result
            .unwrap()
            .facets
            .iter()
            .map(|f| f.attribute.clone())
            .collect();
        for expected in ["device_model", "app_version", "operation", "user_id"] {
            assert!(
                attributes.iter().any(|a| a == expected),
                "missing facet {expected}"
            );
        }
    }

    #[tokio::test]
    async fn cancellation_before_execution_wins() {
        let f = fixture((1..=4).map(event).collect()).await;
        let state = f.lifecycle.submit(request(), context()).await.unwrap();
        let query_id = state.query_id.clone();

        f.lifecycle.store().request_cancellation(&query_id).unwrap();

        let message = f.bus.consumer(queues::EXECUTE_QUERIES).try_recv().unwrap();
        f.lifecycle.handle_execute(message).await;

        let state = f.lifecycle.store().get_query_state(&query_id).unwrap();
        assert_eq!(state.status, QueryStatus::Cancelled);
        // no facet batches were ever enqueued
        assert_eq!(f.bus.depth(queues::FACET_BATCHES), 0);
        assert!(state.facet_batches.is_empty());
    }

    #[tokio::test]
    async fn cancelled_batches_stay_pending() {
        let f = fixture((1..=4).map(event).collect()).await;
        let state = f.lifecycle.submit(request(), context()).await.unwrap();
        let query_id = state.query_id.clone();

        let execute = f.bus.consumer(queues::EXECUTE_QUERIES).try_recv().unwrap();
        f.lifecycle.handle_execute(execute).await;

        // cancellation arrives after completion is terminal, so it is refused;
        // simulate instead a cancel flag raced in during batch processing by
        // deleting the query, which batch handlers treat as cancelled
        f.lifecycle.store().delete_query(&query_id);

        let consumer = f.bus.consumer(queues::FACET_BATCHES);
        let message = consumer.try_recv().unwrap();
        f.lifecycle.handle_facet_batch(message).await;
        // nothing to assert on the deleted query beyond "no panic, no append"
        assert!(f.lifecycle.store().get_query_state(&query_id).is_err());
    }

    #[tokio::test]
    async fn redelivered_execute_is_ignored() {
        let f = fixture((1..=2).map(event).collect()).await;
        let state = f.lifecycle.submit(request(), context()).await.unwrap();
        let query_id = state.query_id.clone();

        let message = f.bus.consumer(queues::EXECUTE_QUERIES).try_recv().unwrap();
        f.lifecycle.handle_execute(message.clone()).await;
        let settled = f.lifecycle.store().get_query_state(&query_id).unwrap();

        // the queue redelivers; the settled state must not change
        f.lifecycle.handle_execute(message).await;
        let after = f.lifecycle.store().get_query_state(&query_id).unwrap();
        assert_eq!(after.status, settled.status);
        assert_eq!(after.result, settled.result);
        // no duplicate batch fan-out
        assert_eq!(f.bus.depth(queues::FACET_BATCHES), 4);
    }

    #[tokio::test]
    async fn executor_failure_stores_error() {
        // a query over a store whose only candidate file is corrupt
        let backend = ObjectBackend::new_in_memory();
        backend
            .write(
                "organization_id=org-a/project_id=proj-a/event_type=error/dt=2024-01-01/events_000000_0191e2f0-0000-7000-8000-00000000ffff.parquet",
                bytes::Bytes::from_static(b"garbage"),
            )
            .await
            .unwrap();

        let time_provider: Arc<dyn TimeProvider> =
            Arc::new(MockProvider::from_timestamp_millis(DAY1));
        let cache = Arc::new(MemoryCache::new(Arc::clone(&time_provider)));
        let store = Arc::new(AsyncQueryStore::new(
            cache,
            time_provider,
            crate::StoreConfig::default(),
        ));
        let executor = Arc::new(QueryExecutor::new(
            EventReader::new(backend),
            ExecutorConfig::default(),
        ));
        let bus = Arc::new(MemoryBus::new());
        let lifecycle = QueryLifecycle::new(store, executor, Arc::clone(&bus) as _);

        let state = lifecycle.submit(request(), context()).await.unwrap();
        let message = bus.consumer(queues::EXECUTE_QUERIES).try_recv().unwrap();
        lifecycle.handle_execute(message).await;

        let state = lifecycle.store().get_query_state(&state.query_id).unwrap();
        assert_eq!(state.status, QueryStatus::Failed);
        assert!(state.error.is_some());
        assert_eq!(bus.depth(queues::FACET_BATCHES), 0);
    }
}
