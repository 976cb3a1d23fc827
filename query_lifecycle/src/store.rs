//! The cache-backed state machine for one asynchronous query.
//!
//! Every mutation goes through the cache's atomic `update`, so concurrent
//! facet batch appends, progress updates and cancellation requests against
//! the same query never lose writes. Status transitions follow
//! `pending → in_progress → (completed | failed | cancelled)` with no
//! back-edges; terminal entries only linger for the short terminal TTL.

use clock::TimeProvider;
use data_types::{
    AsyncQueryState, Facet, FacetBatchState, FacetBatchStatus, QueryRequest, QueryResult,
    QueryStatus, RequestContext,
};
use kv_cache::{KeyValueCache, Update};
use observability_deps::tracing::debug;
use snafu::Snafu;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default lifetime of a query that has not reached a terminal status.
pub const DEFAULT_TTL_PENDING: Duration = Duration::from_secs(3600);
/// Default lifetime of a terminal query.
pub const DEFAULT_TTL_TERMINAL: Duration = Duration::from_secs(300);

/// Errors surfaced by the store.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Query '{}' not found", query_id))]
    NotFound { query_id: String },

    #[snafu(display("Query '{}' is already terminal", query_id))]
    AlreadyTerminal { query_id: String },

    #[snafu(display(
        "Query '{}' cannot transition from {} to {}",
        query_id,
        from,
        to
    ))]
    InvalidTransition {
        query_id: String,
        from: QueryStatus,
        to: QueryStatus,
    },

    #[snafu(display("Facet batches of query '{}' are already initialized", query_id))]
    BatchesInitialized { query_id: String },

    #[snafu(display("Query '{}' has no facet batch '{}'", query_id, batch_id))]
    UnknownBatch { query_id: String, batch_id: String },

    #[snafu(display("Facet batch '{}' of query '{}' is already settled", batch_id, query_id))]
    BatchSettled { query_id: String, batch_id: String },

    #[snafu(display("Stored state of query '{}' does not parse: {}", query_id, message))]
    Corrupt { query_id: String, message: String },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// TTL configuration of the store.
#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// Lifetime of non-terminal entries.
    pub ttl_pending: Duration,
    /// Lifetime of terminal entries.
    pub ttl_terminal: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl_pending: DEFAULT_TTL_PENDING,
            ttl_terminal: DEFAULT_TTL_TERMINAL,
        }
    }
}

/// The shared query-state store.
#[derive(Debug)]
pub struct AsyncQueryStore {
    cache: Arc<dyn KeyValueCache>,
    time_provider: Arc<dyn TimeProvider>,
    config: StoreConfig,
}

fn cache_key(query_id: &str) -> String {
    format!("query:{query_id}")
}

impl AsyncQueryStore {
    /// New store over the given cache and clock.
    pub fn new(
        cache: Arc<dyn KeyValueCache>,
        time_provider: Arc<dyn TimeProvider>,
        config: StoreConfig,
    ) -> Self {
        Self {
            cache,
            time_provider,
            config,
        }
    }

    /// Creates the entry for a freshly submitted query and returns it.
    pub fn initialize_query(
        &self,
        request: QueryRequest,
        context: &RequestContext,
    ) -> AsyncQueryState {
        let now = self.time_provider.now_millis();
        let state = AsyncQueryState {
            query_id: Uuid::now_v7().to_string(),
            status: QueryStatus::Pending,
            progress: 0,
            query_request: request,
            user_id: context.user_id.clone(),
            organization_id: context.organization_id.clone(),
            result: None,
            error: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
            facet_batches: BTreeMap::new(),
        };
        let raw = serde_json::to_string(&state).expect("state is serializable");
        self.cache
            .put(&cache_key(&state.query_id), raw, self.config.ttl_pending);
        debug!(query_id = %state.query_id, "query initialized");
        state
    }

    /// Current state of a query.
    pub fn get_query_state(&self, query_id: &str) -> Result<AsyncQueryState> {
        let raw = self
            .cache
            .get(&cache_key(query_id))
            .ok_or_else(|| Error::NotFound {
                query_id: query_id.to_string(),
            })?;
        parse_state(query_id, &raw)
    }

    /// Removes a query outright.
    pub fn delete_query(&self, query_id: &str) -> bool {
        self.cache.remove(&cache_key(query_id))
    }

    /// `pending → in_progress`, setting the initial progress.
    pub fn mark_in_progress(&self, query_id: &str, progress: u8) -> Result<AsyncQueryState> {
        self.mutate(query_id, |state| {
            if state.status != QueryStatus::Pending {
                return Err(Error::InvalidTransition {
                    query_id: state.query_id.clone(),
                    from: state.status,
                    to: QueryStatus::InProgress,
                });
            }
            state.status = QueryStatus::InProgress;
            state.progress = progress.min(100);
            Ok(())
        })
    }

    /// Monotonically raises the progress of a non-terminal query.
    pub fn update_progress(&self, query_id: &str, progress: u8) -> Result<AsyncQueryState> {
        self.mutate(query_id, |state| {
            if state.status.is_terminal() {
                return Err(Error::AlreadyTerminal {
                    query_id: state.query_id.clone(),
                });
            }
            state.progress = state.progress.max(progress.min(100));
            Ok(())
        })
    }

    /// Stores the result: `pending | in_progress → completed`.
    pub fn store_result(&self, query_id: &str, result: QueryResult) -> Result<AsyncQueryState> {
        let now = self.time_provider.now_millis();
        self.mutate(query_id, move |state| {
            if state.status.is_terminal() {
                return Err(Error::InvalidTransition {
                    query_id: state.query_id.clone(),
                    from: state.status,
                    to: QueryStatus::Completed,
                });
            }
            state.status = QueryStatus::Completed;
            state.progress = 100;
            state.result = Some(result.clone());
            state.completed_at = Some(now);
            Ok(())
        })
    }

    /// Stores a failure: any non-terminal status → `failed`.
    pub fn store_error(&self, query_id: &str, message: &str) -> Result<AsyncQueryState> {
        let now = self.time_provider.now_millis();
        self.mutate(query_id, move |state| {
            if state.status.is_terminal() {
                return Err(Error::InvalidTransition {
                    query_id: state.query_id.clone(),
                    from: state.status,
                    to: QueryStatus::Failed,
                });
            }
            state.status = QueryStatus::Failed;
            state.error = Some(message.to_string());
            state.completed_at = Some(now);
            Ok(())
        })
    }

    /// Flags cancellation on a non-terminal query. Idempotent while the query
    /// is live; refuses once it is terminal.
    pub fn request_cancellation(&self, query_id: &str) -> Result<AsyncQueryState> {
        self.mutate(query_id, |state| {
            if state.status.is_terminal() {
                return Err(Error::AlreadyTerminal {
                    query_id: state.query_id.clone(),
                });
            }
            state.cancel_requested = true;
            Ok(())
        })
    }

    /// Settles a cancellation: any non-terminal status → `cancelled`.
    pub fn mark_cancelled(&self, query_id: &str) -> Result<AsyncQueryState> {
        let now = self.time_provider.now_millis();
        self.mutate(query_id, move |state| {
            if state.status.is_terminal() {
                return Err(Error::InvalidTransition {
                    query_id: state.query_id.clone(),
                    from: state.status,
                    to: QueryStatus::Cancelled,
                });
            }
            state.status = QueryStatus::Cancelled;
            state.completed_at = Some(now);
            Ok(())
        })
    }

    /// Whether work on behalf of this query should stop.
    ///
    /// A query that is gone (expired or deleted) also answers `true`: nobody
    /// is waiting for its results anymore.
    pub fn is_cancelled(&self, query_id: &str) -> bool {
        match self.get_query_state(query_id) {
            Ok(state) => state.cancel_requested || state.status == QueryStatus::Cancelled,
            Err(_) => true,
        }
    }

    /// Creates the facet batch slots; allowed exactly once per query.
    pub fn initialize_facet_batches(
        &self,
        query_id: &str,
        batch_ids: &[&str],
    ) -> Result<AsyncQueryState> {
        self.mutate(query_id, |state| {
            if !state.facet_batches.is_empty() {
                return Err(Error::BatchesInitialized {
                    query_id: state.query_id.clone(),
                });
            }
            for batch_id in batch_ids {
                state
                    .facet_batches
                    .insert(batch_id.to_string(), FacetBatchState::pending());
            }
            Ok(())
        })
    }

    /// Appends one batch's facets: batch `pending → completed`, and the main
    /// result's facet list grows by the contribution.
    pub fn append_facets(
        &self,
        query_id: &str,
        batch_id: &str,
        facets: Vec<Facet>,
    ) -> Result<AsyncQueryState> {
        self.mutate(query_id, move |state| {
            let batch = state.facet_batches.get_mut(batch_id).ok_or_else(|| {
                Error::UnknownBatch {
                    query_id: state.query_id.clone(),
                    batch_id: batch_id.to_string(),
                }
            })?;
            if batch.status != FacetBatchStatus::Pending {
                return Err(Error::BatchSettled {
                    query_id: state.query_id.clone(),
                    batch_id: batch_id.to_string(),
                });
            }
            batch.status = FacetBatchStatus::Completed;
            batch.facets = facets.clone();
            if let Some(result) = &mut state.result {
                result.facets.extend(facets.clone());
            }
            Ok(())
        })
    }

    /// Fails one batch: `pending → failed`.
    pub fn mark_facet_batch_failed(
        &self,
        query_id: &str,
        batch_id: &str,
        message: &str,
    ) -> Result<AsyncQueryState> {
        self.mutate(query_id, move |state| {
            let batch = state.facet_batches.get_mut(batch_id).ok_or_else(|| {
                Error::UnknownBatch {
                    query_id: state.query_id.clone(),
                    batch_id: batch_id.to_string(),
                }
            })?;
            if batch.status != FacetBatchStatus::Pending {
                return Err(Error::BatchSettled {
                    query_id: state.query_id.clone(),
                    batch_id: batch_id.to_string(),
                });
            }
            batch.status = FacetBatchStatus::Failed;
            batch.error = Some(message.to_string());
            Ok(())
        })
    }

    /// Batch ids still pending.
    pub fn get_pending_facet_batches(&self, query_id: &str) -> Result<Vec<String>> {
        let state = self.get_query_state(query_id)?;
        Ok(state
            .facet_batches
            .iter()
            .filter(|(_, batch)| batch.status == FacetBatchStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect())
    }

    /// Whether every initialized batch has settled.
    pub fn are_facet_batches_complete(&self, query_id: &str) -> Result<bool> {
        let state = self.get_query_state(query_id)?;
        Ok(!state.facet_batches.is_empty()
            && state
                .facet_batches
                .values()
                .all(|batch| batch.status != FacetBatchStatus::Pending))
    }

    /// The settled-successfully batches with their facets.
    pub fn get_completed_facet_batches(
        &self,
        query_id: &str,
    ) -> Result<Vec<(String, FacetBatchState)>> {
        let state = self.get_query_state(query_id)?;
        Ok(state
            .facet_batches
            .into_iter()
            .filter(|(_, batch)| batch.status == FacetBatchStatus::Completed)
            .collect())
    }

    /// Atomic read-modify-write of one query's state.
    fn mutate(
        &self,
        query_id: &str,
        f: impl Fn(&mut AsyncQueryState) -> Result<()>,
    ) -> Result<AsyncQueryState> {
        let now = self.time_provider.now_millis();
        let mut outcome = Err(Error::NotFound {
            query_id: query_id.to_string(),
        });

        self.cache.update(&cache_key(query_id), &mut |current| {
            let Some(raw) = current else {
                outcome = Err(Error::NotFound {
                    query_id: query_id.to_string(),
                });
                return Update::Keep;
            };
            let mut state = match parse_state(query_id, raw) {
                Ok(state) => state,
                Err(error) => {
                    outcome = Err(error);
                    return Update::Keep;
                }
            };
            match f(&mut state) {
                Err(error) => {
                    outcome = Err(error);
                    Update::Keep
                }
                Ok(()) => {
                    state.updated_at = now;
                    let ttl = if state.status.is_terminal() {
                        self.config.ttl_terminal
                    } else {
                        self.config.ttl_pending
                    };
                    let raw = serde_json::to_string(&state).expect("state is serializable");
                    outcome = Ok(state);
                    Update::Put(raw, ttl)
                }
            }
        });

        outcome
    }
}

fn parse_state(query_id: &str, raw: &str) -> Result<AsyncQueryState> {
    serde_json::from_str(raw).map_err(|e| Error::Corrupt {
        query_id: query_id.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use clock::MockProvider;
    use kv_cache::MemoryCache;

    struct Fixture {
        time_provider: Arc<MockProvider>,
        store: AsyncQueryStore,
    }

    fn fixture() -> Fixture {
        let time_provider = Arc::new(MockProvider::from_timestamp_millis(1_700_000_000_000));
        let cache = Arc::new(MemoryCache::new(
            Arc::clone(&time_provider) as Arc<dyn TimeProvider>
        ));
        let store = AsyncQueryStore::new(
            cache,
            Arc::clone(&time_provider) as Arc<dyn TimeProvider>,
            StoreConfig::default(),
        );
        Fixture {
            time_provider,
            store,
        }
    }

    fn context() -> RequestContext {
        RequestContext {
            user_id: "user-1".into(),
            organization_id: "org-1".into(),
        }
    }

    fn submit(store: &AsyncQueryStore) -> String {
        store
            .initialize_query(QueryRequest::default(), &context())
            .query_id
    }

    #[test]
    fn happy_path_transitions() {
        let f = fixture();
        let id = submit(&f.store);

        let state = f.store.get_query_state(&id).unwrap();
        assert_eq!(state.status, QueryStatus::Pending);
        assert_eq!(state.progress, 0);

        f.store.mark_in_progress(&id, 5).unwrap();
        f.store.update_progress(&id, 50).unwrap();
        let state = f.store.get_query_state(&id).unwrap();
        assert_eq!(state.status, QueryStatus::InProgress);
        assert_eq!(state.progress, 50);

        let state = f.store.store_result(&id, QueryResult::default()).unwrap();
        assert_eq!(state.status, QueryStatus::Completed);
        assert_eq!(state.progress, 100);
        assert!(state.result.is_some());
        assert!(state.completed_at.is_some());
    }

    #[test]
    fn no_back_edges() {
        let f = fixture();
        let id = submit(&f.store);
        f.store.mark_in_progress(&id, 0).unwrap();

        // a second executor cannot re-enter in_progress
        assert_matches!(
            f.store.mark_in_progress(&id, 0),
            Err(Error::InvalidTransition { .. })
        );

        f.store.store_result(&id, QueryResult::default()).unwrap();
        // terminal states never mutate back
        assert_matches!(
            f.store.store_error(&id, "late failure"),
            Err(Error::InvalidTransition { .. })
        );
        assert_matches!(
            f.store.mark_cancelled(&id),
            Err(Error::InvalidTransition { .. })
        );
        assert_matches!(
            f.store.update_progress(&id, 99),
            Err(Error::AlreadyTerminal { .. })
        );
        let state = f.store.get_query_state(&id).unwrap();
        assert_eq!(state.status, QueryStatus::Completed);
    }

    #[test]
    fn progress_is_monotonic() {
        let f = fixture();
        let id = submit(&f.store);
        f.store.mark_in_progress(&id, 10).unwrap();
        f.store.update_progress(&id, 40).unwrap();
        // a late, lower update is ignored
        let state = f.store.update_progress(&id, 20).unwrap();
        assert_eq!(state.progress, 40);
    }

    #[test]
    fn cancellation_flow() {
        let f = fixture();
        let id = submit(&f.store);
        assert!(!f.store.is_cancelled(&id));

        f.store.request_cancellation(&id).unwrap();
        assert!(f.store.is_cancelled(&id));
        // idempotent while live
        f.store.request_cancellation(&id).unwrap();

        f.store.mark_cancelled(&id).unwrap();
        let state = f.store.get_query_state(&id).unwrap();
        assert_eq!(state.status, QueryStatus::Cancelled);

        // refused once terminal
        assert_matches!(
            f.store.request_cancellation(&id),
            Err(Error::AlreadyTerminal { .. })
        );
    }

    #[test]
    fn unknown_queries_count_as_cancelled() {
        let f = fixture();
        assert!(f.store.is_cancelled("no-such-query"));
        assert_matches!(
            f.store.get_query_state("no-such-query"),
            Err(Error::NotFound { .. })
        );
    }

    #[test]
    fn facet_batches_initialize_exactly_once() {
        let f = fixture();
        let id = submit(&f.store);
        f.store
            .initialize_facet_batches(&id, &["device", "app"])
            .unwrap();
        assert_matches!(
            f.store.initialize_facet_batches(&id, &["trace"]),
            Err(Error::BatchesInitialized { .. })
        );

        let pending = f.store.get_pending_facet_batches(&id).unwrap();
        assert_eq!(pending, vec!["app".to_string(), "device".to_string()]);
        assert!(!f.store.are_facet_batches_complete(&id).unwrap());
    }

    #[test]
    fn facet_batches_settle_at_most_once() {
        let f = fixture();
        let id = submit(&f.store);
        f.store.mark_in_progress(&id, 0).unwrap();
        f.store.store_result(&id, QueryResult::default()).unwrap();
        f.store
            .initialize_facet_batches(&id, &["device", "app"])
            .unwrap();

        let facets = vec![Facet {
            attribute: "device_model".into(),
            values: vec![],
        }];
        f.store.append_facets(&id, "device", facets).unwrap();
        assert_matches!(
            f.store.append_facets(&id, "device", vec![]),
            Err(Error::BatchSettled { .. })
        );

        f.store
            .mark_facet_batch_failed(&id, "app", "boom")
            .unwrap();
        assert_matches!(
            f.store.mark_facet_batch_failed(&id, "app", "boom again"),
            Err(Error::BatchSettled { .. })
        );

        assert!(f.store.are_facet_batches_complete(&id).unwrap());
        let completed = f.store.get_completed_facet_batches(&id).unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].0, "device");

        // the main result grew by the appended facets
        let state = f.store.get_query_state(&id).unwrap();
        let result = state.result.unwrap();
        assert_eq!(result.facets.len(), 1);
        assert_eq!(result.facets[0].attribute, "device_model");
    }

    #[test]
    fn unknown_batch_is_an_error() {
        let f = fixture();
        let id = submit(&f.store);
        f.store.initialize_facet_batches(&id, &["device"]).unwrap();
        assert_matches!(
            f.store.append_facets(&id, "nope", vec![]),
            Err(Error::UnknownBatch { .. })
        );
    }

    #[test]
    fn pending_entries_expire_after_the_pending_ttl() {
        let f = fixture();
        let id = submit(&f.store);
        f.time_provider.inc(Duration::from_secs(3599));
        assert!(f.store.get_query_state(&id).is_ok());
        f.time_provider.inc(Duration::from_secs(2));
        assert_matches!(f.store.get_query_state(&id), Err(Error::NotFound { .. }));
    }

    #[test]
    fn terminal_entries_expire_faster() {
        let f = fixture();
        let id = submit(&f.store);
        f.store.mark_in_progress(&id, 0).unwrap();
        f.store.store_result(&id, QueryResult::default()).unwrap();

        f.time_provider.inc(Duration::from_secs(299));
        assert!(f.store.get_query_state(&id).is_ok());
        f.time_provider.inc(Duration::from_secs(2));
        assert_matches!(f.store.get_query_state(&id), Err(Error::NotFound { .. }));
    }

    #[test]
    fn delete_removes_the_entry() {
        let f = fixture();
        let id = submit(&f.store);
        assert!(f.store.delete_query(&id));
        assert!(!f.store.delete_query(&id));
        assert_matches!(f.store.get_query_state(&id), Err(Error::NotFound { .. }));
    }
}
