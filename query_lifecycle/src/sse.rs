//! The transport-agnostic server-push stream for one query.
//!
//! The stream polls the store on a fixed interval and emits framed events on
//! observed changes. It works against any cache (no pub/sub required) and
//! terminates on the first terminal delivery, on its hard time cap, or when
//! the consumer drops it.

use crate::AsyncQueryStore;
use data_types::{QueryResult, QueryStatus};
use futures::stream::BoxStream;
use futures::StreamExt;
use observability_deps::tracing::debug;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Default store poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(500_000);
/// Default heartbeat interval when nothing else fires.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);
/// Default hard cap on stream lifetime.
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(120);

/// Timing of the SSE loop.
#[derive(Debug, Clone, Copy)]
pub struct SseConfig {
    /// Store poll interval.
    pub poll_interval: Duration,
    /// Heartbeat interval when no other event fired.
    pub heartbeat: Duration,
    /// Hard cap on stream lifetime.
    pub max_duration: Duration,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat: DEFAULT_HEARTBEAT,
            max_duration: DEFAULT_MAX_DURATION,
        }
    }
}

/// One framed server-push event.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// The status changed.
    Status(QueryStatus),
    /// The progress increased.
    Progress(u8),
    /// The query completed; delivered exactly once.
    Result(Box<QueryResult>),
    /// The query failed, timed out, or does not exist.
    Error(String),
    /// The query was cancelled.
    Cancelled,
    /// Keep-alive when nothing else fired.
    Heartbeat,
}

impl SseEvent {
    /// The wire event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Progress(_) => "progress",
            Self::Result(_) => "result",
            Self::Error(_) => "error",
            Self::Cancelled => "cancelled",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// The wire payload.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::Status(status) => json!({ "status": status }),
            Self::Progress(progress) => json!({ "progress": progress }),
            Self::Result(result) => {
                serde_json::to_value(result.as_ref()).unwrap_or_else(|_| json!({}))
            }
            Self::Error(message) => json!({ "message": message }),
            Self::Cancelled => json!({ "status": "cancelled" }),
            Self::Heartbeat => json!({}),
        }
    }

    /// Whether the stream ends after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_) | Self::Error(_) | Self::Cancelled)
    }
}

/// Streams the lifecycle of one query as framed events.
pub fn stream_query(
    store: Arc<AsyncQueryStore>,
    query_id: String,
    config: SseConfig,
) -> BoxStream<'static, SseEvent> {
    async_stream::stream! {
        let started = tokio::time::Instant::now();
        let mut last_status: Option<QueryStatus> = None;
        let mut last_progress: u8 = 0;
        let mut last_emit = tokio::time::Instant::now();

        loop {
            if started.elapsed() >= config.max_duration {
                yield SseEvent::Error("stream timed out".to_string());
                break;
            }

            let state = match store.get_query_state(&query_id) {
                Ok(state) => state,
                Err(_) => {
                    // expired or never existed; terminal either way
                    yield SseEvent::Error(format!("query '{query_id}' not found"));
                    break;
                }
            };

            let mut emitted = false;
            if last_status != Some(state.status) {
                last_status = Some(state.status);
                yield SseEvent::Status(state.status);
                emitted = true;
            }
            // progress is monotonic on the wire; decreases are ignored
            if state.progress > last_progress {
                last_progress = state.progress;
                yield SseEvent::Progress(state.progress);
                emitted = true;
            }

            match state.status {
                QueryStatus::Completed => {
                    let result = state.result.unwrap_or_default();
                    yield SseEvent::Result(Box::new(result));
                    break;
                }
                QueryStatus::Failed => {
                    let message = state
                        .error
                        .unwrap_or_else(|| "query failed".to_string());
                    yield SseEvent::Error(message);
                    break;
                }
                QueryStatus::Cancelled => {
                    yield SseEvent::Cancelled;
                    break;
                }
                QueryStatus::Pending | QueryStatus::InProgress => {}
            }

            if emitted {
                last_emit = tokio::time::Instant::now();
            } else if last_emit.elapsed() >= config.heartbeat {
                last_emit = tokio::time::Instant::now();
                yield SseEvent::Heartbeat;
            }

            tokio::time::sleep(config.poll_interval).await;
        }
        debug!(%query_id, "sse stream finished");
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AsyncQueryStore, StoreConfig};
    use clock::{SystemProvider, TimeProvider};
    use data_types::{QueryRequest, RequestContext};
    use kv_cache::MemoryCache;

    fn store() -> Arc<AsyncQueryStore> {
        let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
        let cache = Arc::new(MemoryCache::new(Arc::clone(&time_provider)));
        Arc::new(AsyncQueryStore::new(
            cache,
            time_provider,
            StoreConfig::default(),
        ))
    }

    fn fast_config() -> SseConfig {
        SseConfig {
            poll_interval: Duration::from_millis(5),
            heartbeat: Duration::from_millis(40),
            max_duration: Duration::from_millis(500),
        }
    }

    fn submit(store: &AsyncQueryStore) -> String {
        store
            .initialize_query(
                QueryRequest::default(),
                &RequestContext {
                    user_id: "u".into(),
                    organization_id: "o".into(),
                },
            )
            .query_id
    }

    #[tokio::test]
    async fn happy_path_emits_status_progress_result_in_order() {
        let store = store();
        let query_id = submit(&store);
        let mut stream = stream_query(Arc::clone(&store), query_id.clone(), fast_config());

        // pending status arrives first
        assert_eq!(
            stream.next().await,
            Some(SseEvent::Status(QueryStatus::Pending))
        );

        store.mark_in_progress(&query_id, 10).unwrap();
        assert_eq!(
            stream.next().await,
            Some(SseEvent::Status(QueryStatus::InProgress))
        );
        assert_eq!(stream.next().await, Some(SseEvent::Progress(10)));

        store.update_progress(&query_id, 60).unwrap();
        assert_eq!(stream.next().await, Some(SseEvent::Progress(60)));

        store
            .store_result(&query_id, QueryResult::default())
            .unwrap();
        assert_eq!(
            stream.next().await,
            Some(SseEvent::Status(QueryStatus::Completed))
        );
        assert_eq!(stream.next().await, Some(SseEvent::Progress(100)));
        let result = stream.next().await.unwrap();
        assert_eq!(result.name(), "result");
        assert!(result.is_terminal());
        // the stream ends after the terminal event
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn failure_emits_error_with_message() {
        let store = store();
        let query_id = submit(&store);
        store.mark_in_progress(&query_id, 0).unwrap();
        store.store_error(&query_id, "disk exploded").unwrap();

        let mut stream = stream_query(Arc::clone(&store), query_id, fast_config());
        assert_eq!(
            stream.next().await,
            Some(SseEvent::Status(QueryStatus::Failed))
        );
        assert_eq!(
            stream.next().await,
            Some(SseEvent::Error("disk exploded".to_string()))
        );
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn cancellation_emits_cancelled() {
        let store = store();
        let query_id = submit(&store);
        store.request_cancellation(&query_id).unwrap();
        store.mark_cancelled(&query_id).unwrap();

        let mut stream = stream_query(Arc::clone(&store), query_id, fast_config());
        assert_eq!(
            stream.next().await,
            Some(SseEvent::Status(QueryStatus::Cancelled))
        );
        assert_eq!(stream.next().await, Some(SseEvent::Cancelled));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn unknown_query_is_a_terminal_error() {
        let store = store();
        let mut stream = stream_query(store, "no-such-query".to_string(), fast_config());
        let event = stream.next().await.unwrap();
        assert_eq!(event.name(), "error");
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn heartbeats_fill_quiet_periods() {
        let store = store();
        let query_id = submit(&store);
        let mut stream = stream_query(Arc::clone(&store), query_id, fast_config());

        assert_eq!(
            stream.next().await,
            Some(SseEvent::Status(QueryStatus::Pending))
        );
        // nothing changes; the next emission is a heartbeat
        let event = stream.next().await.unwrap();
        assert_eq!(event, SseEvent::Heartbeat);
    }

    #[tokio::test]
    async fn hard_cap_times_the_stream_out() {
        let store = store();
        let query_id = submit(&store);
        let config = SseConfig {
            poll_interval: Duration::from_millis(5),
            heartbeat: Duration::from_secs(10),
            max_duration: Duration::from_millis(30),
        };
        let mut stream = stream_query(Arc::clone(&store), query_id, config);

        let mut events = vec![];
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        let last = events.last().unwrap();
        assert_eq!(last.name(), "error");
        assert!(matches!(last, SseEvent::Error(m) if m.contains("timed out")));
    }

    #[tokio::test]
    async fn progress_decreases_are_ignored() {
        let store = store();
        let query_id = submit(&store);
        store.mark_in_progress(&query_id, 50).unwrap();

        let mut stream = stream_query(Arc::clone(&store), query_id.clone(), fast_config());
        assert_eq!(
            stream.next().await,
            Some(SseEvent::Status(QueryStatus::InProgress))
        );
        assert_eq!(stream.next().await, Some(SseEvent::Progress(50)));

        // the store itself keeps progress monotonic, so feed the stream a
        // fresh lower-progress state through a raced update: nothing new is
        // emitted until progress exceeds 50
        store.update_progress(&query_id, 30).unwrap();
        let next = stream.next().await.unwrap();
        assert_ne!(next.name(), "progress");
    }
}
