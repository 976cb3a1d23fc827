//! The typed message bus between intake, processing and query execution.
//!
//! The message set is deliberately sealed: every cross-component handoff is
//! one of the shapes below, and handlers are written to be idempotent under
//! redelivery (keyed by `event_id`, `query_id` or `query_id`+`batch_id`).
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use async_trait::async_trait;
use data_types::{QueryRequest, RequestContext};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Errors surfaced by bus implementations.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Queue '{}' is closed", queue))]
    QueueClosed { queue: String },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Queue names used by the core.
pub mod queues {
    /// Ingested events awaiting processing.
    pub const PROCESS_EVENTS: &str = "process-events";
    /// Submitted queries awaiting execution.
    pub const EXECUTE_QUERIES: &str = "execute-queries";
    /// Deferred facet batches awaiting computation.
    pub const FACET_BATCHES: &str = "facet-batches";
}

/// The sealed set of messages crossing component boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// A validated ingest payload for the event processor.
    ProcessEvent {
        /// Normalized-payload JSON object as accepted at intake.
        event_data: serde_json::Map<String, serde_json::Value>,
        /// Project resolved from the API key.
        project_id: String,
        /// Organization resolved from the API key.
        organization_id: String,
        /// Environment resolved from the API key.
        environment: String,
    },
    /// A submitted query for the executor.
    ExecuteQuery {
        /// The query id the result is stored under.
        query_id: String,
        /// The request to execute.
        request: QueryRequest,
        /// The caller context the execution is scoped by.
        context: RequestContext,
    },
    /// One deferred facet batch for the batch worker.
    ComputeFacetBatch {
        /// The owning query.
        query_id: String,
        /// Which batch to compute.
        batch_id: String,
        /// The request to replay.
        request: QueryRequest,
        /// The caller context the execution is scoped by.
        context: RequestContext,
    },
}

/// Publish side of the bus.
#[async_trait]
pub trait MessageBus: Debug + Send + Sync + 'static {
    /// Appends a message to the named queue.
    async fn publish(&self, queue: &str, message: Message) -> Result<()>;

    /// A handle competing for messages of the named queue.
    fn consumer(&self, queue: &str) -> QueueConsumer;
}

/// A competing-consumer handle onto one queue.
///
/// Multiple consumers of the same queue share one FIFO stream; each message is
/// delivered to exactly one of them.
#[derive(Debug, Clone)]
pub struct QueueConsumer {
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>,
}

impl QueueConsumer {
    /// Next message, or `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<Message> {
        self.receiver.lock().await.recv().await
    }

    /// Next message if one is immediately available.
    pub fn try_recv(&self) -> Option<Message> {
        self.receiver.try_lock().ok()?.try_recv().ok()
    }
}

#[derive(Debug)]
struct Queue {
    sender: mpsc::UnboundedSender<Message>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }
}

/// In-process [`MessageBus`] with one unbounded FIFO channel per queue.
#[derive(Debug, Default)]
pub struct MemoryBus {
    queues: Mutex<HashMap<String, Queue>>,
}

impl MemoryBus {
    /// New bus with no queues; queues appear on first use.
    pub fn new() -> Self {
        Self::default()
    }

    fn queue<R>(&self, name: &str, f: impl FnOnce(&Queue) -> R) -> R {
        let mut queues = self.queues.lock();
        let queue = queues.entry(name.to_string()).or_insert_with(Queue::new);
        f(queue)
    }

    /// Number of messages currently waiting in `queue`.
    pub fn depth(&self, name: &str) -> usize {
        self.queue(name, |queue| {
            queue
                .receiver
                .try_lock()
                .map(|r| r.len())
                .unwrap_or_default()
        })
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, queue: &str, message: Message) -> Result<()> {
        self.queue(queue, |q| {
            q.sender
                .send(message)
                .map_err(|_| Error::QueueClosed {
                    queue: queue.to_string(),
                })
        })
    }

    fn consumer(&self, queue: &str) -> QueueConsumer {
        self.queue(queue, |q| QueueConsumer {
            receiver: Arc::clone(&q.receiver),
        })
    }
}
