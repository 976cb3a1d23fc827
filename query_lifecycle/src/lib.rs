//! The asynchronous query lifecycle: submit → dispatch → progressive facet
//! batches → SSE streaming → cancellation.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod dispatcher;
mod sse;
mod store;

pub use dispatcher::{
    batch_attributes, Error as LifecycleError, QueryLifecycle, DEFERRED_FACET_BATCHES,
};
pub use sse::{
    stream_query, SseConfig, SseEvent, DEFAULT_HEARTBEAT, DEFAULT_MAX_DURATION,
    DEFAULT_POLL_INTERVAL,
};
pub use store::{
    AsyncQueryStore, Error as StoreError, StoreConfig, DEFAULT_TTL_PENDING, DEFAULT_TTL_TERMINAL,
};
