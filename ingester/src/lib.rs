//! Ingest-side pipeline: the partitioned columnar writer, the issue
//! aggregate repository and the event processor consuming the bus.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod issues;
mod processor;
mod writer;

pub use issues::{Error as IssueError, IssueRepository, MemIssueRepository};
pub use processor::{Error as ProcessError, EventProcessor};
pub use writer::{Error as WriteError, PartitionedWriter, DEFAULT_BATCH_SIZE};
