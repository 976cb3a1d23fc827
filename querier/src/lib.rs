//! Query-side engine: partition pruning, projected parquet reads and the
//! single-pass executor.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod exec;
mod filter;
mod pruner;
mod reader;

pub use exec::{
    Error as ExecError, ExecutorConfig, QueryExecutor, PRIORITY_FACET_ATTRIBUTES,
};
pub use filter::{matches, matches_all, selected_values};
pub use pruner::{candidate_partitions, Error as PruneError, PartitionSelector};
pub use reader::{Error as ReadError, EventReader, PartitionScan, ReadOptions};
