//! Shared data types for the signalhouse wide-event store.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod async_query;
mod event;
mod issue;
mod query;
mod validation;

pub use async_query::*;
pub use event::*;
pub use issue::*;
pub use query::*;
pub use validation::*;
