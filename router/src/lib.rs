//! Ingest intake: API-key context resolution, payload validation, batching
//! and OTLP-shaped receivers. Everything here translates; the processing
//! pipeline behind the bus does the work.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod auth;
mod error;
mod intake;
mod otlp;

pub use auth::*;
pub use error::*;
pub use intake::*;
pub use otlp::*;
