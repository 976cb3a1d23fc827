//! The wide-event schema: one canonical flat record type for all telemetry
//! kinds.
//!
//! This crate owns the column list (names, types, order), payload
//! normalization and validation, the per-kind fingerprint, and the mapping
//! between [`data_types::WideEvent`] rows and Arrow record batches.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod batch;
mod columns;
mod fingerprint;
mod normalize;

pub use batch::*;
pub use columns::*;
pub use fingerprint::*;
pub use normalize::*;
