//! signalhouse: a multi-tenant wide-event observability backend.
//!
//! The library target exists so integration tests can assemble the same
//! components and HTTP surface the binary runs.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(clippy::explicit_iter_loop, clippy::use_self, clippy::clone_on_ref_ptr)]

pub mod http;
pub mod server;
