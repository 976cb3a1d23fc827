//! Helpers shared by tests across the workspace.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(clippy::explicit_iter_loop, clippy::use_self, clippy::clone_on_ref_ptr)]

use std::sync::Once;

/// Scratch directory that is removed on drop.
pub use tempfile::TempDir;

static LOG_SETUP: Once = Once::new();

/// Enables RUST_LOG-gated logging output for tests.
///
/// Safe to call from every test; the subscriber is installed at most once.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Install the test subscriber unconditionally.
pub fn start_logging() {
    LOG_SETUP.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// New scratch directory for a test.
pub fn tmp_dir() -> std::io::Result<TempDir> {
    let _ = std::fs::create_dir_all(std::env::temp_dir());
    tempfile::Builder::new()
        .prefix("signalhouse")
        .tempdir()
}
