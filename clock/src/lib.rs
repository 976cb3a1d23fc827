//! Time abstraction for signalhouse.
//!
//! Everything that reads the wall clock (cache TTLs, lock leases, file name
//! generation, SSE deadlines) does so through [`TimeProvider`] so tests can
//! advance time deterministically with [`MockProvider`].
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::fmt::Debug;
use std::time::Duration;

/// A source of the current UTC time.
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Returns the current time as milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// A [`TimeProvider`] backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl SystemProvider {
    /// Create a new system clock provider.
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A [`TimeProvider`] that only moves when told to.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<DateTime<Utc>>,
}

impl MockProvider {
    /// Create a provider pinned to the given instant.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// Create a provider pinned to the given milliseconds since epoch.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self::new(
            Utc.timestamp_millis_opt(millis)
                .single()
                .expect("valid timestamp"),
        )
    }

    /// Replace the current instant.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write() = now;
    }

    /// Advance the current instant by `d` and return the new value.
    pub fn inc(&self, d: Duration) -> DateTime<Utc> {
        let mut now = self.now.write();
        *now += chrono::Duration::from_std(d).expect("in range");
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_moves_forward() {
        let provider = SystemProvider::new();
        let a = provider.now();
        let b = provider.now();
        assert!(b >= a);
    }

    #[test]
    fn mock_clock_only_moves_when_told() {
        let provider = MockProvider::from_timestamp_millis(1_700_000_000_000);
        assert_eq!(provider.now_millis(), 1_700_000_000_000);
        assert_eq!(provider.now_millis(), 1_700_000_000_000);

        provider.inc(Duration::from_secs(5));
        assert_eq!(provider.now_millis(), 1_700_000_005_000);

        provider.set(Utc.timestamp_millis_opt(42).single().unwrap());
        assert_eq!(provider.now_millis(), 42);
    }
}
