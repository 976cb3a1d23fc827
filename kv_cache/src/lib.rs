//! A generic TTL'd key/value cache.
//!
//! The async query lifecycle keeps all of its cross-task state here, so the
//! cache has to offer an atomic read-modify-write: concurrent facet batch
//! appends against the same key must never lose updates. Naive get-then-put
//! is therefore not part of the API surface for mutation.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use clock::TimeProvider;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of an [`KeyValueCache::update`] closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Store the value with the given time-to-live.
    Put(String, Duration),
    /// Remove the entry.
    Remove,
    /// Leave the entry untouched.
    Keep,
}

/// A shared key/value cache with per-entry expiry.
///
/// `update` is the only mutation primitive that observes the current value;
/// implementations must make it atomic per key.
pub trait KeyValueCache: Debug + Send + Sync + 'static {
    /// Current value of `key`, if present and unexpired.
    fn get(&self, key: &str) -> Option<String>;

    /// Unconditionally store `value` under `key` with the given TTL.
    fn put(&self, key: &str, value: String, ttl: Duration);

    /// Remove `key`. Returns whether an unexpired entry existed.
    fn remove(&self, key: &str) -> bool;

    /// Atomically transform the entry under `key`.
    ///
    /// The closure sees the current unexpired value (if any) and decides what
    /// happens to the entry. Returns the value the closure observed.
    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<&str>) -> Update,
    ) -> Option<String>;
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at_millis: i64,
}

/// In-process [`KeyValueCache`] over a mutex-protected map.
#[derive(Debug)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    time_provider: Arc<dyn TimeProvider>,
}

impl MemoryCache {
    /// New empty cache reading expiry from the given clock.
    pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            time_provider,
        }
    }

    fn expiry(&self, ttl: Duration) -> i64 {
        self.time_provider.now_millis() + ttl.as_millis() as i64
    }

    fn live<'a>(&self, entry: Option<&'a Entry>, now_millis: i64) -> Option<&'a Entry> {
        entry.filter(|e| e.expires_at_millis > now_millis)
    }
}

impl KeyValueCache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        let now = self.time_provider.now_millis();
        let entries = self.entries.lock();
        self.live(entries.get(key), now).map(|e| e.value.clone())
    }

    fn put(&self, key: &str, value: String, ttl: Duration) {
        let expires_at_millis = self.expiry(ttl);
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value,
                expires_at_millis,
            },
        );
    }

    fn remove(&self, key: &str) -> bool {
        let now = self.time_provider.now_millis();
        let mut entries = self.entries.lock();
        match entries.remove(key) {
            Some(entry) => entry.expires_at_millis > now,
            None => false,
        }
    }

    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<&str>) -> Update,
    ) -> Option<String> {
        let now = self.time_provider.now_millis();
        let mut entries = self.entries.lock();
        let current = self
            .live(entries.get(key), now)
            .map(|e| e.value.clone());

        match f(current.as_deref()) {
            Update::Put(value, ttl) => {
                let expires_at_millis = now + ttl.as_millis() as i64;
                entries.insert(
                    key.to_string(),
                    Entry {
                        value,
                        expires_at_millis,
                    },
                );
            }
            Update::Remove => {
                entries.remove(key);
            }
            Update::Keep => {}
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::MockProvider;

    fn cache() -> (Arc<MockProvider>, MemoryCache) {
        let time_provider = Arc::new(MockProvider::from_timestamp_millis(0));
        let cache = MemoryCache::new(Arc::clone(&time_provider) as _);
        (time_provider, cache)
    }

    #[test]
    fn put_get_remove() {
        let (_, cache) = cache();
        assert_eq!(cache.get("k"), None);
        cache.put("k", "v".into(), Duration::from_secs(60));
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        assert!(cache.remove("k"));
        assert!(!cache.remove("k"));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn entries_expire() {
        let (time_provider, cache) = cache();
        cache.put("k", "v".into(), Duration::from_secs(10));
        time_provider.inc(Duration::from_secs(9));
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        time_provider.inc(Duration::from_secs(2));
        assert_eq!(cache.get("k"), None);
        // an expired entry is gone for update too
        let observed = cache.update("k", &mut |current| {
            assert!(current.is_none());
            Update::Keep
        });
        assert_eq!(observed, None);
    }

    #[test]
    fn update_is_read_modify_write() {
        let (_, cache) = cache();
        cache.put("counter", "1".into(), Duration::from_secs(60));

        let observed = cache.update("counter", &mut |current| {
            let n: u32 = current.unwrap().parse().unwrap();
            Update::Put((n + 1).to_string(), Duration::from_secs(60))
        });
        assert_eq!(observed.as_deref(), Some("1"));
        assert_eq!(cache.get("counter").as_deref(), Some("2"));

        cache.update("counter", &mut |_| Update::Remove);
        assert_eq!(cache.get("counter"), None);
    }

    #[test]
    fn update_refreshes_ttl_from_now() {
        let (time_provider, cache) = cache();
        cache.put("k", "v1".into(), Duration::from_secs(10));
        time_provider.inc(Duration::from_secs(8));
        cache.update("k", &mut |_| {
            Update::Put("v2".into(), Duration::from_secs(10))
        });
        time_provider.inc(Duration::from_secs(8));
        // 16s after creation but only 8s after the update
        assert_eq!(cache.get("k").as_deref(), Some("v2"));
    }
}
