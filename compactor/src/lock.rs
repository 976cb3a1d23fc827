//! Named mutual exclusion with a lease.
//!
//! Compaction of a partition must be exclusive across workers. The in-process
//! implementation below covers a single node; a coordinator-backed one slots
//! behind the same trait for multi-node deployments. A holder that outlives
//! its lease is treated as dead and the next acquirer may proceed.

use clock::TimeProvider;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Grants named, leased, mutually exclusive locks.
pub trait Locker: Debug + Send + Sync + 'static {
    /// Attempts to take the named lock for `lease`. `None` means another
    /// holder currently has it; that is a skip, not an error.
    fn acquire(&self, name: &str, lease: Duration) -> Option<LockGuard>;
}

#[derive(Debug)]
struct Holder {
    token: Uuid,
    expires_at_millis: i64,
}

#[derive(Debug)]
struct LockTable {
    holders: Mutex<HashMap<String, Holder>>,
    time_provider: Arc<dyn TimeProvider>,
}

/// Held lock; released on drop, on every exit path.
#[derive(Debug)]
pub struct LockGuard {
    table: Arc<LockTable>,
    name: String,
    token: Uuid,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut holders = self.table.holders.lock();
        // only the current holder may release; an expired-and-reacquired
        // lock belongs to someone else now
        if holders.get(&self.name).is_some_and(|h| h.token == self.token) {
            holders.remove(&self.name);
        }
    }
}

/// Single-process [`Locker`].
#[derive(Debug)]
pub struct InProcessLocker {
    table: Arc<LockTable>,
}

impl InProcessLocker {
    /// New locker reading lease expiry from the given clock.
    pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            table: Arc::new(LockTable {
                holders: Mutex::new(HashMap::new()),
                time_provider,
            }),
        }
    }
}

impl Locker for InProcessLocker {
    fn acquire(&self, name: &str, lease: Duration) -> Option<LockGuard> {
        let now = self.table.time_provider.now_millis();
        let mut holders = self.table.holders.lock();

        if let Some(holder) = holders.get(name) {
            if holder.expires_at_millis > now {
                return None;
            }
        }

        let token = Uuid::new_v4();
        holders.insert(
            name.to_string(),
            Holder {
                token,
                expires_at_millis: now + lease.as_millis() as i64,
            },
        );
        Some(LockGuard {
            table: Arc::clone(&self.table),
            name: name.to_string(),
            token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::MockProvider;

    fn locker() -> (Arc<MockProvider>, InProcessLocker) {
        let time_provider = Arc::new(MockProvider::from_timestamp_millis(0));
        let locker = InProcessLocker::new(Arc::clone(&time_provider) as _);
        (time_provider, locker)
    }

    #[test]
    fn exclusive_while_held() {
        let (_, locker) = locker();
        let guard = locker.acquire("a", Duration::from_secs(300)).unwrap();
        assert!(locker.acquire("a", Duration::from_secs(300)).is_none());
        // a different name is independent
        assert!(locker.acquire("b", Duration::from_secs(300)).is_some());

        drop(guard);
        assert!(locker.acquire("a", Duration::from_secs(300)).is_some());
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let (time_provider, locker) = locker();
        let stale = locker.acquire("a", Duration::from_secs(300)).unwrap();

        time_provider.inc(Duration::from_secs(301));
        let fresh = locker.acquire("a", Duration::from_secs(300)).unwrap();

        // the stale guard must not release the new holder's lock
        drop(stale);
        assert!(locker.acquire("a", Duration::from_secs(300)).is_none());
        drop(fresh);
        assert!(locker.acquire("a", Duration::from_secs(300)).is_some());
    }
}
