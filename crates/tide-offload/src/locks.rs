//! Per-hash async locks.
//!
//! Uploading a hash and reclaiming it serialize on the same lock, so a
//! physical block is never deleted between the index lookup and the bind
//! that references it. Locks exist only while someone holds or waits on
//! them.

use std::sync::Arc;

use dashmap::DashMap;
use tide_store::BlockHash;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockKey = (String, BlockHash);

#[derive(Default)]
struct Slot {
    mutex: Arc<Mutex<()>>,
    /// Holders plus waiters; changed only under the map shard lock
    users: usize,
}

#[derive(Default)]
pub struct HashLocks {
    locks: DashMap<LockKey, Slot>,
}

/// Held lock, or a registered waiter while `guard` is `None`. Dropping
/// either releases the slot.
pub struct HashGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a HashLocks,
    key: LockKey,
}

impl HashLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, share: &str, hash: &BlockHash) -> HashGuard<'_> {
        let key = (share.to_string(), *hash);
        let mutex = {
            let mut slot = self.locks.entry(key.clone()).or_default();
            slot.users += 1;
            Arc::clone(&slot.mutex)
        };
        let mut held = HashGuard {
            guard: None,
            locks: self,
            key,
        };
        held.guard = Some(mutex.lock_owned().await);
        held
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for HashGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.locks.remove_if_mut(&self.key, |_, slot| {
            slot.users -= 1;
            slot.users == 0
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_is_released_and_removed() {
        let locks = HashLocks::new();
        let h = BlockHash::compute(b"x");
        {
            let _g = locks.lock("s", &h).await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_same_hash_serializes() {
        let locks = Arc::new(HashLocks::new());
        let inside = Arc::new(AtomicU32::new(0));
        let h = BlockHash::compute(b"shared");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            tasks.push(tokio::spawn(async move {
                let _g = locks.lock("s", &h).await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_removed() {
        let locks = HashLocks::new();
        let h = BlockHash::compute(b"x");
        let held = locks.lock("s", &h).await;

        let waited =
            tokio::time::timeout(Duration::from_millis(20), locks.lock("s", &h)).await;
        assert!(waited.is_err());
        assert_eq!(locks.len(), 1);

        drop(held);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_shares_do_not_contend() {
        let locks = HashLocks::new();
        let h = BlockHash::compute(b"x");
        let _a = locks.lock("s1", &h).await;
        let _b = locks.lock("s2", &h).await;
        assert_eq!(locks.len(), 2);
    }
}
