//! Bounded in-memory snapshot cache.

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use super::{snapshot_key, Result, Snapshot, Store, StoreError};
use crate::vcs::Version;

/// An in-memory snapshot store with a byte budget.
///
/// Entries are kept in recency order; once the summed archive size exceeds
/// the limit, least-recently-used entries are evicted. A negative limit
/// disables eviction entirely.
///
/// `put` deduplicates on key without refreshing recency, `get` marks the hit
/// entry most-recently used. The lock is never held across I/O.
pub struct MemoryStore {
    limit: i64,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Recency list; capacity is managed by the byte budget, not entry count.
    cache: LruCache<String, Snapshot>,
    /// Summed `data` length of every cached snapshot.
    size: i64,
}

impl MemoryStore {
    /// Create a memory store holding at most `limit` bytes of archive data
    /// (negative disables eviction).
    pub fn new(limit: i64) -> Self {
        MemoryStore {
            limit,
            inner: Mutex::new(Inner {
                cache: LruCache::unbounded(),
                size: 0,
            }),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, snapshot: Snapshot) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let key = snapshot.key();
        if inner.cache.contains(&key) {
            // Duplicate fills are a no-op; recency is only updated by reads.
            return Ok(());
        }

        inner.size += snapshot.data.len() as i64;
        inner.cache.put(key, snapshot);

        while self.limit >= 0 && inner.size > self.limit {
            match inner.cache.pop_lru() {
                Some((key, evicted)) => {
                    inner.size -= evicted.data.len() as i64;
                    debug!(key = %key, size = inner.size, "memory.evict");
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn get(&self, module: &str, version: &Version) -> Result<Snapshot> {
        let key = snapshot_key(module, version);
        let mut guard = self.inner.lock().await;
        guard.cache.get(&key).cloned().ok_or(StoreError::NotFound)
    }

    async fn del(&self, module: &str, version: &Version) -> Result<()> {
        let key = snapshot_key(module, version);
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if let Some(evicted) = inner.cache.pop(&key) {
            inner.size -= evicted.data.len() as i64;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::Utc;

    use super::*;

    fn snapshot(module: &str, len: usize) -> Snapshot {
        Snapshot {
            module: module.to_string(),
            version: Version::from("v1.0.0"),
            timestamp: Utc::now(),
            data: Bytes::from(vec![0u8; len]),
        }
    }

    async fn present(store: &MemoryStore, module: &str) -> bool {
        store.get(module, &Version::from("v1.0.0")).await.is_ok()
    }

    #[tokio::test]
    async fn test_get_returns_matching_snapshot() {
        let store = MemoryStore::new(-1);
        store
            .put(Snapshot {
                module: "foo".to_string(),
                version: Version::from("v1.0.0"),
                timestamp: Utc::now(),
                data: Bytes::from_static(b"hello"),
            })
            .await
            .unwrap();

        let s = store.get("foo", &Version::from("v1.0.0")).await.unwrap();
        assert_eq!(s.module, "foo");
        assert_eq!(s.version, Version::from("v1.0.0"));
        assert_eq!(s.data, Bytes::from_static(b"hello"));

        let err = store.get("foo", &Version::from("v2.0.0")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_overflow_eviction() {
        let store = MemoryStore::new(10);
        store.put(snapshot("foo", 4)).await.unwrap();
        store.put(snapshot("bar", 7)).await.unwrap();

        // Adding "bar" exceeded the budget, so "foo" was evicted.
        assert!(!present(&store, "foo").await);
        assert!(present(&store, "bar").await);

        store.put(snapshot("baz", 3)).await.unwrap();
        assert!(present(&store, "bar").await);
        assert!(present(&store, "baz").await);

        // Touch "bar" so "baz" becomes the eviction candidate.
        store.get("bar", &Version::from("v1.0.0")).await.unwrap();
        store.put(snapshot("qux", 3)).await.unwrap();

        assert!(present(&store, "bar").await);
        assert!(!present(&store, "baz").await);
        assert!(present(&store, "qux").await);
    }

    #[tokio::test]
    async fn test_duplicate_put_is_noop() {
        let store = MemoryStore::new(-1);
        store.put(snapshot("foo", 4)).await.unwrap();

        let mut other = snapshot("foo", 9);
        other.data = Bytes::from_static(b"different");
        store.put(other).await.unwrap();

        // The original snapshot is untouched.
        let s = store.get("foo", &Version::from("v1.0.0")).await.unwrap();
        assert_eq!(s.data.len(), 4);
    }

    #[tokio::test]
    async fn test_oversized_item_terminates() {
        let store = MemoryStore::new(10);
        store.put(snapshot("big", 25)).await.unwrap();
        // The eviction loop empties the list rather than spinning.
        assert!(!present(&store, "big").await);

        store.put(snapshot("foo", 4)).await.unwrap();
        assert!(present(&store, "foo").await);
    }

    #[tokio::test]
    async fn test_negative_limit_disables_eviction() {
        let store = MemoryStore::new(-1);
        for i in 0..64 {
            store.put(snapshot(&format!("m{}", i), 1024)).await.unwrap();
        }
        for i in 0..64 {
            assert!(present(&store, &format!("m{}", i)).await);
        }
    }

    #[tokio::test]
    async fn test_del() {
        let store = MemoryStore::new(10);
        store.put(snapshot("foo", 4)).await.unwrap();
        store.del("foo", &Version::from("v1.0.0")).await.unwrap();
        assert!(!present(&store, "foo").await);

        // Freed budget is reusable.
        store.put(snapshot("bar", 7)).await.unwrap();
        store.put(snapshot("baz", 3)).await.unwrap();
        assert!(present(&store, "bar").await);
        assert!(present(&store, "baz").await);
    }

    #[tokio::test]
    async fn test_random_ops_keep_invariants() {
        let store = MemoryStore::new(12);
        let sizes = [1usize, 3, 5, 7, 11, 13];
        // A fixed pseudo-random walk over puts and gets; nothing should panic
        // and the store should stay usable throughout.
        let mut state = 0x2545f491u32;
        for _ in 0..200 {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            let i = (state as usize >> 16) % sizes.len();
            let module = format!("m{}", i);
            if state % 5 > 2 {
                store.put(snapshot(&module, sizes[i])).await.unwrap();
            } else {
                let _ = store.get(&module, &Version::from("v1.0.0")).await;
            }
        }
    }
}
