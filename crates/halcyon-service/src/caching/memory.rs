use std::time::{Duration, SystemTime};

use super::cache_key::CacheKey;

/// An artifact held in memory together with its caller-supplied cost.
#[derive(Clone, Debug)]
pub struct MemoryEntry<A> {
    /// The decoded artifact.
    pub artifact: A,
    /// The weight of this entry against the store's cost ceiling, typically
    /// the decoded byte count.
    pub cost: u32,
    /// When the entry was inserted.
    pub inserted_at: SystemTime,
}

/// The in-memory cache tier: a bounded, cost-weighted, TTL-aware map from
/// [`CacheKey`] to decoded artifact.
///
/// Entries are advisory. They can always be re-derived from disk or the
/// network, so the store delegates eviction entirely to the underlying
/// bounded container. The eviction order among entries of equal cost is the
/// container's own recency/frequency heuristic and is deliberately left
/// unspecified; only the aggregate cost bound is guaranteed.
pub struct MemoryStore<A: Clone + Send + Sync + 'static> {
    cache: moka::sync::Cache<CacheKey, MemoryEntry<A>>,
}

impl<A: Clone + Send + Sync + 'static> MemoryStore<A> {
    /// Creates a store with the given total-cost ceiling (`0` = unlimited)
    /// and optional per-entry time-to-live.
    pub fn new(max_cost: u64, ttl: Option<Duration>) -> Self {
        // NOTE: zero-cost entries still occupy a map slot, clamp to 1 so the
        // weigher never reports a weightless entry.
        let mut builder =
            moka::sync::Cache::builder().weigher(|_k: &CacheKey, e: &MemoryEntry<A>| e.cost.max(1));
        if max_cost > 0 {
            builder = builder.max_capacity(max_cost);
        }
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }

        Self {
            cache: builder.build(),
        }
    }

    /// Inserts an artifact under `key` with the given cost.
    pub fn set(&self, key: CacheKey, artifact: A, cost: u32) {
        self.cache.insert(
            key,
            MemoryEntry {
                artifact,
                cost,
                inserted_at: SystemTime::now(),
            },
        );
    }

    /// Looks up the artifact stored under `key`.
    pub fn get(&self, key: &CacheKey) -> Option<A> {
        self.cache.get(key).map(|entry| entry.artifact)
    }

    /// Says whether an entry exists for `key`, without touching its recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.cache.contains_key(key)
    }

    /// Removes the entry stored under `key`.
    pub fn remove(&self, key: &CacheKey) {
        self.cache.invalidate(key);
    }

    /// Drops every entry.
    ///
    /// This is the hook an embedder wires to its platform's memory-pressure
    /// signal; everything dropped here is still re-derivable from disk.
    pub fn remove_all(&self) {
        self.cache.invalidate_all();
    }

    /// The total cost of all live entries.
    ///
    /// Flushes the container's pending maintenance first so the returned
    /// value respects the configured ceiling.
    pub fn total_cost(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.weighted_size()
    }
}

impl<A: Clone + Send + Sync + 'static> std::fmt::Debug for MemoryStore<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.cache.entry_count())
            .field("total_cost", &self.cache.weighted_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name).unwrap()
    }

    #[test]
    fn test_set_get_remove() {
        let store = MemoryStore::new(0, None);

        assert_eq!(store.get(&key("a")), None);
        store.set(key("a"), "artifact-a".to_owned(), 10);
        assert_eq!(store.get(&key("a")).as_deref(), Some("artifact-a"));
        assert!(store.contains(&key("a")));

        store.remove(&key("a"));
        assert_eq!(store.get(&key("a")), None);
    }

    #[test]
    fn test_remove_all() {
        let store = MemoryStore::new(0, None);
        store.set(key("a"), 1u32, 1);
        store.set(key("b"), 2u32, 1);

        store.remove_all();

        assert!(!store.contains(&key("a")));
        assert!(!store.contains(&key("b")));
        assert_eq!(store.total_cost(), 0);
    }

    // The exact victim under cost pressure is unspecified, so this only
    // asserts the aggregate bound.
    #[test]
    fn test_cost_ceiling_is_respected() {
        let store = MemoryStore::new(150, None);

        store.set(key("a"), vec![0u8; 100], 100);
        store.set(key("b"), vec![1u8; 100], 100);

        assert!(store.total_cost() <= 150);
    }

    #[test]
    fn test_ttl_expires_entries() {
        let store = MemoryStore::new(0, Some(Duration::from_millis(50)));
        store.set(key("a"), 1u32, 1);
        assert_eq!(store.get(&key("a")), Some(1));

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(store.get(&key("a")), None);
    }
}
