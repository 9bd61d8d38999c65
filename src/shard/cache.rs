//! Header cache
//!
//! Opening a shard costs two ranged reads plus a decrypt; headers are small
//! and immutable, so they are cached aggressively. The cache is a pure
//! optimization: any entry can be re-derived from the store, and entries for
//! filenames no longer referenced by the current manifest are pruned after
//! each sync.

use std::collections::HashSet;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use super::format::ShardHeader;
use crate::document::now_millis;

#[derive(Debug, Clone)]
pub struct CachedHeader {
    pub header: ShardHeader,
    pub cached_at: u64,
}

pub struct HeaderCache {
    /// Database identity this cache is scoped to
    uuid: String,
    entries: Mutex<LruCache<String, CachedHeader>>,
}

impl HeaderCache {
    pub fn new(uuid: impl Into<String>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped above zero");
        Self {
            uuid: uuid.into(),
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn get(&self, filename: &str) -> Option<ShardHeader> {
        self.entries
            .lock()
            .get(filename)
            .map(|cached| cached.header.clone())
    }

    pub fn insert(&self, filename: impl Into<String>, header: ShardHeader) {
        self.entries.lock().put(
            filename.into(),
            CachedHeader {
                header,
                cached_at: now_millis(),
            },
        );
    }

    /// Drop a single stale entry, typically after a read discovered the
    /// underlying object is gone.
    pub fn evict(&self, filename: &str) {
        self.entries.lock().pop(filename);
    }

    /// Drop every entry whose filename is not in the referenced set.
    pub fn prune_unreferenced(&self, referenced: &HashSet<String>) {
        let mut entries = self.entries.lock();
        let stale: Vec<String> = entries
            .iter()
            .map(|(filename, _)| filename.clone())
            .filter(|filename| !referenced.contains(filename))
            .collect();
        for filename in &stale {
            entries.pop(filename);
        }
        if !stale.is_empty() {
            debug!(pruned = stale.len(), "pruned unreferenced shard headers");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::format::{HeaderEntry, ShardHeader};

    fn header(id: &str) -> ShardHeader {
        ShardHeader::new(vec![HeaderEntry {
            id: id.to_string(),
            at: 1,
            seq: 1,
            del: false,
            offset: 0,
            len: 8,
        }])
    }

    #[test]
    fn test_insert_get_evict() {
        let cache = HeaderCache::new("db-1", 8);
        cache.insert("shards/a.clx", header("a"));
        assert!(cache.get("shards/a.clx").is_some());
        cache.evict("shards/a.clx");
        assert!(cache.get("shards/a.clx").is_none());
    }

    #[test]
    fn test_capacity_bound_evicts_oldest() {
        let cache = HeaderCache::new("db-1", 2);
        cache.insert("shards/a.clx", header("a"));
        cache.insert("shards/b.clx", header("b"));
        cache.insert("shards/c.clx", header("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("shards/a.clx").is_none());
        assert!(cache.get("shards/c.clx").is_some());
    }

    #[test]
    fn test_prune_unreferenced() {
        let cache = HeaderCache::new("db-1", 8);
        cache.insert("shards/keep.clx", header("a"));
        cache.insert("shards/drop.clx", header("b"));

        let referenced: HashSet<String> = ["shards/keep.clx".to_string()].into_iter().collect();
        cache.prune_unreferenced(&referenced);

        assert!(cache.get("shards/keep.clx").is_some());
        assert!(cache.get("shards/drop.clx").is_none());
    }
}
