//! LRU read cache for blob content.
//!
//! Thread-safe: entries live in a concurrent map, recency order in a
//! locked queue, counters in atomics. Only blobs at or under the
//! per-entry cap are cached at all, so one oversized read cannot flush
//! the working set.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Content cache keyed by blob hash, LRU-evicted by total byte size.
pub struct BlobCache {
    entries: DashMap<String, Arc<Vec<u8>>>,
    lru: RwLock<VecDeque<String>>,
    size_bytes: AtomicUsize,
    max_bytes: usize,
    max_entry_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub size_bytes: usize,
    pub entries: usize,
}

impl BlobCache {
    /// `max_bytes` bounds the whole cache; `max_entry_bytes` bounds what
    /// is admitted per blob.
    pub fn new(max_bytes: usize, max_entry_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            lru: RwLock::new(VecDeque::new()),
            size_bytes: AtomicUsize::new(0),
            max_bytes,
            max_entry_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, hash: &str) -> Option<Arc<Vec<u8>>> {
        match self.entries.get(hash) {
            Some(entry) => {
                let content = Arc::clone(entry.value());
                drop(entry);
                self.touch(hash);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(content)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Admit content if it fits the per-entry cap; evicts LRU entries
    /// until the total size bound holds.
    pub fn put(&self, hash: &str, content: Arc<Vec<u8>>) {
        let size = content.len();
        if size > self.max_entry_bytes || size > self.max_bytes {
            return;
        }
        if self.entries.contains_key(hash) {
            self.touch(hash);
            return;
        }
        self.evict_until_fits(size);
        self.entries.insert(hash.to_string(), content);
        self.size_bytes.fetch_add(size, Ordering::Relaxed);
        self.lru.write().push_back(hash.to_string());
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove(&self, hash: &str) {
        if let Some((_, content)) = self.entries.remove(hash) {
            self.size_bytes.fetch_sub(content.len(), Ordering::Relaxed);
            let mut lru = self.lru.write();
            if let Some(pos) = lru.iter().position(|k| k == hash) {
                lru.remove(pos);
            }
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.lru.write().clear();
        self.size_bytes.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn statistics(&self) -> CacheStatistics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStatistics {
            hits,
            misses,
            puts: self.puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            size_bytes: self.size_bytes.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    fn touch(&self, hash: &str) {
        let mut lru = self.lru.write();
        if let Some(pos) = lru.iter().position(|k| k == hash) {
            lru.remove(pos);
        }
        lru.push_back(hash.to_string());
    }

    fn evict_until_fits(&self, incoming: usize) {
        while self.size_bytes.load(Ordering::Relaxed) + incoming > self.max_bytes {
            let victim = self.lru.write().pop_front();
            match victim {
                Some(hash) => {
                    if let Some((_, content)) = self.entries.remove(&hash) {
                        self.size_bytes.fetch_sub(content.len(), Ordering::Relaxed);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => break,
            }
        }
    }
}
