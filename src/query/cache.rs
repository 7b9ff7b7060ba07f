//! Bounded LRU cache of query embeddings

use crate::registry::EmbeddingSpace;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Cache key: embedding space plus normalized input
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub space: EmbeddingSpace,
    pub input: String,
}

impl CacheKey {
    /// Text key: lowercased with whitespace runs collapsed
    pub fn text(space: EmbeddingSpace, text: &str) -> Self {
        Self {
            space,
            input: normalize_text(text),
        }
    }

    /// Image key: content hash of the raw bytes
    pub fn image(bytes: &[u8]) -> Self {
        Self {
            space: EmbeddingSpace::Image,
            input: blake3::hash(bytes).to_hex().to_string(),
        }
    }
}

pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct EmbeddingCache {
    entries: RwLock<LruCache<CacheKey, Arc<Vec<f32>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Arc<Vec<f32>>> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(v.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn insert(&self, key: CacheKey, embedding: Arc<Vec<f32>>) {
        self.entries.write().await.put(key, embedding);
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.read().await.len(),
        }
    }
}
