//! Per-source request throttling for the status endpoint.
//!
//! Requests are counted in one-second buckets keyed by source host. The
//! counts live in a bounded LRU, so a flood of distinct hosts evicts old
//! buckets instead of growing memory.

use lru::LruCache;
use std::num::NonZeroUsize;

pub const DEFAULT_CACHE_SIZE: usize = 1024;
pub const DEFAULT_THROTTLE_RATE: usize = 10;

pub struct ThrottleCache {
    counts: LruCache<Vec<u8>, usize>,
    rate: usize,
}

impl ThrottleCache {
    pub fn new(cache_size: usize, rate: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap();
        Self { counts: LruCache::new(capacity), rate }
    }

    /// Count one request from `host` in the given time bucket; true when
    /// the request should be dropped.
    pub fn should_throttle(&mut self, bucket: u32, host: &str) -> bool {
        let mut key = Vec::with_capacity(4 + host.len());
        key.extend_from_slice(&bucket.to_be_bytes());
        key.extend_from_slice(host.as_bytes());
        let count = self.counts.get(&key).copied().unwrap_or(0) + 1;
        self.counts.put(key, count);
        count >= self.rate
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl Default for ThrottleCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE, DEFAULT_THROTTLE_RATE)
    }
}
