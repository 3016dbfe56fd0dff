//! Response cache: URL-keyed LRU of captured bodies, bounded by total bytes.
//!
//! Amortizes body fetches across widths and snapshots. A URL fetched while
//! rendering at one width is served from here at every later width, and at
//! every later snapshot of the same page.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::models::MAX_RESOURCE_BYTES;

/// A cached response body with the metadata needed to rebuild a resource.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub sha: String,
    pub mimetype: String,
    pub content: Vec<u8>,
    pub headers: HashMap<String, String>,
}

struct CacheInner {
    map: HashMap<String, CachedResponse>,
    /// Key recency (front = oldest, back = newest).
    order: VecDeque<String>,
    total_bytes: usize,
    hits: u64,
    misses: u64,
}

/// Byte-bounded LRU of intercepted responses, keyed by URL.
///
/// All operations are safe to call concurrently. When `disabled`, every
/// lookup misses and every insert is a no-op.
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    max_bytes: usize,
    disabled: bool,
}

impl ResponseCache {
    pub fn new(max_bytes: usize, disabled: bool) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                total_bytes: 0,
                hits: 0,
                misses: 0,
            }),
            max_bytes,
            disabled,
        }
    }

    pub fn get(&self, url: &str) -> Option<CachedResponse> {
        if self.disabled {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.map.contains_key(url) {
            inner.order.retain(|k| k != url);
            inner.order.push_back(url.to_string());
            inner.hits += 1;
            inner.map.get(url).cloned()
        } else {
            inner.misses += 1;
            None
        }
    }

    pub fn put(&self, url: &str, entry: CachedResponse) {
        if self.disabled || entry.content.len() > MAX_RESOURCE_BYTES {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.map.remove(url) {
            inner.total_bytes -= old.content.len();
            inner.order.retain(|k| k != url);
        }
        inner.total_bytes += entry.content.len();
        inner.order.push_back(url.to_string());
        inner.map.insert(url.to_string(), entry);
        while inner.total_bytes > self.max_bytes {
            let Some(evict) = inner.order.pop_front() else {
                break;
            };
            if let Some(old) = inner.map.remove(&evict) {
                inner.total_bytes -= old.content.len();
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
        inner.order.clear();
        inner.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().unwrap().total_bytes
    }

    /// Hit rate 0.0-1.0; 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        let total = inner.hits + inner.misses;
        if total == 0 {
            0.0
        } else {
            inner.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sha256_hex;

    fn entry(body: &[u8]) -> CachedResponse {
        CachedResponse {
            sha: sha256_hex(body),
            mimetype: "text/css".to_string(),
            content: body.to_vec(),
            headers: HashMap::new(),
        }
    }

    #[test]
    fn get_miss_then_hit() {
        let cache = ResponseCache::new(1024, false);
        assert!(cache.get("http://x/a.css").is_none());
        cache.put("http://x/a.css", entry(b"body{}"));
        let hit = cache.get("http://x/a.css").unwrap();
        assert_eq!(hit.content, b"body{}");
        assert!((cache.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn evicts_lru_when_over_byte_budget() {
        let cache = ResponseCache::new(10, false);
        cache.put("a", entry(b"aaaa"));
        cache.put("b", entry(b"bbbb"));
        // Touch "a" so "b" is the eviction candidate.
        cache.get("a");
        cache.put("c", entry(b"cccc"));
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert!(cache.total_bytes() <= 10);
    }

    #[test]
    fn replacing_a_url_does_not_leak_bytes() {
        let cache = ResponseCache::new(1024, false);
        cache.put("a", entry(b"first"));
        cache.put("a", entry(b"second!"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 7);
    }

    #[test]
    fn oversize_entries_never_stored() {
        let cache = ResponseCache::new(usize::MAX, false);
        let big = vec![0u8; MAX_RESOURCE_BYTES + 1];
        cache.put("big", entry(&big));
        assert!(cache.is_empty());
    }

    #[test]
    fn disabled_cache_short_circuits() {
        let cache = ResponseCache::new(1024, true);
        cache.put("a", entry(b"aaaa"));
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_empties_everything() {
        let cache = ResponseCache::new(1024, false);
        cache.put("a", entry(b"aaaa"));
        cache.put("b", entry(b"bbbb"));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }
}
