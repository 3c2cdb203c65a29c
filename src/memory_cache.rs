//! The memory tier: a [CostBasedLru] of decoded bitmaps charged by their sample size in bytes.
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::*;

pub struct MemoryCache {
    lru: Mutex<CostBasedLru<String, Bitmap>>,
}

impl MemoryCache {
    /// A cache holding up to `max_bytes` of pixel data.
    pub fn new(max_bytes: u64) -> MemoryCache {
        MemoryCache {
            lru: Mutex::new(CostBasedLru::new(max_bytes)),
        }
    }

    /// A cache sized as a fraction of `total_bytes`, which is usually the memory the process may use.
    pub fn with_fraction_of(total_bytes: u64, fraction: f64) -> MemoryCache {
        let fraction = fraction.clamp(0.0, 1.0);
        MemoryCache::new((total_bytes as f64 * fraction) as u64)
    }

    pub fn max_cost(&self) -> u64 {
        self.lru.lock().max_cost()
    }

    pub fn current_cost(&self) -> u64 {
        self.lru.lock().current_cost()
    }

    pub fn len(&self) -> usize {
        self.lru.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.lock().is_empty()
    }
}

impl BitmapCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Arc<Bitmap>>, LoadError> {
        let found = self.lru.lock().get(key);
        trace!(key, hit = found.is_some(), "memory tier lookup");
        Ok(found)
    }

    fn put(&self, key: &str, bitmap: Arc<Bitmap>) {
        let cost = bitmap.byte_count();
        self.lru.lock().insert(key.to_string(), bitmap, cost);
    }

    fn clear(&self) {
        self.lru.lock().clear();
    }

    fn contains(&self, key: &str) -> bool {
        self.lru.lock().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::solid;

    #[test]
    fn charges_by_byte_count() {
        // Each 4x4 RGBA bitmap costs 64 bytes.
        let cache = MemoryCache::new(150);
        cache.put("a", Arc::new(solid(4, 4, [1, 2, 3, 255])));
        cache.put("b", Arc::new(solid(4, 4, [1, 2, 3, 255])));
        assert_eq!(cache.current_cost(), 128);

        cache.put("c", Arc::new(solid(4, 4, [1, 2, 3, 255])));
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn get_returns_shared_bitmap() {
        let cache = MemoryCache::new(1024);
        let bitmap = Arc::new(solid(2, 2, [9, 9, 9, 255]));
        cache.put("k", bitmap.clone());
        let got = cache.get("k").unwrap().unwrap();
        assert!(Arc::ptr_eq(&got, &bitmap));
        assert!(cache.get("missing").unwrap().is_none());

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.current_cost(), 0);
    }

    #[test]
    fn fraction_budget() {
        let cache = MemoryCache::with_fraction_of(1000, 0.25);
        assert_eq!(cache.max_cost(), 250);
        assert_eq!(MemoryCache::with_fraction_of(1000, 3.0).max_cost(), 1000);
    }
}
