use std::num::NonZeroUsize;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use crate::router::{Road, Router};

const DEFAULT_CAPACITY: usize = 128;

/// Bounded LRU wrapping another router. A hit returns the memoized road
/// without consulting the inner router; the least recently used entry is
/// evicted on overflow.
pub struct RouterCache<R> {
    inner: R,
    cache: Mutex<LruCache<String, Road>>,
}

impl<R: Router> RouterCache<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(inner: R, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { inner, cache: Mutex::new(LruCache::new(capacity)) }
    }
}

#[async_trait]
impl<R: Router> Router for RouterCache<R> {
    async fn road(&self, host: &str) -> Road {
        if let Some(road) = self.cache.lock().get(host) {
            return *road;
        }
        let road = self.inner.road(host).await;
        self.cache.lock().put(host.to_string(), road);
        road
    }
}
