//! Cache-aside read path for single parts.

use super::PartStore;
use crate::constants::{part_cache_key, PART_CACHE_TTL_SECS};
use crate::error::Result;
use crate::types::Part;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Key/value store with per-entry expiry.
#[async_trait]
pub trait PartCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
}

/// Process-local TTL cache. Expired entries are dropped lazily on read.
#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PartCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires)) if *expires > now => return Ok(Some(value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }
}

/// Reads parts through a cache, falling back to the store on a miss or a cache failure.
pub struct CachedPartReader {
    store: Arc<dyn PartStore>,
    cache: Arc<dyn PartCache>,
    ttl: Duration,
}

impl CachedPartReader {
    pub fn new(store: Arc<dyn PartStore>, cache: Arc<dyn PartCache>) -> Self {
        Self {
            store,
            cache,
            ttl: Duration::from_secs(PART_CACHE_TTL_SECS),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn get_part(&self, id: &str) -> Result<Part> {
        let key = part_cache_key(id);
        match self.cache.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_str::<Part>(&cached) {
                Ok(part) => {
                    debug!("Cache hit for {}", key);
                    return Ok(part);
                }
                Err(e) => warn!("Discarding unreadable cache entry {}: {}", key, e),
            },
            Ok(None) => debug!("Cache miss for {}", key),
            Err(e) => warn!("Cache read failed for {}: {}", key, e),
        }

        let part = self.store.get_part(id).await?;
        match serde_json::to_string(&part) {
            Ok(json) => {
                if let Err(e) = self.cache.set(&key, json, self.ttl).await {
                    warn!("Cache write failed for {}: {}", key, e);
                }
            }
            Err(e) => warn!("Could not serialize part {} for caching: {}", id, e),
        }
        Ok(part)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScraperError;
    use crate::storage::InMemoryPartStore;

    struct BrokenCache;

    #[async_trait]
    impl PartCache for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(ScraperError::transport("cache down"))
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<()> {
            Err(ScraperError::transport("cache down"))
        }
    }

    async fn store_with_part() -> (Arc<InMemoryPartStore>, Part) {
        let store = Arc::new(InMemoryPartStore::new());
        let mut part = Part::new("JensonUSA", "https://www.jensonusa.com/products/widget");
        part.brand = "Shimano".into();
        store.upsert_part(&part).await.unwrap();
        let stored = store.get_part(&part.id).await.unwrap();
        (store, stored)
    }

    #[tokio::test]
    async fn test_miss_populates_cache() {
        let (store, part) = store_with_part().await;
        let cache = Arc::new(InMemoryCache::new());
        let reader = CachedPartReader::new(store, cache.clone());

        assert_eq!(reader.get_part(&part.id).await.unwrap(), part);
        let cached = cache.get(&format!("part:{}", part.id)).await.unwrap().unwrap();
        assert_eq!(serde_json::from_str::<Part>(&cached).unwrap(), part);
    }

    #[tokio::test]
    async fn test_broken_cache_falls_through() {
        let (store, part) = store_with_part().await;
        let reader = CachedPartReader::new(store, Arc::new(BrokenCache));
        assert_eq!(reader.get_part(&part.id).await.unwrap().brand, "Shimano");
        assert!(reader.get_part("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = InMemoryCache::new();
        cache.set("k", "v".into(), Duration::from_millis(10)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
