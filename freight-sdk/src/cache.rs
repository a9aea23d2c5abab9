//! Client-side caching over a remote byte store.
//!
//! The cache and the store are composed, not inherited: anything that
//! can move bytes by key ([`RemoteBytes`]) can sit under a
//! [`CachedStore`]. Each cached object carries the timestamp of the
//! version it was fetched at; a strict get compares that timestamp
//! against the store-side `{object_id}_timestamp` sidecar and refetches
//! stale entries.

use std::num::NonZeroUsize;

use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::connector::{EndpointConnector, EndpointKey};
use crate::error::FabricError;

/// A remote store of keyed byte strings.
#[async_trait]
pub trait RemoteBytes: Send + Sync {
    /// Endpoint new keys should name, if the store has one.
    fn local_endpoint(&self) -> Option<Uuid>;

    async fn fetch(&self, key: &EndpointKey) -> Result<Option<Vec<u8>>, FabricError>;

    async fn store(&self, key: &EndpointKey, data: Vec<u8>) -> Result<(), FabricError>;

    async fn contains(&self, key: &EndpointKey) -> Result<bool, FabricError>;

    async fn discard(&self, key: &EndpointKey) -> Result<(), FabricError>;
}

#[async_trait]
impl RemoteBytes for EndpointConnector {
    fn local_endpoint(&self) -> Option<Uuid> {
        Some(self.home_endpoint())
    }

    async fn fetch(&self, key: &EndpointKey) -> Result<Option<Vec<u8>>, FabricError> {
        self.get(key).await
    }

    async fn store(&self, key: &EndpointKey, data: Vec<u8>) -> Result<(), FabricError> {
        self.put_with_key(key, data).await
    }

    async fn contains(&self, key: &EndpointKey) -> Result<bool, FabricError> {
        self.exists(key).await
    }

    async fn discard(&self, key: &EndpointKey) -> Result<(), FabricError> {
        self.evict(key).await
    }
}

/// Caching layer over a [`RemoteBytes`] store.
pub struct CachedStore<S> {
    store: S,
    cache: Option<Mutex<LruCache<String, (i64, Vec<u8>)>>>,
}

impl<S: RemoteBytes> CachedStore<S> {
    /// `cache_size` is the number of objects held locally; 0 disables
    /// the cache entirely.
    pub fn new(store: S, cache_size: usize) -> Self {
        let cache = NonZeroUsize::new(cache_size).map(|n| Mutex::new(LruCache::new(n)));
        Self { store, cache }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Fetch the object for `key`.
    ///
    /// With `strict`, a cache hit is only served if its timestamp is at
    /// least the store-side sidecar timestamp. The sidecar is written
    /// separately from the value, so strictness is only as fresh as the
    /// sidecar read; treat it as eventually consistent.
    pub async fn get(
        &self,
        key: &EndpointKey,
        strict: bool,
    ) -> Result<Option<Vec<u8>>, FabricError> {
        if self.is_cached(key, strict).await? {
            if let Some(cache) = &self.cache {
                if let Some((_, data)) = cache.lock().get(&key.object_id) {
                    tracing::debug!(object = %key.object_id, cached = true, "get");
                    return Ok(Some(data.clone()));
                }
            }
        }

        let Some(data) = self.store.fetch(key).await? else {
            tracing::debug!(object = %key.object_id, "get: object does not exist");
            return Ok(None);
        };
        if let Some(cache) = &self.cache {
            let timestamp = self.remote_timestamp(key).await?.unwrap_or(0);
            cache
                .lock()
                .put(key.object_id.clone(), (timestamp, data.clone()));
        }
        tracing::debug!(object = %key.object_id, cached = false, "get");
        Ok(Some(data))
    }

    /// Store an object under a freshly minted key, stamping its
    /// timestamp sidecar and populating the cache.
    pub async fn put(&self, data: Vec<u8>) -> Result<EndpointKey, FabricError> {
        let key = EndpointKey {
            object_id: Uuid::new_v4().to_string(),
            endpoint_id: self.store.local_endpoint(),
        };
        let timestamp = Utc::now().timestamp_micros();
        self.store.store(&key, data.clone()).await?;
        self.store
            .store(&sidecar_key(&key), timestamp.to_string().into_bytes())
            .await?;
        if let Some(cache) = &self.cache {
            cache.lock().put(key.object_id.clone(), (timestamp, data));
        }
        Ok(key)
    }

    /// Whether `key` can be served from the local cache.
    pub async fn is_cached(&self, key: &EndpointKey, strict: bool) -> Result<bool, FabricError> {
        let Some(cache) = &self.cache else {
            return Ok(false);
        };
        let cached_at = match cache.lock().get(&key.object_id) {
            Some((timestamp, _)) => *timestamp,
            None => return Ok(false),
        };
        if !strict {
            return Ok(true);
        }
        match self.remote_timestamp(key).await? {
            Some(remote) => Ok(cached_at >= remote),
            // No sidecar to compare against; the cached copy is as good
            // as anything the store would return.
            None => Ok(true),
        }
    }

    /// Evict the object from the store and the local cache.
    pub async fn evict(&self, key: &EndpointKey) -> Result<(), FabricError> {
        self.store.discard(key).await?;
        self.store.discard(&sidecar_key(key)).await?;
        if let Some(cache) = &self.cache {
            cache.lock().pop(&key.object_id);
        }
        Ok(())
    }

    async fn remote_timestamp(&self, key: &EndpointKey) -> Result<Option<i64>, FabricError> {
        let Some(raw) = self.store.fetch(&sidecar_key(key)).await? else {
            return Ok(None);
        };
        let text = String::from_utf8(raw)
            .map_err(|e| FabricError::Serialization(format!("bad timestamp sidecar: {e}")))?;
        text.trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|e| FabricError::Serialization(format!("bad timestamp sidecar: {e}")))
    }
}

fn sidecar_key(key: &EndpointKey) -> EndpointKey {
    EndpointKey {
        object_id: format!("{}_timestamp", key.object_id),
        endpoint_id: key.endpoint_id,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    /// In-memory stand-in for an endpoint-backed store.
    #[derive(Default)]
    struct MapStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MapStore {
        fn insert(&self, object_id: &str, data: &[u8]) {
            self.objects
                .lock()
                .insert(object_id.to_string(), data.to_vec());
        }
    }

    #[async_trait]
    impl RemoteBytes for MapStore {
        fn local_endpoint(&self) -> Option<Uuid> {
            None
        }

        async fn fetch(&self, key: &EndpointKey) -> Result<Option<Vec<u8>>, FabricError> {
            Ok(self.objects.lock().get(&key.object_id).cloned())
        }

        async fn store(&self, key: &EndpointKey, data: Vec<u8>) -> Result<(), FabricError> {
            self.objects.lock().insert(key.object_id.clone(), data);
            Ok(())
        }

        async fn contains(&self, key: &EndpointKey) -> Result<bool, FabricError> {
            Ok(self.objects.lock().contains_key(&key.object_id))
        }

        async fn discard(&self, key: &EndpointKey) -> Result<(), FabricError> {
            self.objects.lock().remove(&key.object_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn put_then_get_serves_from_cache() {
        let store = CachedStore::new(MapStore::default(), 16);
        let key = store.put(b"value".to_vec()).await.unwrap();
        assert!(store.is_cached(&key, false).await.unwrap());

        // Remove the remote copy; a non-strict get still sees the cache.
        store.store().objects.lock().remove(&key.object_id);
        assert_eq!(
            store.get(&key, false).await.unwrap(),
            Some(b"value".to_vec())
        );
    }

    #[tokio::test]
    async fn strict_get_refetches_stale_entries() {
        let store = CachedStore::new(MapStore::default(), 16);
        let key = store.put(b"old".to_vec()).await.unwrap();

        // Another writer replaces the value with a newer sidecar.
        store.store().insert(&key.object_id, b"new");
        store
            .store()
            .insert(&format!("{}_timestamp", key.object_id), b"9223372036854775806");

        assert_eq!(store.get(&key, false).await.unwrap(), Some(b"old".to_vec()));
        assert!(!store.is_cached(&key, true).await.unwrap());
        assert_eq!(store.get(&key, true).await.unwrap(), Some(b"new".to_vec()));
        // The refetched version is now fresh.
        assert!(store.is_cached(&key, true).await.unwrap());
    }

    #[tokio::test]
    async fn zero_cache_size_disables_caching() {
        let store = CachedStore::new(MapStore::default(), 0);
        let key = store.put(b"value".to_vec()).await.unwrap();
        assert!(!store.is_cached(&key, false).await.unwrap());
        store.store().objects.lock().remove(&key.object_id);
        assert_eq!(store.get(&key, false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn evict_clears_store_sidecar_and_cache() {
        let store = CachedStore::new(MapStore::default(), 16);
        let key = store.put(b"value".to_vec()).await.unwrap();
        store.evict(&key).await.unwrap();
        assert!(!store.is_cached(&key, false).await.unwrap());
        assert_eq!(store.get(&key, false).await.unwrap(), None);
        assert!(
            !store
                .contains_sidecar(&key)
                .await,
            "sidecar should be gone after evict"
        );
    }

    impl CachedStore<MapStore> {
        async fn contains_sidecar(&self, key: &EndpointKey) -> bool {
            self.store
                .contains(&sidecar_key(key))
                .await
                .unwrap_or(false)
        }
    }
}
