//! In-memory object store.
//!
//! A plain `object_id → bytes` map with two bounds: objects above
//! `max_object_size` are rejected outright, and when total residency
//! exceeds `max_bytes` the oldest inserted objects are evicted.
//! Objects do not survive a restart.

use std::collections::{HashMap, VecDeque};

use freight_sdk::error::FabricError;
use parking_lot::Mutex;

/// Store bounds. `None` means unbounded.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Largest accepted single object, in bytes.
    pub max_object_size: Option<usize>,
    /// Total residency bound, in bytes. Exceeding it evicts the oldest
    /// inserted objects until the new object fits.
    pub max_bytes: Option<usize>,
}

#[derive(Default)]
struct StoreInner {
    objects: HashMap<String, Vec<u8>>,
    /// Insertion order, oldest first. Re-inserting an id refreshes its
    /// position.
    order: VecDeque<String>,
    total_bytes: usize,
}

/// The endpoint's local object store.
pub struct ObjectStore {
    inner: Mutex<StoreInner>,
    options: StoreOptions,
}

impl ObjectStore {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            options,
        }
    }

    /// Insert or replace an object.
    pub fn put(&self, object_id: &str, data: Vec<u8>) -> Result<(), FabricError> {
        if let Some(limit) = self.options.max_object_size {
            if data.len() > limit {
                return Err(FabricError::ObjectTooLarge {
                    size: data.len(),
                    limit,
                });
            }
        }

        let mut inner = self.inner.lock();
        if let Some(old) = inner.objects.remove(object_id) {
            inner.total_bytes -= old.len();
            inner.order.retain(|id| id != object_id);
        }
        inner.total_bytes += data.len();
        inner.order.push_back(object_id.to_string());
        inner.objects.insert(object_id.to_string(), data);

        if let Some(max_bytes) = self.options.max_bytes {
            while inner.total_bytes > max_bytes && inner.order.len() > 1 {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                if oldest == object_id {
                    // Never evict the object just inserted.
                    inner.order.push_back(oldest);
                    continue;
                }
                if let Some(evicted) = inner.objects.remove(&oldest) {
                    inner.total_bytes -= evicted.len();
                    tracing::debug!(object = %oldest, "evicted to stay under the byte bound");
                }
            }
        }
        Ok(())
    }

    /// Fetch a copy of an object, or `None` if absent.
    pub fn get(&self, object_id: &str) -> Option<Vec<u8>> {
        self.inner.lock().objects.get(object_id).cloned()
    }

    pub fn exists(&self, object_id: &str) -> bool {
        self.inner.lock().objects.contains_key(object_id)
    }

    /// Remove an object. A no-op on absent ids.
    pub fn evict(&self, object_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.objects.remove(object_id) {
            inner.total_bytes -= old.len();
            inner.order.retain(|id| id != object_id);
        }
    }

    /// Number of resident objects.
    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total resident bytes.
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_evict_roundtrip() {
        let store = ObjectStore::new(StoreOptions::default());
        store.put("a", b"hello".to_vec()).unwrap();
        assert_eq!(store.get("a"), Some(b"hello".to_vec()));
        assert!(store.exists("a"));

        store.evict("a");
        assert_eq!(store.get("a"), None);
        assert!(!store.exists("a"));
        assert_eq!(store.total_bytes(), 0);
    }

    #[test]
    fn evict_is_idempotent() {
        let store = ObjectStore::new(StoreOptions::default());
        store.evict("missing");
        store.put("a", vec![1]).unwrap();
        store.evict("a");
        store.evict("a");
        assert!(store.is_empty());
    }

    #[test]
    fn replacement_updates_residency() {
        let store = ObjectStore::new(StoreOptions::default());
        store.put("a", vec![0; 100]).unwrap();
        store.put("a", vec![0; 10]).unwrap();
        assert_eq!(store.total_bytes(), 10);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn oversized_objects_are_rejected() {
        let store = ObjectStore::new(StoreOptions {
            max_object_size: Some(8),
            max_bytes: None,
        });
        let err = store.put("big", vec![0; 9]).unwrap_err();
        assert!(matches!(
            err,
            FabricError::ObjectTooLarge { size: 9, limit: 8 }
        ));
        assert!(!store.exists("big"));
    }

    #[test]
    fn oldest_objects_are_evicted_past_the_byte_bound() {
        let store = ObjectStore::new(StoreOptions {
            max_object_size: None,
            max_bytes: Some(25),
        });
        store.put("a", vec![0; 10]).unwrap();
        store.put("b", vec![0; 10]).unwrap();
        store.put("c", vec![0; 10]).unwrap();

        assert!(!store.exists("a"), "oldest object should be evicted");
        assert!(store.exists("b"));
        assert!(store.exists("c"));
        assert!(store.total_bytes() <= 25);
    }

    #[test]
    fn reinsertion_refreshes_eviction_order() {
        let store = ObjectStore::new(StoreOptions {
            max_object_size: None,
            max_bytes: Some(25),
        });
        store.put("a", vec![0; 10]).unwrap();
        store.put("b", vec![0; 10]).unwrap();
        store.put("a", vec![0; 10]).unwrap(); // refresh "a"
        store.put("c", vec![0; 10]).unwrap();

        assert!(store.exists("a"));
        assert!(!store.exists("b"), "b is now the oldest and goes first");
    }

    #[test]
    fn new_object_is_never_evicted_by_its_own_insert() {
        let store = ObjectStore::new(StoreOptions {
            max_object_size: None,
            max_bytes: Some(5),
        });
        store.put("big", vec![0; 10]).unwrap();
        assert!(store.exists("big"));
    }
}
