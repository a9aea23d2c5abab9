//! Endpoint request layer.
//!
//! Four operations over keys, routed by one rule: a key with no
//! endpoint id, or naming this endpoint, goes to the local store;
//! anything else is wrapped in a request envelope and delivered over
//! the peer fabric. A missing object is an ordinary `None`/`false`
//! result, never an error.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use freight_sdk::connector::EndpointKey;
use freight_sdk::error::FabricError;
use freight_sdk::proto::{ReplyStatus, RequestKind};

use crate::peers::{LocalHandler, PeerManager};
use crate::store::ObjectStore;

/// Default deadline for a forwarded request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The request layer of one endpoint.
pub struct EndpointService {
    uuid: Uuid,
    name: String,
    store: Arc<ObjectStore>,
    peers: Option<PeerManager>,
    request_timeout: Duration,
}

impl EndpointService {
    pub fn new(
        uuid: Uuid,
        name: String,
        store: Arc<ObjectStore>,
        peers: Option<PeerManager>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            uuid,
            name,
            store,
            peers,
            request_timeout,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The peer fabric, when this endpoint is connected to one.
    pub fn peers(&self) -> Option<&PeerManager> {
        self.peers.as_ref()
    }

    /// Fetch the object for `key`, or `None` if it does not exist.
    pub async fn get(&self, key: &EndpointKey) -> Result<Option<Vec<u8>>, FabricError> {
        match self.route(key)? {
            Route::Local => Ok(self.store.get(&key.object_id)),
            Route::Peer(peer) => {
                let (status, payload) = self
                    .forward(peer, RequestKind::Get, &key.object_id, Vec::new())
                    .await?;
                match status {
                    ReplyStatus::Ok => Ok(Some(payload)),
                    ReplyStatus::NotFound => Ok(None),
                    ReplyStatus::Error => Err(peer_error(payload)),
                }
            }
        }
    }

    /// Store an object under a freshly minted key naming this endpoint.
    pub async fn put(&self, data: Vec<u8>) -> Result<EndpointKey, FabricError> {
        let key = EndpointKey {
            object_id: Uuid::new_v4().to_string(),
            endpoint_id: Some(self.uuid),
        };
        self.store.put(&key.object_id, data)?;
        Ok(key)
    }

    /// Store an object under an explicit key, local or remote.
    pub async fn put_with_key(&self, key: &EndpointKey, data: Vec<u8>) -> Result<(), FabricError> {
        match self.route(key)? {
            Route::Local => self.store.put(&key.object_id, data),
            Route::Peer(peer) => {
                let (status, payload) = self
                    .forward(peer, RequestKind::Put, &key.object_id, data)
                    .await?;
                match status {
                    ReplyStatus::Ok => Ok(()),
                    _ => Err(peer_error(payload)),
                }
            }
        }
    }

    /// Check whether an object exists for `key`.
    pub async fn exists(&self, key: &EndpointKey) -> Result<bool, FabricError> {
        match self.route(key)? {
            Route::Local => Ok(self.store.exists(&key.object_id)),
            Route::Peer(peer) => {
                let (status, payload) = self
                    .forward(peer, RequestKind::Exists, &key.object_id, Vec::new())
                    .await?;
                match status {
                    ReplyStatus::Ok => Ok(payload.first() == Some(&1)),
                    ReplyStatus::NotFound => Ok(false),
                    ReplyStatus::Error => Err(peer_error(payload)),
                }
            }
        }
    }

    /// Evict the object for `key`. Succeeds on absent keys.
    pub async fn evict(&self, key: &EndpointKey) -> Result<(), FabricError> {
        match self.route(key)? {
            Route::Local => {
                self.store.evict(&key.object_id);
                Ok(())
            }
            Route::Peer(peer) => {
                let (status, payload) = self
                    .forward(peer, RequestKind::Evict, &key.object_id, Vec::new())
                    .await?;
                match status {
                    ReplyStatus::Ok | ReplyStatus::NotFound => Ok(()),
                    ReplyStatus::Error => Err(peer_error(payload)),
                }
            }
        }
    }

    fn route(&self, key: &EndpointKey) -> Result<Route, FabricError> {
        match key.endpoint_id {
            None => Ok(Route::Local),
            Some(endpoint) if endpoint == self.uuid => Ok(Route::Local),
            Some(endpoint) => {
                if self.peers.is_none() {
                    return Err(FabricError::Registration(
                        "endpoint is not connected to a signaling relay".to_string(),
                    ));
                }
                Ok(Route::Peer(endpoint))
            }
        }
    }

    async fn forward(
        &self,
        peer: Uuid,
        kind: RequestKind,
        object_id: &str,
        payload: Vec<u8>,
    ) -> Result<(ReplyStatus, Vec<u8>), FabricError> {
        // route() only hands out Route::Peer when the fabric is up.
        let peers = self.peers.as_ref().ok_or_else(|| {
            FabricError::Registration("endpoint is not connected to a signaling relay".to_string())
        })?;
        peers
            .send(
                peer,
                kind,
                object_id.to_string(),
                payload,
                self.request_timeout,
            )
            .await
    }
}

enum Route {
    Local,
    Peer(Uuid),
}

fn peer_error(payload: Vec<u8>) -> FabricError {
    FabricError::Channel(format!(
        "peer reported: {}",
        String::from_utf8_lossy(&payload)
    ))
}

/// Adapter running peer-originated requests against the local store.
pub struct LocalStoreHandler {
    store: Arc<ObjectStore>,
}

impl LocalStoreHandler {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self { store }
    }
}

impl LocalHandler for LocalStoreHandler {
    fn handle(
        &self,
        kind: RequestKind,
        object_id: String,
        payload: Vec<u8>,
    ) -> (ReplyStatus, Vec<u8>) {
        match kind {
            RequestKind::Get => match self.store.get(&object_id) {
                Some(data) => (ReplyStatus::Ok, data),
                None => (ReplyStatus::NotFound, Vec::new()),
            },
            RequestKind::Put => match self.store.put(&object_id, payload) {
                Ok(()) => (ReplyStatus::Ok, Vec::new()),
                Err(e) => (ReplyStatus::Error, e.to_string().into_bytes()),
            },
            RequestKind::Exists => {
                let exists = self.store.exists(&object_id);
                (ReplyStatus::Ok, vec![u8::from(exists)])
            }
            RequestKind::Evict => {
                self.store.evict(&object_id);
                (ReplyStatus::Ok, Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;

    fn local_service() -> EndpointService {
        EndpointService::new(
            Uuid::new_v4(),
            "test".to_string(),
            Arc::new(ObjectStore::new(StoreOptions::default())),
            None,
            DEFAULT_REQUEST_TIMEOUT,
        )
    }

    #[tokio::test]
    async fn local_roundtrip() {
        let service = local_service();
        let key = service.put(b"hello".to_vec()).await.unwrap();
        assert_eq!(key.endpoint_id, Some(service.uuid()));

        assert_eq!(service.get(&key).await.unwrap(), Some(b"hello".to_vec()));
        assert!(service.exists(&key).await.unwrap());

        service.evict(&key).await.unwrap();
        assert!(!service.exists(&key).await.unwrap());
        assert_eq!(service.get(&key).await.unwrap(), None);
        // Evicting again is a no-op, not an error.
        service.evict(&key).await.unwrap();
    }

    #[tokio::test]
    async fn keys_without_an_endpoint_resolve_locally() {
        let service = local_service();
        let key = EndpointKey {
            object_id: "shared".to_string(),
            endpoint_id: None,
        };
        service.put_with_key(&key, b"x".to_vec()).await.unwrap();
        assert_eq!(service.get(&key).await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn remote_keys_require_a_fabric() {
        let service = local_service();
        let key = EndpointKey {
            object_id: "elsewhere".to_string(),
            endpoint_id: Some(Uuid::new_v4()),
        };
        let err = service.get(&key).await.unwrap_err();
        assert!(matches!(err, FabricError::Registration(_)));
    }

    #[test]
    fn handler_mirrors_store_semantics() {
        let store = Arc::new(ObjectStore::new(StoreOptions::default()));
        let handler = LocalStoreHandler::new(store.clone());

        let (status, _) = handler.handle(RequestKind::Get, "missing".to_string(), Vec::new());
        assert_eq!(status, ReplyStatus::NotFound);

        let (status, _) = handler.handle(RequestKind::Put, "a".to_string(), b"v".to_vec());
        assert_eq!(status, ReplyStatus::Ok);

        let (status, payload) = handler.handle(RequestKind::Exists, "a".to_string(), Vec::new());
        assert_eq!((status, payload), (ReplyStatus::Ok, vec![1]));

        let (status, payload) = handler.handle(RequestKind::Get, "a".to_string(), Vec::new());
        assert_eq!((status, payload), (ReplyStatus::Ok, b"v".to_vec()));

        let (status, _) = handler.handle(RequestKind::Evict, "a".to_string(), Vec::new());
        assert_eq!(status, ReplyStatus::Ok);
        assert!(!store.exists("a"));
    }
}
