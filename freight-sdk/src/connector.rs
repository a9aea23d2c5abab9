//! Connector that resolves keys against a fleet of endpoints.
//!
//! A connector is built from a list of endpoint identities. It scans the
//! local freight directory for a configuration matching one of them,
//! probes its gateway, and uses that endpoint as home: puts land there,
//! and gets for keys naming other endpoints are forwarded by the home
//! endpoint over the peer fabric.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::EndpointClient;
use crate::config::{self, EndpointConfig};
use crate::error::FabricError;

/// Key to an object in the fabric.
///
/// The key is the unit that travels through task graphs: it names the
/// object and the endpoint holding it, which is all any endpoint needs
/// to resolve the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointKey {
    /// Unique object id (opaque to the fabric).
    pub object_id: String,
    /// Endpoint the object lives on. `None` means "wherever the
    /// resolving endpoint is".
    pub endpoint_id: Option<Uuid>,
}

/// Everything needed to reconstruct a connector on another host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub endpoints: Vec<Uuid>,
    pub freight_dir: Option<PathBuf>,
}

/// Connector to freight endpoints.
#[derive(Debug, Clone)]
pub struct EndpointConnector {
    endpoints: Vec<Uuid>,
    freight_dir: Option<PathBuf>,
    client: EndpointClient,
    home_uuid: Uuid,
}

impl EndpointConnector {
    /// Find a locally reachable endpoint among `endpoints` and bind to
    /// it as home.
    ///
    /// Scans `freight_dir` (default: the freight home dir) for endpoint
    /// configurations, probing each candidate's gateway until one
    /// responds with a matching identity.
    pub async fn new(
        endpoints: Vec<Uuid>,
        freight_dir: Option<PathBuf>,
    ) -> Result<Self, FabricError> {
        if endpoints.is_empty() {
            return Err(FabricError::Config(
                "at least one endpoint must be specified".to_string(),
            ));
        }
        let scan_dir = freight_dir.clone().unwrap_or_else(config::home_dir);

        let mut home: Option<(EndpointConfig, EndpointClient)> = None;
        for candidate in config::get_configs(&scan_dir) {
            if !endpoints.contains(&candidate.uuid) {
                continue;
            }
            tracing::debug!(uuid = %candidate.uuid, "probing endpoint");
            let client = EndpointClient::new(gateway_address(&candidate));
            match client.identity().await {
                Ok(identity) if identity.uuid == candidate.uuid => {
                    tracing::debug!(
                        uuid = %candidate.uuid,
                        "endpoint reachable, using as home"
                    );
                    home = Some((candidate, client));
                    break;
                }
                Ok(identity) => {
                    tracing::debug!(
                        expected = %candidate.uuid,
                        got = %identity.uuid,
                        "endpoint returned a different identity"
                    );
                }
                Err(e) => {
                    tracing::debug!(uuid = %candidate.uuid, "endpoint probe failed: {e}");
                }
            }
        }

        let (config, client) = home.ok_or_else(|| {
            FabricError::Config(
                "failed to find a reachable endpoint matching one of the provided identities"
                    .to_string(),
            )
        })?;
        Ok(Self {
            endpoints,
            freight_dir,
            client,
            home_uuid: config.uuid,
        })
    }

    /// Reconstruct a connector from [`Self::config`].
    pub async fn from_config(config: ConnectorConfig) -> Result<Self, FabricError> {
        Self::new(config.endpoints, config.freight_dir).await
    }

    /// Configuration sufficient to reconstruct this connector.
    pub fn config(&self) -> ConnectorConfig {
        ConnectorConfig {
            endpoints: self.endpoints.clone(),
            freight_dir: self.freight_dir.clone(),
        }
    }

    /// Identity of the home endpoint.
    pub fn home_endpoint(&self) -> Uuid {
        self.home_uuid
    }

    /// Fetch the object for `key`, or `None` if it does not exist.
    pub async fn get(&self, key: &EndpointKey) -> Result<Option<Vec<u8>>, FabricError> {
        self.client.get(&key.object_id, key.endpoint_id).await
    }

    /// Sequential fetch of a batch of keys, in order.
    pub async fn get_batch(
        &self,
        keys: &[EndpointKey],
    ) -> Result<Vec<Option<Vec<u8>>>, FabricError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    /// Store an object on the home endpoint under a freshly minted key.
    pub async fn put(&self, data: Vec<u8>) -> Result<EndpointKey, FabricError> {
        let key = EndpointKey {
            object_id: Uuid::new_v4().to_string(),
            endpoint_id: Some(self.home_uuid),
        };
        self.put_with_key(&key, data).await?;
        Ok(key)
    }

    /// Sequential store of a batch of objects; keys come back in order.
    pub async fn put_batch(&self, objects: Vec<Vec<u8>>) -> Result<Vec<EndpointKey>, FabricError> {
        let mut keys = Vec::with_capacity(objects.len());
        for data in objects {
            keys.push(self.put(data).await?);
        }
        Ok(keys)
    }

    /// Store an object under an explicit key.
    pub async fn put_with_key(
        &self,
        key: &EndpointKey,
        data: Vec<u8>,
    ) -> Result<(), FabricError> {
        self.client
            .put(&key.object_id, data, key.endpoint_id)
            .await
    }

    /// Check whether an object exists for `key`.
    pub async fn exists(&self, key: &EndpointKey) -> Result<bool, FabricError> {
        self.client.exists(&key.object_id, key.endpoint_id).await
    }

    /// Evict the object for `key`. Succeeds on absent keys.
    pub async fn evict(&self, key: &EndpointKey) -> Result<(), FabricError> {
        self.client.evict(&key.object_id, key.endpoint_id).await
    }
}

fn gateway_address(config: &EndpointConfig) -> String {
    let host = config.host.as_deref().unwrap_or("127.0.0.1");
    format!("http://{host}:{}", config.port)
}
