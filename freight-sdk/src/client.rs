//! HTTP client for endpoint gateways.
//!
//! A thin wrapper over the gateway's REST surface. Object payloads are
//! `application/octet-stream`; the optional `endpoint` query parameter
//! asks the gateway to forward the operation to a peer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FabricError;

/// Identity reported by `GET /endpoint`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointIdentity {
    pub uuid: Uuid,
    pub name: String,
}

/// Client bound to one endpoint gateway.
#[derive(Debug, Clone)]
pub struct EndpointClient {
    http: reqwest::Client,
    address: String,
}

impl EndpointClient {
    /// `address` is the gateway base URL, e.g. `http://127.0.0.1:8770`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            address: address.into(),
        }
    }

    /// Gateway base URL this client talks to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Identity of the endpoint behind the gateway.
    pub async fn identity(&self) -> Result<EndpointIdentity, FabricError> {
        let response = self
            .http
            .get(format!("{}/endpoint", self.address))
            .send()
            .await
            .map_err(connection_error)?;
        if !response.status().is_success() {
            return Err(FabricError::Channel(format!(
                "endpoint identity request failed with status {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| FabricError::Serialization(e.to_string()))
    }

    /// Fetch an object; `None` if it does not exist.
    pub async fn get(
        &self,
        object_id: &str,
        endpoint: Option<Uuid>,
    ) -> Result<Option<Vec<u8>>, FabricError> {
        let response = self
            .request(reqwest::Method::GET, object_id, endpoint)
            .send()
            .await
            .map_err(connection_error)?;
        match response.status() {
            reqwest::StatusCode::OK => Ok(Some(
                response
                    .bytes()
                    .await
                    .map_err(connection_error)?
                    .to_vec(),
            )),
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status => Err(status_error("get", status, response).await),
        }
    }

    /// Store an object under an explicit id.
    pub async fn put(
        &self,
        object_id: &str,
        data: Vec<u8>,
        endpoint: Option<Uuid>,
    ) -> Result<(), FabricError> {
        let response = self
            .request(reqwest::Method::PUT, object_id, endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(connection_error)?;
        match response.status() {
            reqwest::StatusCode::CREATED | reqwest::StatusCode::OK => Ok(()),
            status => Err(status_error("put", status, response).await),
        }
    }

    /// Check whether an object exists.
    pub async fn exists(
        &self,
        object_id: &str,
        endpoint: Option<Uuid>,
    ) -> Result<bool, FabricError> {
        let response = self
            .request(reqwest::Method::HEAD, object_id, endpoint)
            .send()
            .await
            .map_err(connection_error)?;
        match response.status() {
            reqwest::StatusCode::OK => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status => Err(status_error("exists", status, response).await),
        }
    }

    /// Evict an object. Succeeds whether or not the object existed.
    pub async fn evict(
        &self,
        object_id: &str,
        endpoint: Option<Uuid>,
    ) -> Result<(), FabricError> {
        let response = self
            .request(reqwest::Method::DELETE, object_id, endpoint)
            .send()
            .await
            .map_err(connection_error)?;
        match response.status() {
            reqwest::StatusCode::OK | reqwest::StatusCode::NOT_FOUND => Ok(()),
            status => Err(status_error("evict", status, response).await),
        }
    }

    fn request(
        &self,
        method: reqwest::Method,
        object_id: &str,
        endpoint: Option<Uuid>,
    ) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}/object/{object_id}", self.address));
        if let Some(endpoint) = endpoint {
            builder = builder.query(&[("endpoint", endpoint.to_string())]);
        }
        builder
    }
}

fn connection_error(e: reqwest::Error) -> FabricError {
    FabricError::Channel(format!("endpoint request failed: {e}"))
}

async fn status_error(
    op: &str,
    status: reqwest::StatusCode,
    response: reqwest::Response,
) -> FabricError {
    let detail = response.text().await.unwrap_or_default();
    FabricError::Channel(format!(
        "{op} failed with status {status}: {detail}"
    ))
}
