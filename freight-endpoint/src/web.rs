//! HTTP gateway for the endpoint request layer.
//!
//! Deliberately thin: every route is a transliteration of one request-
//! layer operation, with no policy of its own. Object payloads are
//! `application/octet-stream`; the `endpoint` query parameter routes
//! the operation to a peer.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use freight_sdk::client::EndpointIdentity;
use freight_sdk::connector::EndpointKey;
use freight_sdk::error::FabricError;
use freight_sdk::proto::MAX_FRAME_SIZE;

use crate::service::EndpointService;

/// Build the gateway router.
pub fn router(service: Arc<EndpointService>) -> Router {
    Router::new()
        .route("/endpoint", get(identity))
        .route(
            "/object/{id}",
            get(get_object)
                .put(put_object)
                .head(head_object)
                .delete(delete_object),
        )
        .layer(DefaultBodyLimit::max(MAX_FRAME_SIZE))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

#[derive(Debug, Deserialize)]
struct ObjectQuery {
    endpoint: Option<Uuid>,
}

fn object_key(id: String, query: ObjectQuery) -> EndpointKey {
    EndpointKey {
        object_id: id,
        endpoint_id: query.endpoint,
    }
}

/// Map a request-layer failure onto the gateway's status codes: bad
/// input is the caller's fault, everything peer-side is a bad gateway.
fn error_response(e: FabricError) -> Response {
    let status = match e {
        FabricError::ObjectTooLarge { .. }
        | FabricError::Serialization(_)
        | FabricError::Config(_) => StatusCode::BAD_REQUEST,
        FabricError::Registration(_)
        | FabricError::PeerUnknown(_)
        | FabricError::Timeout(_)
        | FabricError::Backpressure(_)
        | FabricError::Channel(_) => StatusCode::BAD_GATEWAY,
    };
    (status, e.to_string()).into_response()
}

async fn identity(State(service): State<Arc<EndpointService>>) -> Json<EndpointIdentity> {
    Json(EndpointIdentity {
        uuid: service.uuid(),
        name: service.name().to_string(),
    })
}

async fn get_object(
    State(service): State<Arc<EndpointService>>,
    Path(id): Path<String>,
    Query(query): Query<ObjectQuery>,
) -> Response {
    match service.get(&object_key(id, query)).await {
        Ok(Some(data)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            data,
        )
            .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(e),
    }
}

async fn put_object(
    State(service): State<Arc<EndpointService>>,
    Path(id): Path<String>,
    Query(query): Query<ObjectQuery>,
    body: Bytes,
) -> Response {
    match service
        .put_with_key(&object_key(id, query), body.to_vec())
        .await
    {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => error_response(e),
    }
}

async fn head_object(
    State(service): State<Arc<EndpointService>>,
    Path(id): Path<String>,
    Query(query): Query<ObjectQuery>,
) -> Response {
    match service.exists(&object_key(id, query)).await {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_object(
    State(service): State<Arc<EndpointService>>,
    Path(id): Path<String>,
    Query(query): Query<ObjectQuery>,
) -> Response {
    match service.evict(&object_key(id, query)).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}
