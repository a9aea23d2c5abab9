//! Endpoint wiring: store, signaling, peer fabric, and gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use freight_sdk::config::{EndpointConfig, local_hostname};
use freight_sdk::proto::SignalMessage;
use freight_sdk::relay_client;

use crate::peers::{PeerManager, PeerOptions};
use crate::service::{DEFAULT_REQUEST_TIMEOUT, EndpointService, LocalStoreHandler};
use crate::store::{ObjectStore, StoreOptions};
use crate::web;

/// A configured endpoint, ready to start.
pub struct EndpointServer {
    pub config: EndpointConfig,
    pub peer_options: PeerOptions,
    pub store_options: StoreOptions,
    /// Deadline for requests forwarded to peers.
    pub request_timeout: Duration,
    /// Deadline for registering with the signaling relay.
    pub registration_timeout: Duration,
}

/// A started endpoint: bound addresses plus handles for callers that
/// drive it directly (tests, the CLI serve path).
pub struct RunningEndpoint {
    pub uuid: Uuid,
    pub http_addr: SocketAddr,
    pub service: Arc<EndpointService>,
    pub handle: JoinHandle<()>,
}

impl EndpointServer {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            peer_options: PeerOptions::default(),
            store_options: StoreOptions::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            registration_timeout: relay_client::DEFAULT_REGISTRATION_TIMEOUT,
        }
    }

    /// Bind listeners, bring up the fabric, and serve the gateway.
    pub async fn start(self) -> Result<RunningEndpoint> {
        let config = self.config;
        let bind_host = config.host.clone().unwrap_or_else(|| "0.0.0.0".to_string());

        let http_listener = TcpListener::bind((bind_host.as_str(), config.port))
            .await
            .with_context(|| format!("failed to bind gateway on {bind_host}:{}", config.port))?;
        let http_addr = http_listener.local_addr()?;

        let store = Arc::new(ObjectStore::new(self.store_options));

        let peers = match config.relay_addr.clone() {
            Some(relay_addr) => {
                let peer_listener = TcpListener::bind((bind_host.as_str(), config.peer_port))
                    .await
                    .with_context(|| {
                        format!("failed to bind peer listener on {bind_host}:{}", config.peer_port)
                    })?;
                let peer_port = peer_listener.local_addr()?.port();
                let advertised_host = config.host.clone().unwrap_or_else(local_hostname);
                let advertised = format!("{advertised_host}:{peer_port}");
                tracing::info!(addr = %advertised, relay = %relay_addr, "peer fabric enabled");

                let (signal_out_tx, signal_out_rx) = mpsc::channel(256);
                let (signal_in_tx, signal_in_rx) = mpsc::channel(256);
                spawn_relay_pump(
                    relay_addr,
                    config.uuid,
                    config.name.clone(),
                    signal_out_rx,
                    signal_in_tx,
                    self.registration_timeout,
                );

                let handler = Arc::new(LocalStoreHandler::new(Arc::clone(&store)));
                Some(PeerManager::start(
                    config.uuid,
                    config.name.clone(),
                    advertised,
                    peer_listener,
                    signal_out_tx,
                    signal_in_rx,
                    handler,
                    self.peer_options,
                ))
            }
            None => {
                tracing::info!("no signaling relay configured; serving local requests only");
                None
            }
        };

        let service = Arc::new(EndpointService::new(
            config.uuid,
            config.name.clone(),
            store,
            peers,
            self.request_timeout,
        ));

        tracing::info!(uuid = %config.uuid, name = %config.name, "endpoint gateway on {http_addr}");
        let app = web::router(Arc::clone(&service));
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(http_listener, app).await {
                tracing::error!("endpoint gateway error: {e}");
            }
        });

        Ok(RunningEndpoint {
            uuid: config.uuid,
            http_addr,
            service,
            handle,
        })
    }

    /// Start and serve until the gateway task ends.
    pub async fn run(self) -> Result<()> {
        let running = self.start().await?;
        running.handle.await.context("endpoint gateway task failed")
    }
}

/// Keep a registered signaling session alive, shuttling messages both
/// ways and reconnecting with exponential backoff when it drops. The
/// same identity is re-registered on every reconnect.
fn spawn_relay_pump(
    relay_addr: String,
    uuid: Uuid,
    name: String,
    mut out_rx: mpsc::Receiver<SignalMessage>,
    in_tx: mpsc::Sender<SignalMessage>,
    registration_timeout: Duration,
) {
    tokio::spawn(async move {
        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(60);
        loop {
            match relay_client::connect(
                &relay_addr,
                Some(uuid),
                Some(name.clone()),
                registration_timeout,
            )
            .await
            {
                Ok(conn) => {
                    backoff = Duration::from_secs(1);
                    let (tx, mut rx) = conn.split();
                    loop {
                        tokio::select! {
                            inbound = rx.recv() => match inbound {
                                Some(msg) => {
                                    if in_tx.send(msg).await.is_err() {
                                        return;
                                    }
                                }
                                None => break,
                            },
                            outbound = out_rx.recv() => match outbound {
                                Some(msg) => {
                                    if tx.send(msg).await.is_err() {
                                        break;
                                    }
                                }
                                None => return,
                            },
                        }
                    }
                    tracing::warn!(relay = %relay_addr, "signaling session lost, reconnecting");
                }
                Err(e) => {
                    tracing::warn!(
                        relay = %relay_addr,
                        backoff_secs = backoff.as_secs(),
                        "signaling registration failed: {e}"
                    );
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        }
    });
}
