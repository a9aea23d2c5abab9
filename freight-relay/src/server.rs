//! Relay server core: registry, WebSocket session handler, routing.
//!
//! Each connection is one session task that owns the socket, plus a
//! bounded mpsc feeding it outbound frames. The registry is a single
//! set of registered peers with two lookup structures (by session and
//! by identity) guarded by one lock, so they can never diverge across
//! an await point.
//!
//! Session protocol: the first recognised frame must be a registration;
//! a registered session may then send peer-connection messages, which
//! are forwarded verbatim to the session registered under the target
//! identity. Undecodable frames are skipped. Clean closes unregister
//! with code 1000, errors with 1001.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use freight_sdk::proto::{self, PeerConnectionMsg, SignalMessage};

/// Frames queued for a session's socket.
#[derive(Debug)]
enum Outbound {
    Frame(SignalMessage),
    Close { code: u16, reason: &'static str },
}

/// A registered peer. One entry, reachable through both indices.
#[derive(Clone)]
struct RegisteredPeer {
    session: u64,
    uuid: Uuid,
    name: String,
    tx: mpsc::Sender<Outbound>,
}

/// The one authoritative set of registered peers with its two derived
/// lookup structures. All mutation happens under the registry lock, so
/// the indices agree at every await boundary.
#[derive(Default)]
struct Registry {
    by_session: HashMap<u64, RegisteredPeer>,
    by_uuid: HashMap<Uuid, RegisteredPeer>,
}

impl Registry {
    /// Bind a peer into both indices. When the identity is already
    /// bound to another session, that entry is removed first and
    /// returned so the caller can close its transport.
    fn register(&mut self, peer: RegisteredPeer) -> Option<RegisteredPeer> {
        let displaced = match self.by_uuid.get(&peer.uuid) {
            Some(existing) if existing.session != peer.session => {
                self.remove_session(existing.session)
            }
            _ => None,
        };
        self.by_session.insert(peer.session, peer.clone());
        self.by_uuid.insert(peer.uuid, peer);
        displaced
    }

    fn remove_session(&mut self, session: u64) -> Option<RegisteredPeer> {
        let peer = self.by_session.remove(&session)?;
        self.by_uuid.remove(&peer.uuid);
        Some(peer)
    }

    fn lookup_session(&self, session: u64) -> Option<RegisteredPeer> {
        self.by_session.get(&session).cloned()
    }

    fn lookup_uuid(&self, uuid: Uuid) -> Option<RegisteredPeer> {
        self.by_uuid.get(&uuid).cloned()
    }

    #[cfg(test)]
    fn indices_consistent(&self) -> bool {
        self.by_session.len() == self.by_uuid.len()
            && self.by_session.values().all(|p| {
                self.by_uuid
                    .get(&p.uuid)
                    .is_some_and(|q| q.session == p.session)
            })
    }
}

/// Shared relay state.
pub struct RelayState {
    registry: Mutex<Registry>,
    next_session: AtomicU64,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_session: AtomicU64::new(0),
        }
    }

    /// Number of registered peers (diagnostics).
    pub fn registered_count(&self) -> usize {
        self.registry.lock().by_uuid.len()
    }
}

/// Handle one WebSocket session to completion.
pub async fn handle_socket(mut socket: WebSocket, state: Arc<RelayState>) {
    let session = state.next_session.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::channel::<Outbound>(64);

    // expected: whether the session ended with a clean close.
    // forced: the registry already dropped us and a close frame with its
    // own code has been sent; skip the normal unregister path.
    let mut expected = true;
    let mut forced = false;

    loop {
        tokio::select! {
            frame = socket.recv() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&state, session, &tx, text.as_bytes()).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    handle_frame(&state, session, &tx, &data).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    expected = true;
                    break;
                }
                Some(Ok(_)) => {} // ping/pong, handled by axum
                Some(Err(e)) => {
                    tracing::debug!(session, "socket error: {e}");
                    expected = false;
                    break;
                }
            },
            out = rx.recv() => match out {
                Some(Outbound::Frame(msg)) => {
                    if send_signal(&mut socket, &msg).await.is_err() {
                        expected = false;
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    forced = true;
                    break;
                }
                None => break,
            },
        }
    }

    if forced {
        return;
    }
    if let Some(peer) = state.registry.lock().remove_session(session) {
        tracing::info!(
            uuid = %peer.uuid,
            name = %peer.name,
            reason = if expected { "ok" } else { "unexpected" },
            "unregistering client"
        );
    }
    let code = if expected { 1000 } else { 1001 };
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: "".into(),
        })))
        .await;
}

/// Process one inbound frame from a session.
async fn handle_frame(
    state: &Arc<RelayState>,
    session: u64,
    tx: &mpsc::Sender<Outbound>,
    bytes: &[u8],
) {
    let msg = match proto::decode_signal(bytes) {
        Ok(msg) => msg,
        Err(e) => {
            // Non-fatal for the session: skip the frame, keep reading.
            tracing::warn!(session, "skipping undecodable frame: {e}");
            return;
        }
    };

    match msg {
        SignalMessage::Register { uuid, name } => {
            register(state, session, tx, uuid, name);
        }
        SignalMessage::PeerConnection(msg) => {
            let sender = state.registry.lock().lookup_session(session);
            match sender {
                Some(me) => forward(state, &me, msg).await,
                None => {
                    tracing::info!(
                        session,
                        source = %msg.source_uuid,
                        "peer-connection message from unregistered client"
                    );
                    reply(
                        tx,
                        SignalMessage::ServerError {
                            message: "client has not registered yet".to_string(),
                        },
                    );
                }
            }
        }
        other => {
            tracing::warn!(session, "unknown request type: {other:?}");
            reply(
                tx,
                SignalMessage::ServerError {
                    message: "unknown request type".to_string(),
                },
            );
        }
    }
}

/// Register the session, minting an identity when none was supplied.
fn register(
    state: &Arc<RelayState>,
    session: u64,
    tx: &mpsc::Sender<Outbound>,
    uuid: Option<Uuid>,
    name: String,
) {
    let mut registry = state.registry.lock();
    if let Some(existing) = registry.lookup_session(session) {
        // Same transport registering again: return its registration.
        tracing::info!(uuid = %existing.uuid, "client re-registered on the same transport");
        drop(registry);
        reply(
            tx,
            SignalMessage::RegisterAck {
                uuid: existing.uuid,
                error: None,
            },
        );
        return;
    }

    let uuid = uuid.unwrap_or_else(Uuid::new_v4);
    let displaced = registry.register(RegisteredPeer {
        session,
        uuid,
        name: name.clone(),
        tx: tx.clone(),
    });
    drop(registry);

    if let Some(old) = displaced {
        // The identity reconnected on a new transport. The old one is
        // already out of the registry; close it with a transient code.
        tracing::info!(%uuid, "unexpected reconnect, closing previous transport");
        if old
            .tx
            .try_send(Outbound::Close {
                code: 1001,
                reason: "unexpected reconnect",
            })
            .is_err()
        {
            tracing::debug!(%uuid, "previous transport already closing");
        }
    }

    tracing::info!(%uuid, name, "registered client");
    reply(tx, SignalMessage::RegisterAck { uuid, error: None });
}

/// Forward a peer-connection message to its target, or bounce it back
/// to the sender with the error field set when the target is unknown.
async fn forward(state: &Arc<RelayState>, sender: &RegisteredPeer, msg: PeerConnectionMsg) {
    let target = state.registry.lock().lookup_uuid(msg.peer_uuid);
    match target {
        Some(peer) => {
            tracing::debug!(
                from = %sender.uuid,
                to = %msg.peer_uuid,
                "forwarding peer-connection message"
            );
            // The target disconnecting mid-forward is not an error.
            if peer
                .tx
                .try_send(Outbound::Frame(SignalMessage::PeerConnection(msg)))
                .is_err()
            {
                tracing::warn!(to = %peer.uuid, "forward failed, target is going away");
            }
        }
        None => {
            tracing::warn!(
                from = %sender.uuid,
                to = %msg.peer_uuid,
                "peer-connection message to unknown peer"
            );
            reply(
                &sender.tx,
                SignalMessage::PeerConnection(PeerConnectionMsg {
                    source_uuid: sender.uuid,
                    source_name: sender.name.clone(),
                    peer_uuid: msg.peer_uuid,
                    description: None,
                    error: Some(format!("peer {} is unknown", msg.peer_uuid)),
                }),
            );
        }
    }
}

/// Queue a frame on a session's outbound channel. The session loop is
/// both producer and consumer of its own channel, so this must never
/// block.
fn reply(tx: &mpsc::Sender<Outbound>, msg: SignalMessage) {
    if tx.try_send(Outbound::Frame(msg)).is_err() {
        tracing::warn!("outbound queue full, dropping frame");
    }
}

async fn send_signal(socket: &mut WebSocket, msg: &SignalMessage) -> Result<(), axum::Error> {
    match proto::encode_signal(msg) {
        Ok(text) => socket.send(Message::Text(text.into())).await,
        Err(e) => {
            tracing::error!("failed to encode signaling message: {e}");
            Ok(())
        }
    }
}

// ── Server bootstrap ───────────────────────────────────────────────────

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Build the relay router.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new().route("/", get(ws_upgrade)).with_state(state)
}

/// Bind `addr` and serve the relay, returning the bound address and the
/// server task handle. The primary entry point for both the binary and
/// tests.
pub async fn start(addr: &str) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    start_with_state(addr, Arc::new(RelayState::new())).await
}

/// As [`start`], with a caller-provided state.
pub async fn start_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    let app = router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("relay server error: {e}");
        }
    });
    Ok((bound, handle))
}
