//! Client connection to a signaling relay.
//!
//! Registration is the first frame of a session; after it the relay
//! exchanges [`SignalMessage::PeerConnection`] frames freely. The feed
//! of inbound messages is finite: it ends when the transport closes and
//! is not restartable. A failed registration is fatal to the handle;
//! callers retry by connecting again.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::config::local_hostname;
use crate::error::FabricError;
use crate::proto::{self, SignalMessage};

/// Default time to wait on relay connection and registration.
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// An established, registered session with a signaling relay.
pub struct RelayConnection {
    /// Identity accepted by the relay (server-minted when none was
    /// supplied to [`connect`]).
    pub uuid: Uuid,
    /// Name this client registered under.
    pub name: String,
    sender: mpsc::Sender<SignalMessage>,
    receiver: mpsc::Receiver<SignalMessage>,
}

impl RelayConnection {
    /// Clone of the outbound sender, for tasks that only transmit.
    pub fn sender(&self) -> mpsc::Sender<SignalMessage> {
        self.sender.clone()
    }

    /// Queue a message for the relay.
    pub async fn send(&self, msg: SignalMessage) -> Result<(), FabricError> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| FabricError::Channel("signaling connection closed".to_string()))
    }

    /// Next inbound message. `None` once the transport has closed.
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        self.receiver.recv().await
    }

    /// Split into the outbound sender and the inbound feed.
    pub fn split(self) -> (mpsc::Sender<SignalMessage>, mpsc::Receiver<SignalMessage>) {
        (self.sender, self.receiver)
    }
}

/// Connect to a signaling relay at `address` (`host:port`) and register.
///
/// A `None` uuid asks the relay to mint one; a `None` name defaults to
/// the local hostname. Fails with [`FabricError::Registration`] when the
/// transport closes before the response, no response arrives within
/// `timeout`, or the response is not a successful registration ack.
pub async fn connect(
    address: &str,
    uuid: Option<Uuid>,
    name: Option<String>,
    timeout: Duration,
) -> Result<RelayConnection, FabricError> {
    let name = name.unwrap_or_else(local_hostname);
    let url = format!("ws://{address}");

    let (ws, _response) = tokio::time::timeout(timeout, connect_async(&url))
        .await
        .map_err(|_| {
            FabricError::Registration(format!(
                "signaling relay at {address} did not accept the connection within {timeout:?}"
            ))
        })?
        .map_err(|e| {
            FabricError::Registration(format!("connection to signaling relay failed: {e}"))
        })?;
    let (mut sink, mut stream) = ws.split();

    let register = SignalMessage::Register {
        uuid,
        name: name.clone(),
    };
    sink.send(WsMessage::Text(proto::encode_signal(&register)?))
        .await
        .map_err(|e| {
            FabricError::Registration(format!("failed to send registration request: {e}"))
        })?;

    let ack = tokio::time::timeout(timeout, next_signal(&mut stream))
        .await
        .map_err(|_| {
            FabricError::Registration(
                "signaling relay did not reply to registration within the timeout".to_string(),
            )
        })??;

    let uuid = match ack {
        SignalMessage::RegisterAck { uuid, error: None } => uuid,
        SignalMessage::RegisterAck {
            error: Some(error), ..
        } => {
            return Err(FabricError::Registration(format!(
                "signaling relay refused registration: {error}"
            )));
        }
        other => {
            return Err(FabricError::Registration(format!(
                "signaling relay replied with an unexpected message: {other:?}"
            )));
        }
    };
    tracing::info!(%uuid, name, relay = %address, "registered with signaling relay");

    let (out_tx, mut out_rx) = mpsc::channel::<SignalMessage>(64);
    let (in_tx, in_rx) = mpsc::channel::<SignalMessage>(256);

    // Writer: drain the outbound queue onto the socket.
    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match proto::encode_signal(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("failed to encode signaling message: {e}");
                    continue;
                }
            };
            if let Err(e) = sink.send(WsMessage::Text(text)).await {
                tracing::warn!("signaling write failed: {e}");
                break;
            }
        }
    });

    // Reader: decode frames into the inbound feed. Dropping `in_tx`
    // ends the feed, which is how callers observe the session closing.
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(WsMessage::Text(text)) => {
                    forward_decoded(text.as_bytes(), &in_tx).await;
                }
                Ok(WsMessage::Binary(data)) => {
                    forward_decoded(&data, &in_tx).await;
                }
                Ok(WsMessage::Close(frame)) => {
                    tracing::info!(?frame, "signaling relay closed the session");
                    break;
                }
                Ok(_) => {} // ping/pong
                Err(e) => {
                    tracing::warn!("signaling read failed: {e}");
                    break;
                }
            }
        }
    });

    Ok(RelayConnection {
        uuid,
        name,
        sender: out_tx,
        receiver: in_rx,
    })
}

/// Read frames until one decodes as a signaling message.
async fn next_signal<S>(stream: &mut S) -> Result<SignalMessage, FabricError>
where
    S: StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let undecodable = |e: FabricError| {
        FabricError::Registration(format!("undecodable registration response: {e}"))
    };
    while let Some(item) = stream.next().await {
        match item {
            Ok(WsMessage::Text(text)) => {
                return proto::decode_signal(text.as_bytes()).map_err(undecodable);
            }
            Ok(WsMessage::Binary(data)) => {
                return proto::decode_signal(&data).map_err(undecodable);
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(FabricError::Registration(format!(
                    "signaling connection failed before registration completed: {e}"
                )));
            }
        }
    }
    Err(FabricError::Registration(
        "signaling connection closed before registration completed".to_string(),
    ))
}

async fn forward_decoded(bytes: &[u8], in_tx: &mpsc::Sender<SignalMessage>) {
    match proto::decode_signal(bytes) {
        // A full feed means the consumer is wedged; drop rather than
        // stall the socket reader.
        Ok(msg) => {
            if in_tx.try_send(msg).is_err() {
                tracing::warn!("inbound signaling queue full, dropping message");
            }
        }
        Err(e) => {
            tracing::warn!("skipping undecodable signaling frame: {e}");
        }
    }
}
