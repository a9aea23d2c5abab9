//! Relay acceptance tests: registration, routing, and session protocol
//! edges, driven through the SDK signaling client and a raw WebSocket
//! for the protocol-violation cases.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use freight_sdk::proto::{self, PeerConnectionMsg, SignalMessage};
use freight_sdk::relay_client;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn start_relay() -> SocketAddr {
    let (addr, _handle) = freight_relay::server::start("127.0.0.1:0")
        .await
        .expect("failed to start relay");
    addr
}

type RawWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn raw_connect(addr: SocketAddr) -> RawWs {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("websocket connect failed");
    ws
}

async fn raw_send(ws: &mut RawWs, msg: &SignalMessage) {
    ws.send(WsMessage::Text(proto::encode_signal(msg).unwrap()))
        .await
        .unwrap();
}

async fn raw_recv(ws: &mut RawWs) -> SignalMessage {
    loop {
        let item = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match item {
            WsMessage::Text(text) => return proto::decode_signal(text.as_bytes()).unwrap(),
            WsMessage::Binary(data) => return proto::decode_signal(&data).unwrap(),
            WsMessage::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => continue,
        }
    }
}

fn connection_msg(
    from: &relay_client::RelayConnection,
    to: Uuid,
    description: Option<&str>,
) -> SignalMessage {
    SignalMessage::PeerConnection(PeerConnectionMsg {
        source_uuid: from.uuid,
        source_name: from.name.clone(),
        peer_uuid: to,
        description: description.map(str::to_string),
        error: None,
    })
}

#[tokio::test]
async fn registration_mints_distinct_identities() {
    let addr = start_relay().await;
    let a = relay_client::connect(&addr.to_string(), None, Some("a".into()), TIMEOUT)
        .await
        .unwrap();
    let b = relay_client::connect(&addr.to_string(), None, Some("b".into()), TIMEOUT)
        .await
        .unwrap();
    assert_ne!(a.uuid, b.uuid);
}

#[tokio::test]
async fn registration_echoes_provided_identity() {
    let addr = start_relay().await;
    let uuid = Uuid::new_v4();
    let conn = relay_client::connect(&addr.to_string(), Some(uuid), None, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(conn.uuid, uuid);
}

#[tokio::test]
async fn message_before_registration_is_rejected() {
    let addr = start_relay().await;
    let mut ws = raw_connect(addr).await;

    raw_send(
        &mut ws,
        &SignalMessage::PeerConnection(PeerConnectionMsg {
            source_uuid: Uuid::new_v4(),
            source_name: "early".to_string(),
            peer_uuid: Uuid::new_v4(),
            description: None,
            error: None,
        }),
    )
    .await;

    match raw_recv(&mut ws).await {
        SignalMessage::ServerError { message } => {
            assert_eq!(message, "client has not registered yet");
        }
        other => panic!("expected ServerError, got {other:?}"),
    }

    // No registry entry was created; the session can still register.
    raw_send(
        &mut ws,
        &SignalMessage::Register {
            uuid: None,
            name: "early".to_string(),
        },
    )
    .await;
    assert!(matches!(
        raw_recv(&mut ws).await,
        SignalMessage::RegisterAck { error: None, .. }
    ));
}

#[tokio::test]
async fn unknown_request_type_is_rejected() {
    let addr = start_relay().await;
    let mut ws = raw_connect(addr).await;

    raw_send(
        &mut ws,
        &SignalMessage::Register {
            uuid: None,
            name: "client".to_string(),
        },
    )
    .await;
    let _ack = raw_recv(&mut ws).await;

    // A registration ack is a server-to-client message; sending one
    // upstream is a protocol violation.
    raw_send(
        &mut ws,
        &SignalMessage::RegisterAck {
            uuid: Uuid::new_v4(),
            error: None,
        },
    )
    .await;

    match raw_recv(&mut ws).await {
        SignalMessage::ServerError { message } => {
            assert_eq!(message, "unknown request type");
        }
        other => panic!("expected ServerError, got {other:?}"),
    }
}

#[tokio::test]
async fn peer_connection_is_forwarded_verbatim() {
    let addr = start_relay().await;
    let a = relay_client::connect(&addr.to_string(), None, Some("a".into()), TIMEOUT)
        .await
        .unwrap();
    let mut b = relay_client::connect(&addr.to_string(), None, Some("b".into()), TIMEOUT)
        .await
        .unwrap();

    a.send(connection_msg(&a, b.uuid, Some("offer-blob")))
        .await
        .unwrap();

    let received = tokio::time::timeout(TIMEOUT, b.recv())
        .await
        .expect("timed out")
        .expect("feed ended");
    match received {
        SignalMessage::PeerConnection(msg) => {
            assert_eq!(msg.source_uuid, a.uuid);
            assert_eq!(msg.peer_uuid, b.uuid);
            assert_eq!(msg.description.as_deref(), Some("offer-blob"));
            assert!(msg.error.is_none());
        }
        other => panic!("expected PeerConnection, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_peer_is_bounced_with_error() {
    let addr = start_relay().await;
    let mut a = relay_client::connect(&addr.to_string(), None, Some("a".into()), TIMEOUT)
        .await
        .unwrap();

    let ghost = Uuid::new_v4();
    a.send(connection_msg(&a, ghost, Some("offer-blob")))
        .await
        .unwrap();

    let received = tokio::time::timeout(TIMEOUT, a.recv())
        .await
        .expect("timed out")
        .expect("feed ended");
    match received {
        SignalMessage::PeerConnection(msg) => {
            assert_eq!(msg.peer_uuid, ghost);
            assert!(msg.description.is_none());
            assert!(msg.error.expect("error field").contains("unknown"));
        }
        other => panic!("expected PeerConnection bounce, got {other:?}"),
    }
}

#[tokio::test]
async fn reconnect_displaces_previous_transport() {
    let addr = start_relay().await;
    let uuid = Uuid::new_v4();

    let mut first = relay_client::connect(&addr.to_string(), Some(uuid), Some("w".into()), TIMEOUT)
        .await
        .unwrap();
    let second = relay_client::connect(&addr.to_string(), Some(uuid), Some("w".into()), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(second.uuid, uuid);

    // The old transport is closed by the relay; its feed ends.
    let ended = tokio::time::timeout(TIMEOUT, first.recv())
        .await
        .expect("old feed did not end");
    assert!(ended.is_none(), "old transport should have been closed");

    // The new transport is live: it can reach a third client.
    let mut third = relay_client::connect(&addr.to_string(), None, Some("t".into()), TIMEOUT)
        .await
        .unwrap();
    second
        .send(connection_msg(&second, third.uuid, Some("hello")))
        .await
        .unwrap();
    let received = tokio::time::timeout(TIMEOUT, third.recv())
        .await
        .expect("timed out")
        .expect("feed ended");
    assert!(matches!(received, SignalMessage::PeerConnection(_)));
}
