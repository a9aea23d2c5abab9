//! Peer-connection manager.
//!
//! Owns every peer-connection record and presents two operations to the
//! request layer: send a request to a peer and await the correlated
//! reply, or close a peer. All record state lives in a single event-loop
//! task; channel I/O, timers, and the signaling feed communicate with it
//! through one mpsc, so state transitions run to completion between
//! suspension points.
//!
//! # Channel establishment
//!
//! Channels are TCP streams brokered through the signaling relay. The
//! offerer sends an offer descriptor naming its peer listener; the
//! answerer replies with a descriptor naming its own; the offerer then
//! dials the answerer and binds the stream with a hello frame.
//!
//! Two endpoints may offer to each other simultaneously and the offers
//! cross on the wire. Deterministic rule, needing no further
//! coordination: the lower identity's offer wins; the higher identity
//! discards its own offer and answers instead.
//!
//! # Multiplexing
//!
//! Each open channel carries concurrent requests paired by correlation
//! id, monotonic within the record. Every request installs a one-shot
//! completion slot; replies complete the slot, expiry completes it with
//! a timeout (the channel stays up), and replies without a slot are
//! dropped with a warning. Outbound writes are serialised by a single
//! writer task per channel behind a bounded queue; a full queue fails
//! the request fast instead of blocking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use freight_sdk::error::FabricError;
use freight_sdk::proto::{
    self, ChannelDescriptor, Frame, PeerConnectionMsg, ReplyStatus, RequestKind, SignalMessage,
};

/// Tunables for the peer fabric.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Deadline for a full offer/answer/dial handshake.
    pub handshake_timeout: Duration,
    /// Deadline for the TCP dial inside the handshake.
    pub connect_timeout: Duration,
    /// Outbound frames buffered per channel before `send` fails with
    /// backpressure.
    pub outbound_queue: usize,
    /// Times a closed record may be revived by a local send before
    /// sends fail outright.
    pub max_reconnects: u32,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            outbound_queue: 64,
            max_reconnects: 3,
        }
    }
}

/// Handler for requests arriving from peers, run against the local
/// store on the blocking pool.
pub trait LocalHandler: Send + Sync + 'static {
    fn handle(&self, kind: RequestKind, object_id: String, payload: Vec<u8>)
    -> (ReplyStatus, Vec<u8>);
}

type ReplySlot = oneshot::Sender<Result<(ReplyStatus, Vec<u8>), FabricError>>;

enum Event {
    Send {
        peer: Uuid,
        kind: RequestKind,
        object_id: String,
        payload: Vec<u8>,
        slot: ReplySlot,
        timeout: Duration,
    },
    Close {
        peer: Uuid,
        done: oneshot::Sender<()>,
    },
    Signal(SignalMessage),
    /// Inbound TCP stream whose hello frame named `peer`.
    Accepted {
        peer: Uuid,
        stream: TcpStream,
    },
    /// Outcome of dialing the answerer.
    Dialed {
        peer: Uuid,
        generation: u64,
        result: Result<TcpStream, String>,
    },
    Inbound {
        peer: Uuid,
        generation: u64,
        frame: Frame,
    },
    ChannelClosed {
        peer: Uuid,
        generation: u64,
        reason: String,
    },
    HandshakeExpired {
        peer: Uuid,
        generation: u64,
    },
    RequestExpired {
        peer: Uuid,
        correlation_id: u64,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<PeerSnapshot>>,
    },
}

/// Diagnostic view of one peer record.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub peer: Uuid,
    pub state: &'static str,
    pub pending: usize,
}

enum PeerState {
    Offering,
    Answering,
    Open { writer: mpsc::Sender<Frame> },
    Closed,
}

impl PeerState {
    fn name(&self) -> &'static str {
        match self {
            PeerState::Offering => "offering",
            PeerState::Answering => "answering",
            PeerState::Open { .. } => "open",
            PeerState::Closed => "closed",
        }
    }
}

/// Per-peer connection record. Created lazily on first outgoing request
/// or first inbound offer; retained through CLOSED so a later send can
/// revive it under the reconnect bound.
struct PeerRecord {
    state: PeerState,
    pending: HashMap<u64, ReplySlot>,
    /// Requests accepted while the handshake is in flight, drained in
    /// order once the channel opens.
    queued: Vec<Frame>,
    next_correlation: u64,
    /// Guards stale timer, dial, and channel events after the record
    /// has moved on to a newer handshake.
    generation: u64,
    connect_attempts: u32,
}

impl Default for PeerRecord {
    fn default() -> Self {
        Self {
            state: PeerState::Closed,
            pending: HashMap::new(),
            queued: Vec::new(),
            next_correlation: 0,
            generation: 0,
            connect_attempts: 0,
        }
    }
}

fn fail_pending(rec: &mut PeerRecord, make_err: impl Fn() -> FabricError) {
    for (_, slot) in rec.pending.drain() {
        let _ = slot.send(Err(make_err()));
    }
    rec.queued.clear();
}

fn frame_correlation(frame: &Frame) -> u64 {
    match frame {
        Frame::Request { correlation_id, .. } | Frame::Reply { correlation_id, .. } => {
            *correlation_id
        }
        Frame::Hello { .. } => 0,
    }
}

/// Transmit a request frame on an open channel, failing its slot fast
/// when the outbound queue is saturated.
fn transmit(rec: &mut PeerRecord, peer: Uuid, frame: Frame) {
    let writer = match &rec.state {
        PeerState::Open { writer } => writer.clone(),
        _ => return,
    };
    let correlation_id = frame_correlation(&frame);
    match writer.try_send(frame) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(peer = %peer, "outbound queue full, failing request");
            if let Some(slot) = rec.pending.remove(&correlation_id) {
                let _ = slot.send(Err(FabricError::Backpressure(peer)));
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            if let Some(slot) = rec.pending.remove(&correlation_id) {
                let _ = slot.send(Err(FabricError::Channel(
                    "peer channel is closing".to_string(),
                )));
            }
        }
    }
}

/// Handle to the peer-connection manager.
#[derive(Clone)]
pub struct PeerManager {
    events: mpsc::Sender<Event>,
}

impl PeerManager {
    /// Spawn the manager and its listener/signaling pumps.
    ///
    /// `advertised_addr` is the `host:port` other endpoints dial to
    /// reach `listener`. Signaling traffic flows out through
    /// `signal_tx` and in through `signal_rx`.
    pub fn start(
        local_uuid: Uuid,
        local_name: String,
        advertised_addr: String,
        listener: TcpListener,
        signal_tx: mpsc::Sender<SignalMessage>,
        mut signal_rx: mpsc::Receiver<SignalMessage>,
        handler: Arc<dyn LocalHandler>,
        options: PeerOptions,
    ) -> PeerManager {
        let (events_tx, events_rx) = mpsc::channel(1024);

        let tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = signal_rx.recv().await {
                if tx.send(Event::Signal(msg)).await.is_err() {
                    return;
                }
            }
        });

        let tx = events_tx.clone();
        let hello_timeout = options.handshake_timeout;
        tokio::spawn(accept_loop(listener, tx, hello_timeout));

        let task = ManagerTask {
            local_uuid,
            local_name,
            advertised_addr,
            signal_tx,
            events_tx: events_tx.clone(),
            handler,
            options,
            peers: HashMap::new(),
            generation: 0,
        };
        tokio::spawn(task.run(events_rx));

        PeerManager { events: events_tx }
    }

    /// Send a request to `peer` and await the correlated reply.
    ///
    /// Expiry of `timeout` fails this request only; the channel (or the
    /// handshake bringing it up) is left alone. Dropping the returned
    /// future abandons the completion slot, and any late reply is
    /// dropped with a warning.
    pub async fn send(
        &self,
        peer: Uuid,
        kind: RequestKind,
        object_id: String,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<(ReplyStatus, Vec<u8>), FabricError> {
        let (slot, rx) = oneshot::channel();
        self.events
            .send(Event::Send {
                peer,
                kind,
                object_id,
                payload,
                slot,
                timeout,
            })
            .await
            .map_err(|_| FabricError::Channel("peer manager is not running".to_string()))?;
        rx.await
            .map_err(|_| FabricError::Channel("peer manager dropped the request".to_string()))?
    }

    /// Tear down the record for `peer`, failing anything in flight.
    pub async fn close(&self, peer: Uuid) {
        let (done, rx) = oneshot::channel();
        if self.events.send(Event::Close { peer, done }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Diagnostic snapshot of all records.
    pub async fn peer_states(&self) -> Vec<PeerSnapshot> {
        let (reply, rx) = oneshot::channel();
        if self.events.send(Event::Snapshot { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Peers with an open channel right now.
    pub async fn connected_peers(&self) -> Vec<Uuid> {
        self.peer_states()
            .await
            .into_iter()
            .filter(|s| s.state == "open")
            .map(|s| s.peer)
            .collect()
    }
}

/// Accept inbound peer channels: each must open with a hello frame
/// binding the stream to a peer identity.
async fn accept_loop(
    listener: TcpListener,
    events: mpsc::Sender<Event>,
    hello_timeout: Duration,
) {
    loop {
        match listener.accept().await {
            Ok((mut stream, remote)) => {
                let events = events.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(hello_timeout, proto::read_frame(&mut stream)).await
                    {
                        Ok(Ok(Frame::Hello { uuid })) => {
                            let _ = events.send(Event::Accepted { peer: uuid, stream }).await;
                        }
                        Ok(Ok(_)) => {
                            tracing::warn!(%remote, "peer stream did not open with a hello frame");
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(%remote, "failed to read hello frame: {e}");
                        }
                        Err(_) => {
                            tracing::warn!(%remote, "timed out waiting for hello frame");
                        }
                    }
                });
            }
            Err(e) => {
                tracing::error!("peer listener accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn dial(addr: String, local_uuid: Uuid, timeout: Duration) -> Result<TcpStream, String> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| format!("connect to {addr} timed out"))?
        .map_err(|e| format!("connect to {addr} failed: {e}"))?;
    proto::write_frame(&mut stream, &Frame::Hello { uuid: local_uuid })
        .await
        .map_err(|e| e.to_string())?;
    Ok(stream)
}

enum OfferAction {
    AnswerFresh,
    AnswerAgain,
    OursWins,
    Yield,
    Renegotiate,
}

struct ManagerTask {
    local_uuid: Uuid,
    local_name: String,
    advertised_addr: String,
    signal_tx: mpsc::Sender<SignalMessage>,
    events_tx: mpsc::Sender<Event>,
    handler: Arc<dyn LocalHandler>,
    options: PeerOptions,
    peers: HashMap<Uuid, PeerRecord>,
    generation: u64,
}

impl ManagerTask {
    async fn run(mut self, mut events_rx: mpsc::Receiver<Event>) {
        while let Some(event) = events_rx.recv().await {
            self.handle(event);
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Send {
                peer,
                kind,
                object_id,
                payload,
                slot,
                timeout,
            } => self.on_send(peer, kind, object_id, payload, slot, timeout),
            Event::Close { peer, done } => {
                self.on_close(peer);
                let _ = done.send(());
            }
            Event::Signal(msg) => self.on_signal(msg),
            Event::Accepted { peer, stream } => self.on_accepted(peer, stream),
            Event::Dialed {
                peer,
                generation,
                result,
            } => self.on_dialed(peer, generation, result),
            Event::Inbound {
                peer,
                generation,
                frame,
            } => self.on_inbound(peer, generation, frame),
            Event::ChannelClosed {
                peer,
                generation,
                reason,
            } => self.on_channel_closed(peer, generation, reason),
            Event::HandshakeExpired { peer, generation } => {
                self.on_handshake_expired(peer, generation)
            }
            Event::RequestExpired {
                peer,
                correlation_id,
            } => self.on_request_expired(peer, correlation_id),
            Event::Snapshot { reply } => {
                let snapshot = self
                    .peers
                    .iter()
                    .map(|(peer, rec)| PeerSnapshot {
                        peer: *peer,
                        state: rec.state.name(),
                        pending: rec.pending.len(),
                    })
                    .collect();
                let _ = reply.send(snapshot);
            }
        }
    }

    // ── Outgoing requests ──────────────────────────────────────────

    fn on_send(
        &mut self,
        peer: Uuid,
        kind: RequestKind,
        object_id: String,
        payload: Vec<u8>,
        slot: ReplySlot,
        timeout: Duration,
    ) {
        let rec = self.peers.entry(peer).or_default();
        let correlation_id = rec.next_correlation;
        rec.next_correlation += 1;
        rec.pending.insert(correlation_id, slot);
        let frame = Frame::Request {
            correlation_id,
            kind,
            object_id,
            payload,
        };

        match &rec.state {
            PeerState::Open { .. } => transmit(rec, peer, frame),
            PeerState::Offering | PeerState::Answering => rec.queued.push(frame),
            PeerState::Closed => {
                if rec.connect_attempts > self.options.max_reconnects {
                    if let Some(slot) = rec.pending.remove(&correlation_id) {
                        let _ = slot.send(Err(FabricError::Channel(format!(
                            "reconnect bound ({}) exceeded",
                            self.options.max_reconnects
                        ))));
                    }
                    return;
                }
                rec.queued.push(frame);
                self.begin_offer(peer);
            }
        }
        self.arm_request_timer(peer, correlation_id, timeout);
    }

    fn on_close(&mut self, peer: Uuid) {
        if let Some(mut rec) = self.peers.remove(&peer) {
            fail_pending(&mut rec, || {
                FabricError::Channel("channel closed by the local endpoint".to_string())
            });
            // Dropping the record drops the writer; the channel tasks
            // wind down on their own.
            tracing::info!(peer = %peer, "peer record closed");
        }
    }

    // ── Signaling ──────────────────────────────────────────────────

    fn on_signal(&mut self, msg: SignalMessage) {
        let SignalMessage::PeerConnection(msg) = msg else {
            tracing::debug!("ignoring non-connection signaling message");
            return;
        };
        if let Some(error) = msg.error {
            // Relay bounce: the peer named in peer_uuid is unknown.
            let peer = msg.peer_uuid;
            tracing::warn!(peer = %peer, "signaling relay reported: {error}");
            if let Some(rec) = self.peers.get_mut(&peer) {
                if matches!(rec.state, PeerState::Offering | PeerState::Answering) {
                    fail_pending(rec, || FabricError::PeerUnknown(peer));
                    rec.state = PeerState::Closed;
                }
            }
            return;
        }
        let Some(description) = msg.description else {
            tracing::debug!(peer = %msg.source_uuid, "connection message without description");
            return;
        };
        let descriptor = match ChannelDescriptor::decode(&description) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::warn!(peer = %msg.source_uuid, "dropping bad descriptor: {e}");
                return;
            }
        };
        match descriptor {
            ChannelDescriptor::Offer { .. } => self.on_offer(msg.source_uuid),
            ChannelDescriptor::Answer { addr } => self.on_answer(msg.source_uuid, addr),
        }
    }

    fn on_offer(&mut self, peer: Uuid) {
        let action = match self.peers.get(&peer).map(|rec| &rec.state) {
            None | Some(PeerState::Closed) => OfferAction::AnswerFresh,
            Some(PeerState::Answering) => OfferAction::AnswerAgain,
            Some(PeerState::Offering) => {
                if self.local_uuid < peer {
                    OfferAction::OursWins
                } else {
                    OfferAction::Yield
                }
            }
            Some(PeerState::Open { .. }) => OfferAction::Renegotiate,
        };
        match action {
            OfferAction::AnswerFresh => {
                self.peers.entry(peer).or_default();
                self.begin_answer(peer, true);
            }
            OfferAction::AnswerAgain => {
                tracing::debug!(peer = %peer, "duplicate offer, answering again");
                self.send_descriptor(
                    peer,
                    ChannelDescriptor::Answer {
                        addr: self.advertised_addr.clone(),
                    },
                );
            }
            OfferAction::OursWins => {
                tracing::debug!(peer = %peer, "crossed offers, ours wins");
            }
            OfferAction::Yield => {
                tracing::info!(peer = %peer, "crossed offers, yielding to the lower identity");
                // Keep the generation: the handshake deadline armed for
                // our offer still bounds this exchange.
                self.begin_answer(peer, false);
            }
            OfferAction::Renegotiate => {
                tracing::info!(peer = %peer, "peer re-offered over an open channel, renegotiating");
                if let Some(rec) = self.peers.get_mut(&peer) {
                    fail_pending(rec, || {
                        FabricError::Channel("peer renegotiated the channel".to_string())
                    });
                    rec.state = PeerState::Closed;
                }
                self.begin_answer(peer, true);
            }
        }
    }

    fn on_answer(&mut self, peer: Uuid, addr: String) {
        let Some(rec) = self.peers.get_mut(&peer) else {
            tracing::warn!(peer = %peer, "answer for an unknown peer, dropping");
            return;
        };
        if !matches!(rec.state, PeerState::Offering) {
            tracing::warn!(peer = %peer, state = rec.state.name(), "unexpected answer, dropping");
            return;
        }
        let generation = rec.generation;
        let addr = match proto::descriptor_addr(&addr) {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!(peer = %peer, "answer carried a bad address: {e}");
                return;
            }
        };
        let events = self.events_tx.clone();
        let local_uuid = self.local_uuid;
        let connect_timeout = self.options.connect_timeout;
        tokio::spawn(async move {
            let result = dial(addr, local_uuid, connect_timeout).await;
            let _ = events
                .send(Event::Dialed {
                    peer,
                    generation,
                    result,
                })
                .await;
        });
    }

    // ── Handshake progress ─────────────────────────────────────────

    fn begin_offer(&mut self, peer: Uuid) {
        let generation = self.next_generation();
        let Some(rec) = self.peers.get_mut(&peer) else {
            return;
        };
        rec.state = PeerState::Offering;
        rec.generation = generation;
        rec.connect_attempts += 1;
        tracing::info!(peer = %peer, attempt = rec.connect_attempts, "offering peer channel");
        self.send_descriptor(
            peer,
            ChannelDescriptor::Offer {
                addr: self.advertised_addr.clone(),
            },
        );
        self.arm_handshake_timer(peer, generation);
    }

    fn begin_answer(&mut self, peer: Uuid, new_generation: bool) {
        let generation = if new_generation {
            self.next_generation()
        } else {
            match self.peers.get(&peer) {
                Some(rec) => rec.generation,
                None => return,
            }
        };
        let Some(rec) = self.peers.get_mut(&peer) else {
            return;
        };
        rec.state = PeerState::Answering;
        rec.generation = generation;
        tracing::info!(peer = %peer, "answering peer offer");
        self.send_descriptor(
            peer,
            ChannelDescriptor::Answer {
                addr: self.advertised_addr.clone(),
            },
        );
        if new_generation {
            self.arm_handshake_timer(peer, generation);
        }
    }

    fn on_dialed(&mut self, peer: Uuid, generation: u64, result: Result<TcpStream, String>) {
        let current = self
            .peers
            .get(&peer)
            .filter(|rec| rec.generation == generation && matches!(rec.state, PeerState::Offering));
        if current.is_none() {
            tracing::debug!(peer = %peer, "stale dial result, dropping");
            return;
        }
        match result {
            Ok(stream) => self.open_channel(peer, stream),
            Err(reason) => {
                tracing::warn!(peer = %peer, "dial failed: {reason}");
                if let Some(rec) = self.peers.get_mut(&peer) {
                    fail_pending(rec, || FabricError::Channel(reason.clone()));
                    rec.state = PeerState::Closed;
                }
            }
        }
    }

    fn on_accepted(&mut self, peer: Uuid, stream: TcpStream) {
        match self.peers.get(&peer).map(|rec| &rec.state) {
            Some(PeerState::Answering) => self.open_channel(peer, stream),
            other => {
                tracing::warn!(
                    peer = %peer,
                    state = other.map(PeerState::name).unwrap_or("absent"),
                    "unsolicited peer channel, dropping"
                );
            }
        }
    }

    fn open_channel(&mut self, peer: Uuid, stream: TcpStream) {
        let (write_tx, write_rx) = mpsc::channel(self.options.outbound_queue);
        let (generation, queued) = {
            let Some(rec) = self.peers.get_mut(&peer) else {
                return;
            };
            rec.state = PeerState::Open { writer: write_tx };
            rec.connect_attempts = 0;
            (rec.generation, std::mem::take(&mut rec.queued))
        };
        self.spawn_channel_tasks(peer, generation, stream, write_rx);
        tracing::info!(peer = %peer, queued = queued.len(), "peer channel open");

        if let Some(rec) = self.peers.get_mut(&peer) {
            for frame in queued {
                transmit(rec, peer, frame);
            }
        }
    }

    fn on_handshake_expired(&mut self, peer: Uuid, generation: u64) {
        let Some(rec) = self.peers.get_mut(&peer) else {
            return;
        };
        if rec.generation != generation
            || !matches!(rec.state, PeerState::Offering | PeerState::Answering)
        {
            return;
        }
        tracing::warn!(peer = %peer, "peer handshake timed out");
        fail_pending(rec, || FabricError::Timeout("peer handshake"));
        rec.state = PeerState::Closed;
    }

    // ── Open-channel traffic ───────────────────────────────────────

    fn on_inbound(&mut self, peer: Uuid, generation: u64, frame: Frame) {
        let Some(rec) = self.peers.get_mut(&peer) else {
            tracing::warn!(peer = %peer, "frame from a peer without a record, dropping");
            return;
        };
        if rec.generation != generation {
            tracing::debug!(peer = %peer, "frame from a stale channel, dropping");
            return;
        }
        match frame {
            Frame::Reply {
                correlation_id,
                status,
                payload,
            } => match rec.pending.remove(&correlation_id) {
                Some(slot) => {
                    if slot.send(Ok((status, payload))).is_err() {
                        tracing::debug!(
                            peer = %peer,
                            correlation_id,
                            "reply for a cancelled request dropped"
                        );
                    }
                }
                None => {
                    tracing::warn!(
                        peer = %peer,
                        correlation_id,
                        "reply with no pending request dropped (likely timed out)"
                    );
                }
            },
            Frame::Request {
                correlation_id,
                kind,
                object_id,
                payload,
            } => {
                let writer = match &rec.state {
                    PeerState::Open { writer } => writer.clone(),
                    _ => {
                        tracing::warn!(peer = %peer, "request on a non-open channel, dropping");
                        return;
                    }
                };
                let handler = Arc::clone(&self.handler);
                tokio::spawn(async move {
                    let (status, payload) = match tokio::task::spawn_blocking(move || {
                        handler.handle(kind, object_id, payload)
                    })
                    .await
                    {
                        Ok(reply) => reply,
                        Err(e) => (
                            ReplyStatus::Error,
                            format!("request handler failed: {e}").into_bytes(),
                        ),
                    };
                    let reply = Frame::Reply {
                        correlation_id,
                        status,
                        payload,
                    };
                    if writer.send(reply).await.is_err() {
                        tracing::warn!(peer = %peer, "reply not transmitted, channel is closing");
                    }
                });
            }
            Frame::Hello { .. } => {
                tracing::warn!(peer = %peer, "unexpected hello on an open channel, dropping");
            }
        }
    }

    fn on_channel_closed(&mut self, peer: Uuid, generation: u64, reason: String) {
        let Some(rec) = self.peers.get_mut(&peer) else {
            return;
        };
        if rec.generation != generation || !matches!(rec.state, PeerState::Open { .. }) {
            return;
        }
        tracing::warn!(peer = %peer, "peer channel closed: {reason}");
        fail_pending(rec, || FabricError::Channel(reason.clone()));
        rec.state = PeerState::Closed;
    }

    fn on_request_expired(&mut self, peer: Uuid, correlation_id: u64) {
        let Some(rec) = self.peers.get_mut(&peer) else {
            return;
        };
        if let Some(slot) = rec.pending.remove(&correlation_id) {
            tracing::warn!(peer = %peer, correlation_id, "peer request timed out");
            let _ = slot.send(Err(FabricError::Timeout("peer reply")));
            rec.queued
                .retain(|frame| frame_correlation(frame) != correlation_id);
        }
    }

    // ── Plumbing ───────────────────────────────────────────────────

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn send_descriptor(&self, peer: Uuid, descriptor: ChannelDescriptor) {
        let description = match descriptor.encode() {
            Ok(description) => description,
            Err(e) => {
                tracing::error!(peer = %peer, "failed to encode descriptor: {e}");
                return;
            }
        };
        let msg = SignalMessage::PeerConnection(PeerConnectionMsg {
            source_uuid: self.local_uuid,
            source_name: self.local_name.clone(),
            peer_uuid: peer,
            description: Some(description),
            error: None,
        });
        if self.signal_tx.try_send(msg).is_err() {
            tracing::warn!(peer = %peer, "signaling unavailable; handshake will time out");
        }
    }

    fn arm_handshake_timer(&self, peer: Uuid, generation: u64) {
        let events = self.events_tx.clone();
        let deadline = self.options.handshake_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = events.send(Event::HandshakeExpired { peer, generation }).await;
        });
    }

    fn arm_request_timer(&self, peer: Uuid, correlation_id: u64, timeout: Duration) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events
                .send(Event::RequestExpired {
                    peer,
                    correlation_id,
                })
                .await;
        });
    }

    fn spawn_channel_tasks(
        &self,
        peer: Uuid,
        generation: u64,
        stream: TcpStream,
        mut write_rx: mpsc::Receiver<Frame>,
    ) {
        let (mut read_half, mut write_half) = stream.into_split();

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                match proto::read_frame(&mut read_half).await {
                    Ok(frame) => {
                        let inbound = Event::Inbound {
                            peer,
                            generation,
                            frame,
                        };
                        if events.send(inbound).await.is_err() {
                            return;
                        }
                    }
                    Err(FabricError::Serialization(e)) => {
                        tracing::warn!(peer = %peer, "dropping undecodable frame: {e}");
                    }
                    Err(e) => {
                        let _ = events
                            .send(Event::ChannelClosed {
                                peer,
                                generation,
                                reason: e.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
        });

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            while let Some(frame) = write_rx.recv().await {
                if let Err(e) = proto::write_frame(&mut write_half, &frame).await {
                    let _ = events
                        .send(Event::ChannelClosed {
                            peer,
                            generation,
                            reason: e.to_string(),
                        })
                        .await;
                    return;
                }
            }
            // Writer dropped by the manager: orderly local close.
            let _ = write_half.shutdown().await;
        });
    }
}
