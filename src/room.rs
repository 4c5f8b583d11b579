use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{RoomError, RpcError, TransportError};
use crate::id_types::{PeerId, RoomId};
use crate::metrics;
use crate::peer_manager::{Peer, PeerRegistry};
use crate::peer_session::PeerSession;
use crate::policy::PeerPolicy;
use crate::protocol::{
    decode_params, methods, CandidateParams, ConnectionOffer, ConnectionReply, ExistingPeer,
    JoinParams, JoinReply, PeerAnnouncement,
};
use crate::rpc::{handler, HandlerResult, RpcPeer};
use crate::transport::{Connector, EventReceiver, TransportEvent};
use crate::types::{EventSender, StateSender};

const EVENT_BUFFER: usize = 256;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RoomOptions {
    pub room_id: RoomId,
    /// Sent to the relay on join and to every peer we offer to.
    pub self_description: String,
    /// Bound on `request_connection` round trips.
    pub request_timeout: Duration,
    /// Bound on opening the transport and on the `join` call.
    pub join_timeout: Duration,
    /// How long an ICE candidate for an unknown peer waits for its registration.
    pub ice_candidate_wait: Duration,
}

impl RoomOptions {
    pub fn new(room_id: impl Into<RoomId>, self_description: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            self_description: self_description.into(),
            request_timeout: DEFAULT_TIMEOUT,
            join_timeout: DEFAULT_TIMEOUT,
            ice_candidate_wait: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_ice_candidate_wait(mut self, wait: Duration) -> Self {
        self.ice_candidate_wait = wait;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Disconnected,
    Joining,
    Joined,
    Leaving,
}

impl fmt::Display for RoomState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoomState::Disconnected => "disconnected",
            RoomState::Joining => "joining",
            RoomState::Joined => "joined",
            RoomState::Leaving => "leaving",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub enum RoomEvent {
    Joined {
        existing_peers: Vec<ExistingPeer>,
    },
    /// Negotiation finished and the peer is now in the registry.
    PeerConnected {
        peer_id: PeerId,
        is_initiator: bool,
    },
    PeerStateChanged {
        peer_id: PeerId,
        state: RTCPeerConnectionState,
    },
    PeerRemoved {
        peer_id: PeerId,
    },
    /// The remote answered our offer with a decline.
    PeerDeclined {
        peer_id: PeerId,
    },
    ConnectFailed {
        peer_id: PeerId,
        reason: String,
    },
    TransportLost {
        reason: String,
    },
    Left,
}

struct Link {
    rpc: Arc<RpcPeer>,
    generation: u64,
}

enum Ending {
    Failed(String),
    Closed,
}

/// Membership in one room: the signaling link, the negotiation flows and the
/// registry of connected peers.
///
/// Each leave, explicit or after transport loss, bumps the generation.
/// Negotiations capture the generation they started under and refuse to
/// register once it has moved on.
pub struct Room {
    options: RoomOptions,
    connector: Arc<dyn Connector>,
    policy: Arc<dyn PeerPolicy>,
    peers: Arc<PeerRegistry>,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    state: StateSender,
    events: EventSender,
}

impl Room {
    pub fn new(
        options: RoomOptions,
        connector: Arc<dyn Connector>,
        policy: Arc<dyn PeerPolicy>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(RoomState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            options,
            connector,
            policy,
            peers: Arc::new(PeerRegistry::new()),
            link: Mutex::new(None),
            generation: AtomicU64::new(0),
            state,
            events,
        })
    }

    pub fn options(&self) -> &RoomOptions {
        &self.options
    }

    /// Opens the signaling channel and joins the room, returning the peers
    /// already present. Those peers will offer to us; we do not offer to them.
    pub async fn join(self: &Arc<Self>) -> Result<Vec<ExistingPeer>, RoomError> {
        let entered = self.state.send_if_modified(|s| {
            if *s == RoomState::Disconnected {
                *s = RoomState::Joining;
                true
            } else {
                false
            }
        });
        if !entered {
            return Err(RoomError::AlreadyJoined);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        info!(room_id = %self.options.room_id, "Joining room");
        match self.connect_and_join(generation).await {
            Ok(existing_peers) => Ok(existing_peers),
            Err(e) => {
                warn!(room_id = %self.options.room_id, error = %e, "Join failed");
                self.shutdown(Some(generation)).await;
                Err(e)
            }
        }
    }

    async fn connect_and_join(
        self: &Arc<Self>,
        generation: u64,
    ) -> Result<Vec<ExistingPeer>, RoomError> {
        let (transport, events) = self.connector.connect().await?;
        let rpc = RpcPeer::new(transport);
        self.register_handlers(&rpc)?;

        let stored = {
            let mut link = self.link.lock();
            if self.generation.load(Ordering::SeqCst) == generation {
                *link = Some(Link {
                    rpc: rpc.clone(),
                    generation,
                });
                true
            } else {
                false
            }
        };
        if !stored {
            rpc.close().await;
            return Err(RoomError::JoinCancelled);
        }

        let (open_tx, open_rx) = oneshot::channel();
        tokio::spawn(pump(
            Arc::downgrade(self),
            rpc.clone(),
            events,
            generation,
            open_tx,
        ));

        match tokio::time::timeout(self.options.join_timeout, open_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(e.into()),
            Ok(Err(_)) => return Err(TransportError::Closed.into()),
            Err(_) => {
                return Err(RpcError::Timeout {
                    method: "open".into(),
                    after: self.options.join_timeout,
                }
                .into())
            }
        }
        debug!(room_id = %self.options.room_id, "Signaling channel open");

        let params = serde_json::to_value(JoinParams {
            room_id: self.options.room_id.clone(),
            self_description: self.options.self_description.clone(),
        })
        .map_err(RpcError::from)?;
        let reply = rpc
            .call(methods::JOIN, params, self.options.join_timeout)
            .await?;
        let reply: JoinReply = if reply.is_null() {
            JoinReply::default()
        } else {
            decode_params(methods::JOIN, reply)?
        };

        let joined = self.state.send_if_modified(|s| {
            if *s == RoomState::Joining && self.generation.load(Ordering::SeqCst) == generation {
                *s = RoomState::Joined;
                true
            } else {
                false
            }
        });
        if !joined {
            return Err(RoomError::JoinCancelled);
        }

        info!(
            room_id = %self.options.room_id,
            existing_peers = reply.existing_peers.len(),
            "Joined room"
        );
        self.emit(RoomEvent::Joined {
            existing_peers: reply.existing_peers.clone(),
        });
        Ok(reply.existing_peers)
    }

    fn register_handlers(self: &Arc<Self>, rpc: &Arc<RpcPeer>) -> Result<(), RpcError> {
        let room = Arc::downgrade(self);
        rpc.register_handler(
            methods::PEER_ADDED,
            handler(move |params| {
                let room = room.clone();
                async move {
                    if let Some(room) = room.upgrade() {
                        room.on_peer_added(params).await;
                    }
                    Ok(None)
                }
            }),
        )?;

        let room = Arc::downgrade(self);
        rpc.register_handler(
            methods::CONNECTION_REQUEST,
            handler(move |params| {
                let room = room.clone();
                async move {
                    match room.upgrade() {
                        Some(room) => room.on_connection_request(params).await,
                        None => Err(RpcError::Handler("room is gone".into())),
                    }
                }
            }),
        )?;

        // Relays differ on which name they use when forwarding a candidate.
        for method in [methods::ADD_ICE_CANDIDATE, methods::RELAY_ICE_CANDIDATE] {
            let room = Arc::downgrade(self);
            rpc.register_handler(
                method,
                handler(move |params| {
                    let room = room.clone();
                    async move {
                        if let Some(room) = room.upgrade() {
                            room.on_remote_candidate(params).await;
                        }
                        Ok(None)
                    }
                }),
            )?;
        }
        Ok(())
    }

    /// Leaves the room: closes every session, then the signaling channel.
    /// Calling it again, or before joining, is a no-op.
    pub async fn leave(&self) {
        if self.shutdown(None).await {
            info!(room_id = %self.options.room_id, "Left room");
            self.emit(RoomEvent::Left);
        }
    }

    /// Tears the membership down if `expected` is still the current
    /// generation (or unconditionally for `None`). Returns whether there was
    /// anything to tear down.
    async fn shutdown(&self, expected: Option<u64>) -> bool {
        let link = {
            let mut link = self.link.lock();
            if let Some(expected) = expected {
                if self.generation.load(Ordering::SeqCst) != expected {
                    return false;
                }
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            link.take()
        };

        let was_active = *self.state.borrow() != RoomState::Disconnected;
        if was_active {
            self.state.send_replace(RoomState::Leaving);
        }

        for peer in self.peers.drain() {
            metrics::ROOM_ACTIVE_PEERS.dec();
            peer.session.close().await;
            self.emit(RoomEvent::PeerRemoved {
                peer_id: peer.peer_id,
            });
        }

        if let Some(link) = link {
            debug!(generation = link.generation, "Closing signaling channel");
            link.rpc.close().await;
        }

        self.state.send_replace(RoomState::Disconnected);
        was_active
    }

    fn current_link(&self) -> Option<(Arc<RpcPeer>, u64)> {
        self.link
            .lock()
            .as_ref()
            .map(|l| (l.rpc.clone(), l.generation))
    }

    async fn on_peer_added(self: &Arc<Self>, params: Value) {
        let PeerAnnouncement {
            peer_id,
            self_description,
        } = match decode_params::<PeerAnnouncement>(methods::PEER_ADDED, params) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed peer_added");
                return;
            }
        };
        let Some((rpc, generation)) = self.current_link() else {
            debug!(peer_id = %peer_id, "peer_added after leave, ignoring");
            return;
        };
        info!(peer_id = %peer_id, description = %self_description, "Peer added");

        let session = match self.policy.on_peer_added(&peer_id, &self_description).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                let rejected = RoomError::PolicyRejected(peer_id.clone());
                self.negotiation_failed(generation, &peer_id, rejected);
                return;
            }
            Err(e) => {
                self.negotiation_failed(generation, &peer_id, RoomError::Session(e));
                return;
            }
        };

        if let Err(e) = self
            .offer_to(&rpc, generation, &peer_id, &self_description, &session)
            .await
        {
            session.close().await;
            self.negotiation_failed(generation, &peer_id, e);
        }
    }

    async fn offer_to(
        &self,
        rpc: &Arc<RpcPeer>,
        generation: u64,
        peer_id: &PeerId,
        description: &str,
        session: &Arc<PeerSession>,
    ) -> Result<(), RoomError> {
        relay_candidates(rpc, peer_id, session);

        let offer = session.create_offer().await?;
        let params = serde_json::to_value(ConnectionOffer {
            peer_id: peer_id.clone(),
            self_description: self.options.self_description.clone(),
            offer,
        })
        .map_err(RpcError::from)?;
        let reply = rpc
            .call(
                methods::REQUEST_CONNECTION,
                params,
                self.options.request_timeout,
            )
            .await?;

        let Some(answer) = ConnectionReply::from_value(reply)?.into_answer() else {
            return Err(RoomError::Declined(peer_id.clone()));
        };
        session.apply_answer(answer).await?;

        self.register(
            Peer::new(peer_id.clone(), description, session.clone(), true),
            generation,
        )
        .await
    }

    async fn on_connection_request(self: &Arc<Self>, params: Value) -> HandlerResult {
        let ConnectionOffer {
            peer_id,
            self_description,
            offer,
        } = decode_params::<ConnectionOffer>(methods::CONNECTION_REQUEST, params)
            .map_err(|e| RpcError::Handler(e.to_string()))?;
        let Some((rpc, generation)) = self.current_link() else {
            return Err(RpcError::Handler("room is not joined".into()));
        };
        info!(peer_id = %peer_id, description = %self_description, "Connection requested");

        let session = match self
            .policy
            .on_connection_request(&peer_id, &self_description)
            .await
        {
            Ok(Some(session)) => session,
            Ok(None) => {
                let rejected = RoomError::PolicyRejected(peer_id.clone());
                self.negotiation_failed(generation, &peer_id, rejected);
                return Ok(Some(serde_json::to_value(ConnectionReply::declined())?));
            }
            Err(e) => {
                let err = self.negotiation_failed(generation, &peer_id, RoomError::Session(e));
                return Err(RpcError::Handler(err.to_string()));
            }
        };

        match self
            .answer_to(&rpc, generation, &peer_id, &self_description, &session, offer)
            .await
        {
            Ok(answer) => Ok(Some(serde_json::to_value(ConnectionReply::accepted(
                answer,
            ))?)),
            Err(e) => {
                session.close().await;
                let err = self.negotiation_failed(generation, &peer_id, e);
                Err(RpcError::Handler(err.to_string()))
            }
        }
    }

    async fn answer_to(
        &self,
        rpc: &Arc<RpcPeer>,
        generation: u64,
        peer_id: &PeerId,
        description: &str,
        session: &Arc<PeerSession>,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, RoomError> {
        relay_candidates(rpc, peer_id, session);
        let answer = session.accept_offer(offer).await?;
        self.register(
            Peer::new(peer_id.clone(), description, session.clone(), false),
            generation,
        )
        .await?;
        Ok(answer)
    }

    async fn on_remote_candidate(&self, params: Value) {
        let CandidateParams { peer_id, candidate } =
            match decode_params::<CandidateParams>(methods::ADD_ICE_CANDIDATE, params) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed ICE candidate");
                    return;
                }
            };

        // The candidate may race ahead of the negotiation that registers the peer.
        match self
            .peers
            .wait_for(&peer_id, self.options.ice_candidate_wait)
            .await
        {
            Some(session) => {
                if let Err(e) = session.add_ice_candidate(candidate).await {
                    warn!(peer_id = %peer_id, error = %e, "Failed to add ICE candidate");
                }
            }
            None => {
                metrics::ROOM_ICE_CANDIDATES_DROPPED_TOTAL.inc();
                warn!(
                    peer_id = %peer_id,
                    waited = ?self.options.ice_candidate_wait,
                    "Dropping ICE candidate for unknown peer"
                );
            }
        }
    }

    async fn register(&self, peer: Peer, generation: u64) -> Result<(), RoomError> {
        let peer_id = peer.peer_id.clone();
        let session = peer.session.clone();
        let is_initiator = peer.is_initiator;

        match self.peers.insert(peer) {
            Some(replaced) => {
                if !Arc::ptr_eq(&replaced.session, &session) {
                    info!(peer_id = %peer_id, "Replacing existing session for peer");
                    replaced.session.close().await;
                }
            }
            None => metrics::ROOM_ACTIVE_PEERS.inc(),
        }

        if self.generation.load(Ordering::SeqCst) != generation {
            if self.peers.remove_if_session(&peer_id, &session).is_some() {
                metrics::ROOM_ACTIVE_PEERS.dec();
            }
            return Err(RoomError::NegotiationCancelled(peer_id));
        }

        metrics::ROOM_PEER_CONNECTIONS_TOTAL.inc();
        info!(peer_id = %peer_id, is_initiator, "Peer registered");
        self.emit(RoomEvent::PeerConnected {
            peer_id: peer_id.clone(),
            is_initiator,
        });
        self.watch_session(peer_id, session);
        Ok(())
    }

    fn watch_session(&self, peer_id: PeerId, session: Arc<PeerSession>) {
        let events = self.events.clone();
        let mut state_rx = session.subscribe_state();
        let room_peers = self.peers.clone();
        tokio::spawn(async move {
            loop {
                let state = *state_rx.borrow_and_update();
                let _ = events.send(RoomEvent::PeerStateChanged {
                    peer_id: peer_id.clone(),
                    state,
                });
                if matches!(
                    state,
                    RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed
                ) {
                    if room_peers.remove_if_session(&peer_id, &session).is_some() {
                        metrics::ROOM_ACTIVE_PEERS.dec();
                        info!(peer_id = %peer_id, %state, "Peer connection ended, removing peer");
                        let _ = events.send(RoomEvent::PeerRemoved {
                            peer_id: peer_id.clone(),
                        });
                    }
                    session.close().await;
                    return;
                }
                if state_rx.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    /// Reports a negotiation that did not produce a peer and returns the error
    /// as reported. A failure seen after the membership that started the
    /// negotiation has ended is a cancellation: no event, no metric.
    fn negotiation_failed(&self, generation: u64, peer_id: &PeerId, err: RoomError) -> RoomError {
        let err = if self.generation.load(Ordering::SeqCst) == generation {
            err
        } else {
            RoomError::NegotiationCancelled(peer_id.clone())
        };
        if let RoomError::NegotiationCancelled(_) = err {
            debug!(peer_id = %peer_id, "Negotiation outlived its membership");
            return err;
        }

        metrics::ROOM_NEGOTIATION_FAILURES_TOTAL
            .with_label_values(&[err.reason()])
            .inc();
        match &err {
            RoomError::PolicyRejected(_) => {
                info!(peer_id = %peer_id, "Local policy declined peer");
            }
            RoomError::Declined(_) => {
                info!(peer_id = %peer_id, "Peer declined our offer");
                self.emit(RoomEvent::PeerDeclined {
                    peer_id: peer_id.clone(),
                });
            }
            _ => {
                warn!(peer_id = %peer_id, error = %err, "Could not connect to peer");
                self.emit(RoomEvent::ConnectFailed {
                    peer_id: peer_id.clone(),
                    reason: err.to_string(),
                });
            }
        }
        err
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    pub fn state(&self) -> RoomState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RoomState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    /// Room events as a stream. Events missed by a slow reader are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = RoomEvent> + Send + Unpin + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|e| e.ok())
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<Peer> {
        self.peers.get(peer_id)
    }

    pub fn session(&self, peer_id: &PeerId) -> Option<Arc<PeerSession>> {
        self.peers.session(peer_id)
    }

    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.peers.sessions()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.ids()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Sends `text` on the data channel to `peer_id`. `Ok(false)` means the
    /// peer has no open channel and nothing was sent.
    pub async fn send_to(&self, peer_id: &PeerId, text: &str) -> Result<bool, RoomError> {
        let session = self
            .peers
            .session(peer_id)
            .ok_or_else(|| RoomError::PeerNotFound(peer_id.clone()))?;
        Ok(session.send(text).await?)
    }
}

/// Forwards our local ICE candidates for `peer_id` to the relay.
fn relay_candidates(rpc: &Arc<RpcPeer>, peer_id: &PeerId, session: &PeerSession) {
    let rpc = Arc::downgrade(rpc);
    let peer_id = peer_id.clone();
    session.on_ice_candidate(move |candidate| {
        let rpc = rpc.clone();
        let peer_id = peer_id.clone();
        async move {
            let Some(rpc) = rpc.upgrade() else {
                return;
            };
            let params = match serde_json::to_value(CandidateParams {
                peer_id: peer_id.clone(),
                candidate,
            }) {
                Ok(params) => params,
                Err(e) => {
                    warn!(peer_id = %peer_id, error = %e, "Failed to encode ICE candidate");
                    return;
                }
            };
            if let Err(e) = rpc.notify(methods::RELAY_ICE_CANDIDATE, params).await {
                debug!(peer_id = %peer_id, error = %e, "Could not relay ICE candidate");
            }
        }
    });
}

/// Feeds transport events into the RPC layer until the channel ends.
async fn pump(
    room: Weak<Room>,
    rpc: Arc<RpcPeer>,
    mut events: EventReceiver,
    generation: u64,
    open_tx: oneshot::Sender<Result<(), TransportError>>,
) {
    let mut open_tx = Some(open_tx);
    let ending = loop {
        match events.recv().await {
            Some(TransportEvent::Open) => {
                if let Some(tx) = open_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Some(TransportEvent::Message(text)) => rpc.handle_message(&text),
            Some(TransportEvent::Error(reason)) => break Ending::Failed(reason),
            Some(TransportEvent::Closed) | None => break Ending::Closed,
        }
    };

    rpc.fail_pending();

    if let Some(tx) = open_tx.take() {
        // join() is still waiting for the open and tears down itself.
        let err = match ending {
            Ending::Failed(reason) => TransportError::Failed(reason),
            Ending::Closed => TransportError::Closed,
        };
        let _ = tx.send(Err(err));
        return;
    }

    let reason = match ending {
        Ending::Failed(reason) => reason,
        Ending::Closed => "connection closed".to_string(),
    };
    let Some(room) = room.upgrade() else {
        return;
    };
    if room.shutdown(Some(generation)).await {
        warn!(room_id = %room.options.room_id, reason = %reason, "Signaling channel lost");
        room.emit(RoomEvent::TransportLost { reason });
    }
}
