use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_remote::TrackRemote;

use crate::error::SessionError;
use crate::id_types::PeerId;
use crate::media::{LocalStream, LocalTrack, MediaKind, RemoteStream};

pub type RemoteTrackHandler = Arc<dyn Fn(Arc<TrackRemote>) + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;

type Callback = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A local track as published on one peer connection.
#[derive(Clone)]
pub struct OutboundTrack {
    pub kind: MediaKind,
    pub track: Arc<LocalTrack>,
    pub sender: Arc<RTCRtpSender>,
}

/// One WebRTC session with one remote peer.
///
/// Callbacks installed on the peer connection only capture the shared pieces
/// below, never the session itself, so dropping the last `Arc<PeerSession>`
/// is enough to release it.
pub struct PeerSession {
    peer_id: PeerId,
    pc: Arc<RTCPeerConnection>,
    outbound: Mutex<Vec<OutboundTrack>>,
    inbound: Arc<RemoteStream>,
    remote_handlers: Arc<RwLock<Vec<RemoteTrackHandler>>>,
    data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    message_handlers: Arc<RwLock<Vec<MessageHandler>>>,
    state_tx: Arc<watch::Sender<RTCPeerConnectionState>>,
    closed: AtomicBool,
}

impl PeerSession {
    pub fn new(peer_id: PeerId, pc: Arc<RTCPeerConnection>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(pc.connection_state());
        let session = Self {
            peer_id,
            pc,
            outbound: Mutex::new(Vec::new()),
            inbound: Arc::new(RemoteStream::default()),
            remote_handlers: Arc::new(RwLock::new(Vec::new())),
            data_channel: Arc::new(Mutex::new(None)),
            message_handlers: Arc::new(RwLock::new(Vec::new())),
            state_tx: Arc::new(state_tx),
            closed: AtomicBool::new(false),
        };
        session.install_handlers();
        Arc::new(session)
    }

    fn install_handlers(&self) {
        let peer_id = self.peer_id.clone();
        let state_tx = self.state_tx.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                info!(peer_id = %peer_id, state = %s, "Peer connection state changed");
                // Closed is terminal even if the stack reports something later.
                state_tx.send_if_modified(|current| {
                    if *current == RTCPeerConnectionState::Closed || *current == s {
                        return false;
                    }
                    *current = s;
                    true
                });
                Box::pin(async {})
            }));

        let peer_id = self.peer_id.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                debug!(peer_id = %peer_id, state = %s, "ICE connection state changed");
                Box::pin(async {})
            }));

        let peer_id = self.peer_id.clone();
        let inbound = self.inbound.clone();
        let handlers = self.remote_handlers.clone();
        self.pc
            .on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                info!(
                    peer_id = %peer_id,
                    kind = %track.kind(),
                    track_id = %track.id(),
                    "Remote track received"
                );
                inbound.push(track.clone());
                for handler in handlers.read().iter() {
                    handler(track.clone());
                }
                Box::pin(async {})
            }));

        let peer_id = self.peer_id.clone();
        let slot = self.data_channel.clone();
        let handlers = self.message_handlers.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                info!(peer_id = %peer_id, label = %dc.label(), "Adopting remote data channel");
                attach_channel(&peer_id, &dc, &handlers);
                *slot.lock() = Some(dc);
                Box::pin(async {})
            }));
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Publishes every track of `stream` on this connection.
    pub async fn add_local_tracks(&self, stream: &LocalStream) -> Result<(), SessionError> {
        for track in stream.tracks() {
            let sender = self.pc.add_track(track.rtc_track()).await?;

            // RTCP has to be read for interceptors like NACK to work.
            let rtcp_sender = sender.clone();
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while let Ok((_, _)) = rtcp_sender.read(&mut rtcp_buf).await {}
            });

            debug!(
                peer_id = %self.peer_id,
                kind = %track.kind(),
                track_id = %track.id(),
                "Added local track"
            );
            self.outbound.lock().push(OutboundTrack {
                kind: track.kind(),
                track,
                sender,
            });
        }
        Ok(())
    }

    pub fn outbound_tracks(&self) -> Vec<OutboundTrack> {
        self.outbound.lock().clone()
    }

    pub fn outbound_track(&self, kind: MediaKind) -> Option<Arc<LocalTrack>> {
        self.outbound
            .lock()
            .iter()
            .find(|o| o.kind == kind)
            .map(|o| o.track.clone())
    }

    /// Swaps the track published for `kind` without renegotiating.
    /// Returns `false` when this session publishes nothing of that kind.
    pub async fn replace_outbound_track(
        &self,
        kind: MediaKind,
        track: Arc<LocalTrack>,
    ) -> Result<bool, SessionError> {
        let sender = self
            .outbound
            .lock()
            .iter()
            .find(|o| o.kind == kind)
            .map(|o| o.sender.clone());
        let Some(sender) = sender else {
            return Ok(false);
        };

        sender.replace_track(Some(track.rtc_track())).await?;

        if let Some(slot) = self.outbound.lock().iter_mut().find(|o| o.kind == kind) {
            slot.track = track;
        }
        Ok(true)
    }

    /// Flips the mute flag of every outbound track of `kind`. Returns how many changed.
    pub fn set_outbound_enabled(&self, kind: MediaKind, enabled: bool) -> usize {
        let outbound = self.outbound.lock();
        let mut changed = 0;
        for o in outbound.iter().filter(|o| o.kind == kind) {
            o.track.set_enabled(enabled);
            changed += 1;
        }
        changed
    }

    pub fn on_remote_stream(&self, handler: impl Fn(Arc<TrackRemote>) + Send + Sync + 'static) {
        self.remote_handlers.write().push(Arc::new(handler));
    }

    pub fn remote_stream(&self) -> Arc<RemoteStream> {
        self.inbound.clone()
    }

    /// Opens a data channel. Only the offering side does this; the answering
    /// side adopts the channel when it arrives.
    pub async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<RTCDataChannel>, SessionError> {
        let dc = self.pc.create_data_channel(label, None).await?;
        attach_channel(&self.peer_id, &dc, &self.message_handlers);
        *self.data_channel.lock() = Some(dc.clone());
        Ok(dc)
    }

    pub fn data_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.data_channel.lock().clone()
    }

    pub fn on_message(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        self.message_handlers.write().push(Arc::new(handler));
    }

    /// Sends text on the data channel. Returns `Ok(false)` without sending
    /// when there is no channel or it is not open yet.
    pub async fn send(&self, text: &str) -> Result<bool, SessionError> {
        let Some(dc) = self.data_channel() else {
            warn!(peer_id = %self.peer_id, "No data channel, dropping message");
            return Ok(false);
        };
        if dc.ready_state() != RTCDataChannelState::Open {
            warn!(peer_id = %self.peer_id, state = %dc.ready_state(), "Data channel not open, dropping message");
            return Ok(false);
        }
        dc.send_text(text.to_owned()).await?;
        Ok(true)
    }

    /// Calls `f` for every local ICE candidate gathered from now on.
    pub fn on_ice_candidate<F, Fut>(&self, f: F)
    where
        F: Fn(RTCIceCandidateInit) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let peer_id = self.peer_id.clone();
        self.pc
            .on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| -> Callback {
                let Some(candidate) = c else {
                    debug!(peer_id = %peer_id, "ICE gathering complete");
                    return Box::pin(async {});
                };
                match candidate.to_json() {
                    Ok(init) => Box::pin(f(init)),
                    Err(e) => {
                        warn!(peer_id = %peer_id, error = %e, "Failed to serialize local ICE candidate");
                        Box::pin(async {})
                    }
                }
            }));
    }

    /// Creates an offer and sets it as the local description.
    pub async fn create_offer(&self) -> Result<RTCSessionDescription, SessionError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(self.pc.local_description().await.unwrap_or(offer))
    }

    /// Applies a remote offer and returns the local answer.
    pub async fn accept_offer(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, SessionError> {
        let offer = RTCSessionDescription::offer(offer.sdp)?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(self.pc.local_description().await.unwrap_or(answer))
    }

    pub async fn apply_answer(&self, answer: RTCSessionDescription) -> Result<(), SessionError> {
        let answer = RTCSessionDescription::answer(answer.sdp)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    pub async fn add_ice_candidate(
        &self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), SessionError> {
        self.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RTCPeerConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tears the connection down. Safe to call any number of times.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.data_channel.lock().take();
        if let Err(e) = self.pc.close().await {
            warn!(peer_id = %self.peer_id, error = %e, "Error while closing peer connection");
        }
        self.state_tx.send_replace(RTCPeerConnectionState::Closed);
        debug!(peer_id = %self.peer_id, "Peer session closed");
    }
}

fn attach_channel(
    peer_id: &PeerId,
    dc: &Arc<RTCDataChannel>,
    handlers: &Arc<RwLock<Vec<MessageHandler>>>,
) {
    let open_peer = peer_id.clone();
    let label = dc.label().to_owned();
    dc.on_open(Box::new(move || {
        info!(peer_id = %open_peer, label = %label, "Data channel open");
        Box::pin(async {})
    }));

    let handlers = handlers.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let text = String::from_utf8_lossy(&msg.data).into_owned();
        for handler in handlers.read().iter() {
            handler(text.clone());
        }
        Box::pin(async {})
    }));
}
