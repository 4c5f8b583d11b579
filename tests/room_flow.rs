use async_trait::async_trait;
use parking_lot::Mutex;
use room_mesh::media::{LocalStream, LocalTrack, MediaKind, StaticMediaProvider};
use room_mesh::protocol::{ExistingPeer, JoinReply};
use room_mesh::transport::memory::{self, MemoryRelay};
use room_mesh::{AgentRoomPolicy, DeviceId, DeviceManager, MediaSetup, PeerId, PeerPolicy};
use room_mesh::{PeerSession, Room, RoomError, RoomEvent, RoomOptions, RoomState};
use room_mesh::{SessionError, TransportError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::Notify;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

async fn agent_policy() -> AgentRoomPolicy {
    let devices = Arc::new(DeviceManager::new(Arc::new(
        StaticMediaProvider::with_default_devices(),
    )));
    devices.initialize().await.unwrap();
    AgentRoomPolicy::new(Arc::new(MediaSetup::new(Vec::new()).unwrap()), devices)
}

async fn policy() -> Arc<AgentRoomPolicy> {
    Arc::new(agent_policy().await)
}

/// Hands out the agent policy's sessions and keeps them for inspection.
/// When gated, answering parks until `release` is notified.
struct Recording {
    inner: AgentRoomPolicy,
    sessions: Mutex<Vec<Arc<PeerSession>>>,
    gated: bool,
    answering: Notify,
    release: Notify,
}

impl Recording {
    async fn new(gated: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: agent_policy().await,
            sessions: Mutex::new(Vec::new()),
            gated,
            answering: Notify::new(),
            release: Notify::new(),
        })
    }

    fn keep(
        &self,
        built: Result<Option<Arc<PeerSession>>, SessionError>,
    ) -> Result<Option<Arc<PeerSession>>, SessionError> {
        if let Ok(Some(session)) = &built {
            self.sessions.lock().push(session.clone());
        }
        built
    }

    async fn first_session(&self) -> Arc<PeerSession> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(session) = self.sessions.lock().first().cloned() {
                    return session;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("policy never built a session")
    }
}

#[async_trait]
impl PeerPolicy for Recording {
    async fn on_peer_added(
        &self,
        peer_id: &PeerId,
        self_description: &str,
    ) -> Result<Option<Arc<PeerSession>>, SessionError> {
        self.keep(self.inner.on_peer_added(peer_id, self_description).await)
    }

    async fn on_connection_request(
        &self,
        peer_id: &PeerId,
        self_description: &str,
    ) -> Result<Option<Arc<PeerSession>>, SessionError> {
        if self.gated {
            self.answering.notify_one();
            self.release.notified().await;
        }
        self.keep(self.inner.on_connection_request(peer_id, self_description).await)
    }
}

async fn wait_closed(session: &PeerSession) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !session.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session was never closed");
}

/// Everything already queued on `events`.
fn drain(events: &mut broadcast::Receiver<RoomEvent>) -> Vec<RoomEvent> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return seen,
        }
    }
}

/// An offer from `remote` with one audio section to answer.
async fn remote_offer(remote: &PeerSession) -> RTCSessionDescription {
    let stream = LocalStream::new();
    stream.replace_track(LocalTrack::new(
        MediaKind::Audio,
        DeviceId::from("remote-mic"),
        stream.id(),
    ));
    remote.add_local_tracks(&stream).await.unwrap();
    remote.create_offer().await.unwrap()
}

async fn remote_session(id: &str) -> Arc<PeerSession> {
    MediaSetup::new(Vec::new())
        .unwrap()
        .new_session(PeerId::from(id))
        .await
        .unwrap()
}

async fn reply(relay: &MemoryRelay, request: &Value, data: Value) {
    relay
        .send_json(&json!({"type": "response", "request_id": request["id"], "data": data}))
        .await;
}

/// Next request for `method`, skipping candidate notifications and anything else.
async fn next_request(relay: &mut MemoryRelay, method: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = relay.recv_json().await.expect("client went away");
            if frame["type"] == "request" && frame["method"] == method {
                return frame;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {} request from client", method))
}

async fn next_event(
    events: &mut broadcast::Receiver<RoomEvent>,
    pred: impl Fn(&RoomEvent) -> bool,
) -> RoomEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for room event")
}

async fn joined(
    options: RoomOptions,
    existing: Value,
) -> (Arc<Room>, MemoryRelay, Vec<ExistingPeer>) {
    joined_with(options, existing, policy().await).await
}

async fn joined_with(
    options: RoomOptions,
    existing: Value,
    policy: Arc<dyn PeerPolicy>,
) -> (Arc<Room>, MemoryRelay, Vec<ExistingPeer>) {
    let (connector, mut relay) = memory::channel();
    let room = Room::new(options, Arc::new(connector), policy);
    relay.open().await;

    let joining = {
        let room = room.clone();
        tokio::spawn(async move { room.join().await })
    };
    let join = next_request(&mut relay, "join").await;
    assert_eq!(join["params"]["room_id"], "r1");
    assert_eq!(join["params"]["self_description"], "Peer");
    reply(&relay, &join, json!({"existing_peers": existing})).await;

    let existing = joining.await.unwrap().unwrap();
    (room, relay, existing)
}

fn options() -> RoomOptions {
    RoomOptions::new("r1", "Peer")
}

async fn announce(relay: &MemoryRelay, peer_id: &str) {
    relay
        .send_json(&json!({
            "type": "request",
            "method": "peer_added",
            "params": {"peer_id": peer_id, "self_description": "Peer"}
        }))
        .await;
}

#[tokio::test]
async fn test_join_returns_existing_peers_without_offering() {
    let (room, mut relay, existing) = joined(
        options(),
        json!([{"peer_id": "p9", "self_description": "Agent"}]),
    )
    .await;

    assert_eq!(existing.len(), 1);
    assert_eq!(existing[0].peer_id, PeerId::from("p9"));
    assert_eq!(existing[0].self_description, "Agent");
    assert_eq!(room.state(), RoomState::Joined);

    // Existing peers offer to us, never the other way around.
    let nothing = tokio::time::timeout(Duration::from_millis(200), relay.recv()).await;
    assert!(nothing.is_err());
    assert_eq!(room.peer_count(), 0);
    room.leave().await;
}

#[tokio::test]
async fn test_null_join_reply_means_empty_room() {
    let (connector, mut relay) = memory::channel();
    let room = Room::new(options(), Arc::new(connector), policy().await);
    relay.open().await;

    let joining = {
        let room = room.clone();
        tokio::spawn(async move { room.join().await })
    };
    let join = next_request(&mut relay, "join").await;
    reply(&relay, &join, Value::Null).await;

    assert!(joining.await.unwrap().unwrap().is_empty());
    assert!(JoinReply::default().existing_peers.is_empty());
    room.leave().await;
}

#[tokio::test]
async fn test_peer_registered_after_answer() {
    let (room, mut relay, _) = joined(options(), json!([])).await;
    let mut events = room.subscribe();

    announce(&relay, "p1").await;
    let request = next_request(&mut relay, "request_connection").await;
    assert_eq!(request["params"]["peer_id"], "p1");
    assert_eq!(request["params"]["offer"]["type"], "offer");

    // Nothing is registered until the answer is applied.
    assert_eq!(room.peer_count(), 0);

    let remote = remote_session("room-client").await;
    let offer: RTCSessionDescription =
        serde_json::from_value(request["params"]["offer"].clone()).unwrap();
    let answer = remote.accept_offer(offer).await.unwrap();
    reply(&relay, &request, json!({"answer": answer})).await;

    next_event(&mut events, |e| matches!(e, RoomEvent::PeerConnected { .. })).await;
    let peer = room.peer(&PeerId::from("p1")).unwrap();
    assert!(peer.is_initiator);
    assert_eq!(peer.description, "Peer");

    room.leave().await;
    remote.close().await;
}

#[tokio::test]
async fn test_request_timeout_leaves_no_entry() {
    let recording = Recording::new(false).await;
    let (room, mut relay, _) = joined_with(
        options().with_request_timeout(Duration::from_millis(200)),
        json!([]),
        recording.clone(),
    )
    .await;
    let mut events = room.subscribe();

    announce(&relay, "p1").await;
    next_request(&mut relay, "request_connection").await;

    let failed = next_event(&mut events, |e| matches!(e, RoomEvent::ConnectFailed { .. })).await;
    match failed {
        RoomEvent::ConnectFailed { peer_id, reason } => {
            assert_eq!(peer_id, PeerId::from("p1"));
            assert!(reason.contains("timed out"), "reason was {}", reason);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(room.peer_count(), 0);
    assert!(recording.first_session().await.is_closed());
    assert_eq!(room.state(), RoomState::Joined);
    room.leave().await;
}

#[tokio::test]
async fn test_leave_while_offering_reports_nothing() {
    let recording = Recording::new(false).await;
    let (room, mut relay, _) = joined_with(options(), json!([]), recording.clone()).await;
    let mut events = room.subscribe();

    announce(&relay, "p1").await;
    next_request(&mut relay, "request_connection").await;
    room.leave().await;

    // The pending call is woken by the teardown; give its cleanup time to run.
    wait_closed(&*recording.first_session().await).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let seen = drain(&mut events);
    assert!(seen.iter().any(|e| matches!(e, RoomEvent::Left)), "got {:?}", seen);
    assert!(
        !seen.iter().any(|e| matches!(
            e,
            RoomEvent::ConnectFailed { .. } | RoomEvent::PeerDeclined { .. }
        )),
        "got {:?}",
        seen
    );
    assert_eq!(room.peer_count(), 0);
    assert_eq!(room.state(), RoomState::Disconnected);
}

#[tokio::test]
async fn test_answer_finishing_after_leave_is_discarded() {
    let recording = Recording::new(true).await;
    let (room, relay, _) = joined_with(options(), json!([]), recording.clone()).await;
    let mut events = room.subscribe();

    let remote = remote_session("p2").await;
    let offer = remote_offer(&remote).await;
    relay
        .send_json(&json!({
            "type": "request",
            "id": "offer-1",
            "method": "connection_request",
            "params": {"peer_id": "p2", "self_description": "Peer", "offer": offer}
        }))
        .await;

    tokio::time::timeout(Duration::from_secs(5), recording.answering.notified())
        .await
        .expect("connection request never reached the policy");
    room.leave().await;
    recording.release.notify_one();

    // The answer is built against a membership that no longer exists.
    wait_closed(&*recording.first_session().await).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(room.peer_count(), 0);
    assert!(room.session(&PeerId::from("p2")).is_none());
    let seen = drain(&mut events);
    assert!(
        !seen.iter().any(|e| matches!(
            e,
            RoomEvent::PeerConnected { .. } | RoomEvent::ConnectFailed { .. }
        )),
        "got {:?}",
        seen
    );
    assert_eq!(room.state(), RoomState::Disconnected);
    remote.close().await;
}

#[tokio::test]
async fn test_decline_is_distinct_from_failure() {
    let (room, mut relay, _) = joined(options(), json!([])).await;
    let mut events = room.subscribe();

    announce(&relay, "p1").await;
    let request = next_request(&mut relay, "request_connection").await;
    reply(&relay, &request, json!({"answer": null, "declined": true})).await;

    let event = next_event(&mut events, |e| {
        matches!(e, RoomEvent::PeerDeclined { .. } | RoomEvent::ConnectFailed { .. })
    })
    .await;
    assert!(matches!(event, RoomEvent::PeerDeclined { .. }), "got {:?}", event);
    assert_eq!(room.peer_count(), 0);
    room.leave().await;
}

#[tokio::test]
async fn test_candidate_waits_for_registration() {
    let (room, mut relay, _) = joined(options(), json!([])).await;

    let remote = remote_session("p2").await;
    let offer = remote_offer(&remote).await;

    let started = Instant::now();
    relay
        .send_json(&json!({
            "type": "request",
            "id": "cand-1",
            "method": "add_ice_candidate",
            "params": {
                "peer_id": "p2",
                "candidate": {
                    "candidate": "candidate:1 1 udp 2130706431 192.0.2.10 50000 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                }
            }
        }))
        .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(room.session(&PeerId::from("p2")).is_none());

    relay
        .send_json(&json!({
            "type": "request",
            "id": "offer-1",
            "method": "connection_request",
            "params": {"peer_id": "p2", "self_description": "Peer", "offer": offer}
        }))
        .await;

    let mut candidate_done = false;
    let mut answer: Option<Value> = None;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !(candidate_done && answer.is_some()) {
            let frame = relay.recv_json().await.expect("client went away");
            match frame["request_id"].as_str() {
                Some("cand-1") => {
                    // The candidate handler only finishes once p2 is registered.
                    assert!(room.session(&PeerId::from("p2")).is_some());
                    candidate_done = true;
                }
                Some("offer-1") => answer = Some(frame["data"].clone()),
                _ => {}
            }
        }
    })
    .await
    .expect("client did not finish the exchange");

    assert!(started.elapsed() >= Duration::from_millis(100));
    let answer = answer.unwrap();
    assert_eq!(answer["answer"]["type"], "answer");
    let peer = room.peer(&PeerId::from("p2")).unwrap();
    assert!(!peer.is_initiator);

    room.leave().await;
    remote.close().await;
}

#[tokio::test]
async fn test_leave_twice_gives_same_end_state() {
    let (room, mut relay, _) = joined(options(), json!([])).await;
    let mut events = room.subscribe();

    announce(&relay, "p1").await;
    let request = next_request(&mut relay, "request_connection").await;
    let remote = remote_session("room-client").await;
    let offer: RTCSessionDescription =
        serde_json::from_value(request["params"]["offer"].clone()).unwrap();
    let answer = remote.accept_offer(offer).await.unwrap();
    reply(&relay, &request, json!({"answer": answer})).await;
    next_event(&mut events, |e| matches!(e, RoomEvent::PeerConnected { .. })).await;

    let session = room.session(&PeerId::from("p1")).unwrap();
    room.leave().await;
    next_event(&mut events, |e| matches!(e, RoomEvent::Left)).await;

    assert_eq!(room.state(), RoomState::Disconnected);
    assert_eq!(room.peer_count(), 0);
    assert!(session.is_closed());
    assert!(relay.is_closed());

    room.leave().await;
    assert_eq!(room.state(), RoomState::Disconnected);
    assert_eq!(room.peer_count(), 0);
    remote.close().await;
}

#[tokio::test]
async fn test_close_before_open_rejects_join() {
    let (connector, relay) = memory::channel();
    let room = Room::new(options(), Arc::new(connector), policy().await);
    relay.close().await;

    let err = room.join().await.unwrap_err();
    assert!(
        matches!(err, RoomError::Transport(TransportError::Closed)),
        "got {:?}",
        err
    );
    assert_eq!(room.state(), RoomState::Disconnected);
}

#[tokio::test]
async fn test_transport_loss_tears_room_down() {
    let (room, relay, _) = joined(options(), json!([])).await;
    let mut events = room.subscribe();

    relay.fail("connection reset").await;

    let lost = next_event(&mut events, |e| matches!(e, RoomEvent::TransportLost { .. })).await;
    assert!(matches!(lost, RoomEvent::TransportLost { reason } if reason == "connection reset"));
    assert_eq!(room.state(), RoomState::Disconnected);
    assert_eq!(room.peer_count(), 0);
}

#[tokio::test]
async fn test_second_join_is_rejected() {
    let (room, _relay, _) = joined(options(), json!([])).await;
    assert!(matches!(room.join().await, Err(RoomError::AlreadyJoined)));
    room.leave().await;
}
