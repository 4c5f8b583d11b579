use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::Rng;
use serde_json::json;
use std::time::Duration;
use tokio::runtime::Runtime;
use webrtc::media::Sample;

use room_mesh::frame::Frame;
use room_mesh::id_types::DeviceId;
use room_mesh::media::{LocalTrack, MediaKind};
use room_mesh::rpc::RpcPeer;
use room_mesh::transport::memory;
use room_mesh::transport::Connector;

fn candidate_frame(id: &str) -> Frame {
    Frame::request(
        Some(id.to_string()),
        "relay_ice_candidate",
        json!({
            "peer_id": "c1d7a0f4-5b8e-4a0e-9f3e-2b6c8d1e7a90",
            "candidate": {
                "candidate": "candidate:842163049 1 udp 1677729535 203.0.113.7 61234 typ srflx raddr 0.0.0.0 rport 0",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        }),
    )
}

// 1. Frame codec, hit for every message on the signaling channel
fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    let frame = candidate_frame("5f0c2a38-8d0a-4c52-a3c3-1c8e6f0e1d2b");
    let raw = frame.encode().unwrap();

    group.bench_function("encode_request", |b| {
        b.iter(|| {
            let _ = black_box(frame.encode().unwrap());
        })
    });

    group.bench_function("parse_request", |b| {
        b.iter(|| {
            let _ = black_box(Frame::parse(&raw).unwrap());
        })
    });

    // An SDP-sized response body
    let mut rng = rand::thread_rng();
    let sdp: String = (0..3000)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect();
    let response = Frame::response(
        "5f0c2a38-8d0a-4c52-a3c3-1c8e6f0e1d2b".to_string(),
        json!({"answer": {"type": "answer", "sdp": sdp}}),
    )
    .encode()
    .unwrap();

    group.bench_function("parse_sdp_response", |b| {
        b.iter(|| {
            let _ = black_box(Frame::parse(&response).unwrap());
        })
    });

    group.finish();
}

// 2. Correlation id generation per outbound call
fn bench_request_ids(c: &mut Criterion) {
    c.bench_function("uuid_v4_request_id", |b| {
        b.iter(|| {
            let _ = black_box(uuid::Uuid::new_v4().to_string());
        })
    });
}

// 3. Full call round trip over the in-memory transport with an echoing relay
fn bench_call_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let rpc = rt.block_on(async {
        let (connector, mut relay) = memory::channel();
        let (transport, mut events) = connector.connect().await.unwrap();
        let rpc = RpcPeer::new(transport);

        let pump = rpc.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let room_mesh::transport::TransportEvent::Message(text) = event {
                    pump.handle_message(&text);
                }
            }
        });
        tokio::spawn(async move {
            while let Some(frame) = relay.recv_json().await {
                if let Some(id) = frame["id"].as_str() {
                    let echo = json!({
                        "type": "response",
                        "request_id": id,
                        "data": frame["params"]
                    });
                    relay.send_json(&echo).await;
                }
            }
        });
        rpc
    });

    let rpc = &rpc;
    c.bench_function("rpc_call_round_trip", |b| {
        b.to_async(&rt).iter(move || async move {
            let _ = black_box(
                rpc.call("echo", json!({"n": 1}), Duration::from_secs(1))
                    .await
                    .unwrap(),
            );
        })
    });
}

// 4. Muted tracks drop samples before they reach the RTP packetizer
fn bench_muted_sample(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let track = LocalTrack::new(MediaKind::Audio, DeviceId::from("bench-mic"), "bench");
    track.set_enabled(false);
    let sample = Sample {
        data: Bytes::from(vec![0u8; 160]),
        duration: Duration::from_millis(20),
        ..Default::default()
    };

    let (track, sample) = (&track, &sample);
    c.bench_function("write_sample_muted", |b| {
        b.to_async(&rt).iter(move || async move {
            let _ = black_box(track.write_sample(sample).await.unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_frame_codec,
    bench_request_ids,
    bench_call_round_trip,
    bench_muted_sample
);
criterion_main!(benches);
