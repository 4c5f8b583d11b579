use anyhow::Context;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{info, warn, Instrument};

use room_mesh::agent::AgentInviter;
use room_mesh::config;
use room_mesh::logging;
use room_mesh::media::StaticMediaProvider;
use room_mesh::metrics;
use room_mesh::transport::WsConnector;
use room_mesh::{AgentRoomPolicy, DeviceManager, MediaSetup, Room, RoomEvent, RoomId, RoomOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::validate_env()?;
    logging::init(&config.rust_log);
    metrics::register_metrics();

    if let Some(port) = config.metrics_port {
        tokio::spawn(metrics::serve(port));
    }

    let room_id = RoomId::from(config.room_id.clone());
    let span = logging::room_span(&room_id);
    run(config, room_id).instrument(span).await
}

async fn run(config: config::Config, room_id: RoomId) -> anyhow::Result<()> {
    let devices = Arc::new(DeviceManager::new(Arc::new(
        StaticMediaProvider::with_default_devices(),
    )));
    devices
        .initialize()
        .await
        .context("failed to initialize local media")?;

    let setup = Arc::new(MediaSetup::new(vec![config.stun_url.clone()])?);
    let policy = Arc::new(AgentRoomPolicy::new(setup, devices.clone()));
    let options = RoomOptions::new(room_id.clone(), config.self_description.clone())
        .with_request_timeout(config.request_timeout);
    let room = Room::new(
        options,
        Arc::new(WsConnector::new(config.signaling_url.clone())),
        policy,
    );

    let mut events = room.event_stream();
    let existing = room.join().await.context("failed to join room")?;
    info!(existing_peers = existing.len(), "Waiting for peers");

    if let Some(base_url) = &config.agent_server_url {
        match AgentInviter::new(base_url) {
            Ok(inviter) => {
                Arc::new(inviter).invite_if_absent(room_id.clone(), &existing);
            }
            Err(e) => warn!(error = %e, "Agent invitations disabled"),
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            event = events.next() => match event {
                Some(RoomEvent::TransportLost { reason }) => {
                    warn!(reason = %reason, "Signaling connection lost");
                    break;
                }
                Some(RoomEvent::PeerStateChanged { peer_id, state }) => {
                    info!(peer_id = %peer_id, %state, "Peer connection state");
                }
                Some(event) => info!(?event, "Room event"),
                None => break,
            }
        }
    }

    room.leave().await;
    devices.stop_all();
    Ok(())
}
