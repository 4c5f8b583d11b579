use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::agent::AGENT_DESCRIPTION;
use crate::device_manager::DeviceManager;
use crate::error::SessionError;
use crate::id_types::PeerId;
use crate::media::LocalStream;
use crate::media_setup::MediaSetup;
use crate::peer_session::PeerSession;

pub const AGENT_CHANNEL_LABEL: &str = "agent";

/// Decides whether to connect to a remote peer and builds the session if so.
///
/// `Ok(None)` declines the peer. A declined or failed peer never reaches the
/// registry.
#[async_trait]
pub trait PeerPolicy: Send + Sync {
    /// We are about to send an offer to `peer_id`.
    async fn on_peer_added(
        &self,
        peer_id: &PeerId,
        self_description: &str,
    ) -> Result<Option<Arc<PeerSession>>, SessionError>;

    /// `peer_id` sent us an offer.
    async fn on_connection_request(
        &self,
        peer_id: &PeerId,
        self_description: &str,
    ) -> Result<Option<Arc<PeerSession>>, SessionError>;
}

async fn session_with_stream(
    setup: &MediaSetup,
    peer_id: &PeerId,
    stream: &LocalStream,
) -> Result<Arc<PeerSession>, SessionError> {
    let session = setup.new_session(peer_id.clone()).await?;
    if let Err(e) = session.add_local_tracks(stream).await {
        session.close().await;
        return Err(e);
    }
    Ok(session)
}

/// Connects to everyone and publishes one shared local stream.
pub struct AcceptAll {
    setup: Arc<MediaSetup>,
    stream: Arc<LocalStream>,
}

impl AcceptAll {
    pub fn new(setup: Arc<MediaSetup>, stream: Arc<LocalStream>) -> Self {
        Self { setup, stream }
    }
}

#[async_trait]
impl PeerPolicy for AcceptAll {
    async fn on_peer_added(
        &self,
        peer_id: &PeerId,
        _self_description: &str,
    ) -> Result<Option<Arc<PeerSession>>, SessionError> {
        session_with_stream(&self.setup, peer_id, &self.stream)
            .await
            .map(Some)
    }

    async fn on_connection_request(
        &self,
        peer_id: &PeerId,
        _self_description: &str,
    ) -> Result<Option<Arc<PeerSession>>, SessionError> {
        session_with_stream(&self.setup, peer_id, &self.stream)
            .await
            .map(Some)
    }
}

/// Captures a stream per peer from the device manager. Agents get audio only,
/// and a data channel when we are the offering side.
pub struct AgentRoomPolicy {
    setup: Arc<MediaSetup>,
    devices: Arc<DeviceManager>,
}

impl AgentRoomPolicy {
    pub fn new(setup: Arc<MediaSetup>, devices: Arc<DeviceManager>) -> Self {
        Self { setup, devices }
    }

    async fn build(
        &self,
        peer_id: &PeerId,
        self_description: &str,
        open_channel: bool,
    ) -> Result<Option<Arc<PeerSession>>, SessionError> {
        let stream = self
            .devices
            .capture_for(self_description)
            .await
            .map_err(|e| SessionError::LocalMedia(e.to_string()))?;
        let session = session_with_stream(&self.setup, peer_id, &stream).await?;

        let log_peer = peer_id.clone();
        session.on_message(move |text| {
            info!(peer_id = %log_peer, len = text.len(), message = %text, "Data channel message received");
        });

        if open_channel {
            if let Err(e) = session.create_data_channel(AGENT_CHANNEL_LABEL).await {
                session.close().await;
                return Err(e);
            }
            debug!(peer_id = %peer_id, "Opened agent data channel");
        }
        Ok(Some(session))
    }
}

#[async_trait]
impl PeerPolicy for AgentRoomPolicy {
    async fn on_peer_added(
        &self,
        peer_id: &PeerId,
        self_description: &str,
    ) -> Result<Option<Arc<PeerSession>>, SessionError> {
        self.build(
            peer_id,
            self_description,
            self_description == AGENT_DESCRIPTION,
        )
        .await
    }

    async fn on_connection_request(
        &self,
        peer_id: &PeerId,
        self_description: &str,
    ) -> Result<Option<Arc<PeerSession>>, SessionError> {
        self.build(peer_id, self_description, false).await
    }
}
