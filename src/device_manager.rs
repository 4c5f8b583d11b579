use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::agent::AGENT_DESCRIPTION;
use crate::error::MediaError;
use crate::id_types::DeviceId;
use crate::media::{DeviceInfo, LocalStream, MediaConstraints, MediaKind, MediaProvider};
use crate::peer_session::PeerSession;

/// Owns the local capture state: the device list, the selected device per
/// kind, the local stream and the mute flags.
pub struct DeviceManager {
    provider: Arc<dyn MediaProvider>,
    devices: RwLock<Vec<DeviceInfo>>,
    selection: RwLock<MediaConstraints>,
    stream: Arc<LocalStream>,
    audio_muted: AtomicBool,
    video_muted: AtomicBool,
}

impl DeviceManager {
    pub fn new(provider: Arc<dyn MediaProvider>) -> Self {
        Self {
            provider,
            devices: RwLock::new(Vec::new()),
            selection: RwLock::new(MediaConstraints::default()),
            stream: Arc::new(LocalStream::new()),
            audio_muted: AtomicBool::new(false),
            video_muted: AtomicBool::new(false),
        }
    }

    /// Enumerates devices, selects the first of each kind and captures the local stream.
    pub async fn initialize(&self) -> Result<(), MediaError> {
        let devices = self.provider.enumerate_devices().await?;
        let mut selection = MediaConstraints::default();
        for kind in [MediaKind::Audio, MediaKind::Video] {
            *selection.slot_mut(kind) = devices
                .iter()
                .find(|d| d.kind == kind)
                .map(|d| d.device_id.clone());
        }
        info!(
            devices = devices.len(),
            audio = ?selection.audio,
            video = ?selection.video,
            "Media devices initialized"
        );

        let captured = self.provider.capture(&selection).await?;
        for track in captured.tracks() {
            if let Some(old) = self.stream.replace_track(track) {
                old.stop();
            }
        }

        *self.devices.write() = devices;
        *self.selection.write() = selection;
        Ok(())
    }

    pub fn devices(&self, kind: MediaKind) -> Vec<DeviceInfo> {
        self.devices
            .read()
            .iter()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect()
    }

    pub fn selected(&self, kind: MediaKind) -> Option<DeviceId> {
        self.selection.read().device(kind).cloned()
    }

    pub fn local_stream(&self) -> Arc<LocalStream> {
        self.stream.clone()
    }

    /// Agents only get audio.
    pub fn constraints_for(&self, self_description: &str) -> MediaConstraints {
        let mut constraints = self.selection.read().clone();
        if self_description == AGENT_DESCRIPTION {
            constraints.video = None;
        }
        constraints
    }

    /// Captures a fresh stream for one remote peer, honouring the current mute state.
    pub async fn capture_for(&self, self_description: &str) -> Result<LocalStream, MediaError> {
        let stream = self
            .provider
            .capture(&self.constraints_for(self_description))
            .await?;
        for track in stream.tracks() {
            track.set_enabled(!self.is_muted(track.kind()));
        }
        Ok(stream)
    }

    /// Switches `kind` to `device_id` locally and on every session, without renegotiation.
    pub async fn replace_track(
        &self,
        kind: MediaKind,
        device_id: DeviceId,
        sessions: &[Arc<PeerSession>],
    ) -> Result<(), MediaError> {
        let known = self
            .devices
            .read()
            .iter()
            .any(|d| d.kind == kind && d.device_id == device_id);
        if !known {
            return Err(MediaError::DeviceNotFound {
                kind,
                device_id: device_id.to_string(),
            });
        }

        let captured = self
            .provider
            .capture(&MediaConstraints::only(kind, device_id.clone()))
            .await?;
        let track = captured
            .track(kind)
            .ok_or(MediaError::NoLocalTrack(kind))?;
        track.set_enabled(!self.is_muted(kind));

        if let Some(old) = self.stream.replace_track(track.clone()) {
            old.stop();
        }

        for session in sessions {
            let previous = session.outbound_track(kind);
            match session.replace_outbound_track(kind, track.clone()).await {
                Ok(true) => {
                    if let Some(previous) = previous.filter(|p| !Arc::ptr_eq(p, &track)) {
                        previous.stop();
                    }
                    debug!(peer_id = %session.peer_id(), %kind, "Replaced outbound track");
                }
                Ok(false) => {
                    debug!(peer_id = %session.peer_id(), %kind, "Session publishes no track of this kind")
                }
                Err(e) => {
                    warn!(peer_id = %session.peer_id(), %kind, error = %e, "Failed to replace outbound track")
                }
            }
        }

        *self.selection.write().slot_mut(kind) = Some(device_id.clone());
        info!(%kind, device_id = %device_id, "Switched media device");
        Ok(())
    }

    /// Flips mute for `kind` locally and on every session. Returns the new muted state.
    pub fn toggle_mute(
        &self,
        kind: MediaKind,
        sessions: &[Arc<PeerSession>],
    ) -> Result<bool, MediaError> {
        let track = self
            .stream
            .track(kind)
            .ok_or(MediaError::NoLocalTrack(kind))?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        self.muted_flag(kind).store(!enabled, Ordering::Release);

        for session in sessions {
            session.set_outbound_enabled(kind, enabled);
        }
        info!(%kind, muted = !enabled, sessions = sessions.len(), "Toggled mute");
        Ok(!enabled)
    }

    pub fn is_muted(&self, kind: MediaKind) -> bool {
        self.muted_flag(kind).load(Ordering::Acquire)
    }

    fn muted_flag(&self, kind: MediaKind) -> &AtomicBool {
        match kind {
            MediaKind::Audio => &self.audio_muted,
            MediaKind::Video => &self.video_muted,
        }
    }

    pub fn stop_all(&self) {
        self.stream.stop_all();
    }
}
