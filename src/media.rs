use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::MediaError;
use crate::id_types::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn codec_type(self) -> RTPCodecType {
        match self {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        }
    }

    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        }
    }

    /// Codec used for locally captured tracks of this kind.
    pub fn codec_capability(self) -> RTCRtpCodecCapability {
        match self {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    pub label: String,
    pub kind: MediaKind,
}

/// Which device to capture for each kind. `None` means the kind is not captured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: Option<DeviceId>,
    pub video: Option<DeviceId>,
}

impl MediaConstraints {
    pub fn only(kind: MediaKind, device_id: DeviceId) -> Self {
        let mut constraints = Self::default();
        *constraints.slot_mut(kind) = Some(device_id);
        constraints
    }

    pub fn device(&self, kind: MediaKind) -> Option<&DeviceId> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    pub fn slot_mut(&mut self, kind: MediaKind) -> &mut Option<DeviceId> {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// A locally produced track. Samples are written by whatever feeds the
/// device; the `enabled` flag is the mute switch.
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    device_id: DeviceId,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, device_id: DeviceId, stream_id: &str) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let rtc = Arc::new(TrackLocalStaticSample::new(
            kind.codec_capability(),
            id.clone(),
            stream_id.to_owned(),
        ));
        Arc::new(Self {
            id,
            kind,
            device_id,
            rtc,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.rtc) as Arc<dyn TrackLocal + Send + Sync>
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Forwards one media sample. Returns `Ok(false)` when the sample was
    /// dropped because the track is muted or stopped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, MediaError> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(false);
        }
        self.rtc
            .write_sample(sample)
            .await
            .map_err(|e| MediaError::Capture(e.to_string()))?;
        Ok(true)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("device_id", &self.device_id)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// An ordered set of local tracks, at most one per kind.
#[derive(Debug)]
pub struct LocalStream {
    id: String,
    tracks: RwLock<Vec<Arc<LocalTrack>>>,
}

impl LocalStream {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.tracks.read().clone()
    }

    pub fn track(&self, kind: MediaKind) -> Option<Arc<LocalTrack>> {
        self.tracks.read().iter().find(|t| t.kind() == kind).cloned()
    }

    /// Inserts `track`, returning the track of the same kind it displaced.
    pub fn replace_track(&self, track: Arc<LocalTrack>) -> Option<Arc<LocalTrack>> {
        let mut tracks = self.tracks.write();
        match tracks.iter_mut().find(|t| t.kind() == track.kind()) {
            Some(slot) => Some(std::mem::replace(slot, track)),
            None => {
                tracks.push(track);
                None
            }
        }
    }

    pub fn stop_all(&self) {
        for track in self.tracks.read().iter() {
            track.stop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }
}

impl Default for LocalStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks received from a remote peer, in arrival order.
#[derive(Default)]
pub struct RemoteStream {
    tracks: RwLock<Vec<Arc<TrackRemote>>>,
}

impl RemoteStream {
    pub fn push(&self, track: Arc<TrackRemote>) {
        self.tracks.write().push(track);
    }

    pub fn tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.tracks.read().clone()
    }

    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }
}

/// Source of capture devices and local streams.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaError>;

    async fn capture(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError>;
}

/// Serves a fixed device list. Captured tracks are sample-fed; the provider
/// keeps them reachable through [`StaticMediaProvider::live_tracks`] so an
/// external pipeline can push frames into them.
pub struct StaticMediaProvider {
    devices: Vec<DeviceInfo>,
    live: Mutex<Vec<Arc<LocalTrack>>>,
}

impl StaticMediaProvider {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            live: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default_devices() -> Self {
        Self::new(vec![
            DeviceInfo {
                device_id: DeviceId::from("default-audio"),
                label: "Default Microphone".to_owned(),
                kind: MediaKind::Audio,
            },
            DeviceInfo {
                device_id: DeviceId::from("default-video"),
                label: "Default Camera".to_owned(),
                kind: MediaKind::Video,
            },
        ])
    }

    /// Captured tracks that have not been stopped yet.
    pub fn live_tracks(&self) -> Vec<Arc<LocalTrack>> {
        let mut live = self.live.lock();
        live.retain(|t| !t.is_stopped());
        live.clone()
    }
}

#[async_trait]
impl MediaProvider for StaticMediaProvider {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaError> {
        Ok(self.devices.clone())
    }

    async fn capture(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        let stream = LocalStream::new();
        for kind in [MediaKind::Audio, MediaKind::Video] {
            let Some(device_id) = constraints.device(kind) else {
                continue;
            };
            if !self
                .devices
                .iter()
                .any(|d| d.kind == kind && &d.device_id == device_id)
            {
                return Err(MediaError::DeviceNotFound {
                    kind,
                    device_id: device_id.to_string(),
                });
            }
            let track = LocalTrack::new(kind, device_id.clone(), stream.id());
            self.live.lock().push(track.clone());
            stream.replace_track(track);
        }
        Ok(stream)
    }
}
