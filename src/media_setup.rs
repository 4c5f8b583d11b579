use std::sync::Arc;
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};

use crate::error::SessionError;
use crate::id_types::PeerId;
use crate::media::MediaKind;
use crate::peer_session::PeerSession;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Shared WebRTC API plus the ICE configuration every session is created with.
pub struct MediaSetup {
    api: API,
    config: RTCConfiguration,
}

impl MediaSetup {
    pub fn new(stun_urls: Vec<String>) -> Result<Self, SessionError> {
        Ok(Self {
            api: Self::create_webrtc_api()?,
            config: Self::rtc_config(stun_urls),
        })
    }

    pub fn create_webrtc_api() -> Result<API, SessionError> {
        let mut media_engine = MediaEngine::default();

        // Opus with FEC, matching what local audio tracks produce
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: MediaKind::Audio.codec_capability(),
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: MediaKind::Video.codec_capability(),
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "video/H264".to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line:
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                            .to_owned(),
                    ..Default::default()
                },
                payload_type: 102,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let extensions = [
            "urn:ietf:params:rtp-hdrext:sdes:mid",
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
            "urn:ietf:params:rtp-hdrext:ssrc-audio-level",
        ];
        for extension in extensions {
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                media_engine.register_header_extension(
                    RTCRtpHeaderExtensionCapability {
                        uri: extension.to_string(),
                    },
                    kind,
                    None,
                )?;
            }
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }

    pub fn rtc_config(stun_urls: Vec<String>) -> RTCConfiguration {
        let ice_servers = if stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: stun_urls,
                ..Default::default()
            }]
        };

        RTCConfiguration {
            ice_servers,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            ..Default::default()
        }
    }

    /// Opens a fresh peer connection for `peer_id`.
    pub async fn new_session(&self, peer_id: PeerId) -> Result<Arc<PeerSession>, SessionError> {
        let pc = self.api.new_peer_connection(self.config.clone()).await?;
        debug!(peer_id = %peer_id, "Created peer connection");
        Ok(PeerSession::new(peer_id, Arc::new(pc)))
    }
}
