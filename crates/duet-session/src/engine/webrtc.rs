use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use duet_proto::{IceCandidate, SdpKind, SessionDescription};

use super::{
    Connectivity, EngineEvent, EngineEventSink, LocalMedia, MediaHandle, MediaKind,
    TransportEngine,
};
use crate::config::CallConfig;
use crate::error::{EngineError, EngineOp};

const LOCAL_STREAM_ID: &str = "localStream";
const VIDEO_TRACK_ID: &str = "video0";
const AUDIO_TRACK_ID: &str = "audio0";

struct LocalTracks {
    video: Arc<TrackLocalStaticSample>,
    audio: Arc<TrackLocalStaticSample>,
}

/// [`TransportEngine`] backed by a webrtc-rs peer connection.
///
/// Local tracks are sample-based; whatever captures camera and microphone
/// writes into [`WebRtcEngine::local_video_track`] and
/// [`WebRtcEngine::local_audio_track`].
pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    tracks: Mutex<Option<LocalTracks>>,
}

impl WebRtcEngine {
    pub async fn new(config: &CallConfig, events: EngineEventSink) -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(to_setup_error)?;

        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(config),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(to_setup_error)?,
        );
        install_callbacks(&pc, events);

        tracing::debug!(
            target: "duet::engine",
            ice_servers = ?config.ice_servers,
            "peer connection created"
        );
        Ok(Self {
            pc,
            tracks: Mutex::new(None),
        })
    }

    pub fn local_video_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.tracks.lock().as_ref().map(|tracks| tracks.video.clone())
    }

    pub fn local_audio_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.tracks.lock().as_ref().map(|tracks| tracks.audio.clone())
    }

    async fn add_local_track(
        &self,
        mime_type: &str,
        clock_rate: u32,
        channels: u16,
        track_id: &str,
    ) -> Result<Arc<TrackLocalStaticSample>, EngineError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                clock_rate,
                channels,
                ..Default::default()
            },
            track_id.to_string(),
            LOCAL_STREAM_ID.to_string(),
        ));
        self.pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|err| EngineError::operation(EngineOp::CreateLocalMedia, err))?;
        Ok(track)
    }
}

fn install_callbacks(pc: &Arc<RTCPeerConnection>, events: EngineEventSink) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                tracing::debug!(target: "duet::engine", "candidate gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    sink.emit(EngineEvent::LocalCandidate(from_candidate_init(init)));
                }
                Err(err) => {
                    tracing::warn!(
                        target: "duet::engine",
                        error = %err,
                        "failed to serialize local candidate"
                    );
                }
            }
        })
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            tracing::debug!(target: "duet::engine", ?state, "peer connection state changed");
            sink.emit(EngineEvent::Connectivity(connectivity(state)));
        })
    }));

    let sink = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let sink = sink.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    other => {
                        tracing::debug!(target: "duet::engine", ?other, "ignoring track");
                        return;
                    }
                };
                sink.emit(EngineEvent::RemoteStream(MediaHandle::new(
                    kind,
                    track.id(),
                    track.stream_id(),
                )));
                // Rendering is up to the consumer; keep the receive pipeline moving.
                tokio::spawn(async move {
                    while track.read_rtp().await.is_ok() {}
                });
            })
        },
    ));
}

fn ice_servers(config: &CallConfig) -> Vec<RTCIceServer> {
    if config.ice_servers.is_empty() {
        return Vec::new();
    }
    vec![RTCIceServer {
        urls: config.ice_servers.clone(),
        ..Default::default()
    }]
}

fn connectivity(state: RTCPeerConnectionState) -> Connectivity {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Connectivity::New,
        RTCPeerConnectionState::Connecting => Connectivity::Connecting,
        RTCPeerConnectionState::Connected => Connectivity::Connected,
        RTCPeerConnectionState::Disconnected => Connectivity::Disconnected,
        RTCPeerConnectionState::Failed => Connectivity::Failed,
        RTCPeerConnectionState::Closed => Connectivity::Closed,
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate::new(
        init.candidate,
        init.sdp_mline_index,
        init.sdp_mid.unwrap_or_default(),
    )
}

/// An empty mid means the sender had none.
fn to_candidate_init(candidate: &IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate.clone(),
        sdp_mid: (!candidate.sdp_mid.is_empty()).then(|| candidate.sdp_mid.clone()),
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, webrtc::Error> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    }
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> EngineError {
    EngineError::Setup(err.to_string())
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    async fn create_local_media(&self) -> Result<LocalMedia, EngineError> {
        if self.tracks.lock().is_none() {
            let video = self
                .add_local_track(MIME_TYPE_VP8, 90_000, 0, VIDEO_TRACK_ID)
                .await?;
            let audio = self
                .add_local_track(MIME_TYPE_OPUS, 48_000, 2, AUDIO_TRACK_ID)
                .await?;
            *self.tracks.lock() = Some(LocalTracks { video, audio });
        }
        Ok(LocalMedia {
            video: MediaHandle::new(MediaKind::Video, VIDEO_TRACK_ID, LOCAL_STREAM_ID),
            audio: MediaHandle::new(MediaKind::Audio, AUDIO_TRACK_ID, LOCAL_STREAM_ID),
        })
    }

    async fn generate_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| EngineError::operation(EngineOp::GenerateOffer, err))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn generate_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| EngineError::operation(EngineOp::GenerateAnswer, err))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        let rtc = to_rtc(description)
            .map_err(|err| EngineError::operation(EngineOp::SetLocalDescription, err))?;
        self.pc
            .set_local_description(rtc)
            .await
            .map_err(|err| EngineError::operation(EngineOp::SetLocalDescription, err))
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        let rtc = to_rtc(description)
            .map_err(|err| EngineError::operation(EngineOp::SetRemoteDescription, err))?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(|err| EngineError::operation(EngineOp::SetRemoteDescription, err))
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(|err| EngineError::operation(EngineOp::AddRemoteCandidate, err))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pc
            .close()
            .await
            .map_err(|err| EngineError::operation(EngineOp::Close, err))
    }
}
