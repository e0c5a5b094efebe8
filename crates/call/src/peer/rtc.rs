//! [`PeerTransport`] backed by webrtc-rs

use super::transport::{
    ConnectionState, PeerTransport, RemoteTrack, SenderId, TransportEvent, TransportFactory,
};
use crate::config::CallConfig;
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Builds [`RtcPeerTransport`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcTransportFactory;

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self, config: &CallConfig) -> Result<Arc<dyn PeerTransport>> {
        Ok(Arc::new(RtcPeerTransport::new(config).await?))
    }
}

/// WebRTC peer connection wrapper
pub struct RtcPeerTransport {
    peer_connection: Arc<RTCPeerConnection>,
    stream_id: String,
    senders: Mutex<HashMap<SenderId, Arc<RTCRtpSender>>>,
    next_sender: AtomicU32,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl RtcPeerTransport {
    #[instrument(skip(config))]
    pub async fn new(config: &CallConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ice_candidate_pool_size: config.ice_candidate_pool_size,
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        let (tx, rx) = mpsc::unbounded_channel();
        Self::register_handlers(&peer_connection, tx);

        info!("Created peer connection");

        Ok(Self {
            peer_connection,
            stream_id: uuid::Uuid::new_v4().to_string(),
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU32::new(0),
            events: Mutex::new(Some(rx)),
        })
    }

    fn register_handlers(pc: &RTCPeerConnection, tx: mpsc::UnboundedSender<TransportEvent>) {
        let candidate_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    let _ = tx.send(TransportEvent::GatheringComplete);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let track_tx = tx.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };
            if let Some(kind) = kind {
                debug!("Remote {:?} track {} on stream {}", kind, track.id(), track.stream_id());
                let _ = track_tx.send(TransportEvent::RemoteTrack {
                    stream_id: track.stream_id(),
                    track: RemoteTrack {
                        id: track.id(),
                        kind,
                    },
                });
            }
            Box::pin(async {})
        }));

        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state = match s {
                RTCPeerConnectionState::New => Some(ConnectionState::New),
                RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                _ => None,
            };
            if let Some(state) = state {
                debug!("Peer connection state: {:?}", state);
                let _ = tx.send(TransportEvent::ConnectionState(state));
            }
            Box::pin(async {})
        }));
    }

    fn local_track(&self, track: &MediaTrack) -> Arc<TrackLocalStaticSample> {
        let capability = match track.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id().to_string(),
            self.stream_id.clone(),
        ))
    }

    fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription> {
        let parsed = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
        };
        parsed.map_err(|e| Error::SdpError(format!("Failed to parse {:?}: {}", description.kind, e)))
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<SenderId> {
        let local = self.local_track(track);
        let sender = self
            .peer_connection
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to add track: {}", e)))?;

        let id = SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst));
        self.senders.lock().insert(id, sender);
        debug!("Added {:?} track {} as sender {:?}", track.kind(), track.id(), id);
        Ok(id)
    }

    async fn replace_track(&self, sender: SenderId, track: &MediaTrack) -> Result<()> {
        let rtp_sender = self
            .senders
            .lock()
            .get(&sender)
            .cloned()
            .ok_or_else(|| Error::MediaTrackError(format!("Unknown sender {:?}", sender)))?;

        let local = self.local_track(track);
        rtp_sender
            .replace_track(Some(local as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to replace track: {}", e)))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(Self::to_rtc(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(Self::to_rtc(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close: {}", e)))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.lock().take()
    }
}
