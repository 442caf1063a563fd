use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::candidate::candidate_base::unmarshal_candidate;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::media::LocalMedia;
use crate::error::{Result, SessionError};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

/// Things the underlying connection reports on its own schedule.
#[derive(Debug, Clone)]
pub enum PeerEvent<T> {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    RemoteTrack(T),
}

pub type PeerEvents<T> = mpsc::UnboundedReceiver<PeerEvent<T>>;

/// A received media track, grouped by the stream it belongs to.
pub trait RemoteTrack: Clone + Send + Sync + 'static {
    fn stream_id(&self) -> String;
}

impl RemoteTrack for Arc<TrackRemote> {
    fn stream_id(&self) -> String {
        TrackRemote::stream_id(self)
    }
}

/// The peer connection as seen by negotiation.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Remote media handle handed to the rendering side.
    type Track: RemoteTrack;

    async fn add_local_media(&self, media: &LocalMedia) -> Result<()>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    /// Discard a local offer that has not been answered.
    async fn rollback(&self) -> Result<()>;
    /// Syntax check only; runs before a candidate is queued or applied.
    fn check_candidate(&self, candidate: &IceCandidate) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

fn negotiation_error(step: &str, e: webrtc::Error) -> SessionError {
    SessionError::Negotiation(format!("Failed to {}: {}", step, e))
}

/// `PeerTransport` over a webrtc-rs peer connection.
pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
}

impl WebRtcPeer {
    /// Build the peer connection with the given STUN/TURN urls, fixed for its lifetime.
    pub async fn connect(ice_servers: &[String]) -> Result<(Self, PeerEvents<Arc<TrackRemote>>)> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()
            .map_err(|e| negotiation_error("register codecs", e))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)
            .map_err(|e| negotiation_error("register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| negotiation_error("create peer connection", e))?,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        Self::setup_handlers(&peer_connection, tx);

        Ok((Self { peer_connection }, rx))
    }

    fn setup_handlers(
        pc: &Arc<RTCPeerConnection>,
        tx: mpsc::UnboundedSender<PeerEvent<Arc<TrackRemote>>>,
    ) {
        let candidate_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let event = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => PeerEvent::LocalCandidate(from_candidate_init(init)),
                        Err(e) => {
                            tracing::warn!("Failed to convert ICE candidate to JSON: {}", e);
                            return;
                        }
                    },
                    None => PeerEvent::GatheringComplete,
                };
                let _ = tx.send(event);
            })
        }));

        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    tracing::info!(
                        "Remote {} track {} on stream {}",
                        track.kind(),
                        track.id(),
                        TrackRemote::stream_id(&track)
                    );
                    let _ = tx.send(PeerEvent::RemoteTrack(track));
                })
            },
        ));

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {}", state);
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    type Track = Arc<TrackRemote>;

    async fn add_local_media(&self, media: &LocalMedia) -> Result<()> {
        let audio: Arc<dyn TrackLocal + Send + Sync> = media.audio();
        let video: Arc<dyn TrackLocal + Send + Sync> = media.video();
        for track in [audio, video] {
            self.peer_connection
                .add_track(track)
                .await
                .map_err(|e| SessionError::MediaUnavailable(format!("Failed to add track: {}", e)))?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| negotiation_error("create offer", e))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| negotiation_error("create answer", e))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(|e| negotiation_error("set local description", e))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(|e| negotiation_error("set remote description", e))
    }

    async fn rollback(&self) -> Result<()> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.peer_connection
            .set_local_description(rollback)
            .await
            .map_err(|e| negotiation_error("roll back local offer", e))
    }

    fn check_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let raw = candidate
            .candidate
            .strip_prefix("candidate:")
            .unwrap_or(&candidate.candidate);
        // Empty means end of candidates.
        if raw.is_empty() {
            return Ok(());
        }
        unmarshal_candidate(raw)
            .map(|_| ())
            .map_err(|e| SessionError::MalformedEnvelope(format!("invalid ICE candidate: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.check_candidate(&candidate)?;
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| negotiation_error("add ICE candidate", e))
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| negotiation_error("close peer connection", e))
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            return Ok(rollback);
        }
    };
    parsed.map_err(|e| SessionError::MalformedEnvelope(format!("invalid SDP: {}", e)))
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(SessionError::Negotiation(
                "peer produced an unspecified description".to_owned(),
            ))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparsable_sdp_is_malformed_not_a_negotiation_failure() {
        let err = to_rtc(SessionDescription::offer("not an sdp")).unwrap_err();
        assert!(matches!(err, SessionError::MalformedEnvelope(_)));
        let err = to_rtc(SessionDescription::answer("")).unwrap_err();
        assert!(matches!(err, SessionError::MalformedEnvelope(_)));
    }

    #[test]
    fn rollback_needs_no_sdp() {
        let rollback = to_rtc(SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        })
        .unwrap();
        assert_eq!(rollback.sdp_type, RTCSdpType::Rollback);
    }

    #[test]
    fn unspecified_description_is_refused() {
        let err = from_rtc(RTCSessionDescription::default()).unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(_)));
    }

    #[tokio::test]
    async fn candidate_syntax_is_checked_before_the_agent_sees_it() {
        let (peer, _events) = WebRtcPeer::connect(&[]).await.unwrap();
        let host = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host".to_owned(),
            sdp_mid: Some("0".to_owned()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        assert_eq!(peer.check_candidate(&host), Ok(()));

        let garbage = IceCandidate {
            candidate: "garbage".to_owned(),
            ..host.clone()
        };
        assert!(matches!(
            peer.check_candidate(&garbage),
            Err(SessionError::MalformedEnvelope(_))
        ));

        let end_of_candidates = IceCandidate {
            candidate: String::new(),
            ..host
        };
        assert_eq!(peer.check_candidate(&end_of_candidates), Ok(()));
        peer.close().await.unwrap();
    }
}
