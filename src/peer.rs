//! Per-peer transport: the negotiation state machine and the WebRTC-backed
//! implementation behind it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::AudioPlayback;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::media::{MediaHandle, TrackKind};
use crate::session::SessionEvent;

/// Lifecycle of one peer connection. Transitions are monotonic; the only
/// transition allowed from every phase is into `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Created,
    OfferSent,
    AnswerSent,
    Connected,
    Closed,
}

impl PeerPhase {
    fn rank(self) -> u8 {
        match self {
            PeerPhase::Created => 0,
            PeerPhase::OfferSent | PeerPhase::AnswerSent => 1,
            PeerPhase::Connected => 2,
            PeerPhase::Closed => 3,
        }
    }

    pub fn can_advance_to(self, next: PeerPhase) -> bool {
        if self == PeerPhase::Closed {
            return false;
        }
        next == PeerPhase::Closed || next.rank() > self.rank()
    }

    /// A remote offer is only applied before any description exchange; a
    /// duplicate or out-of-order offer mid-session would corrupt negotiation.
    pub fn accepts_offer(self) -> bool {
        self == PeerPhase::Created
    }

    pub fn accepts_answer(self) -> bool {
        self == PeerPhase::OfferSent
    }
}

impl fmt::Display for PeerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerPhase::Created => write!(f, "created"),
            PeerPhase::OfferSent => write!(f, "offer-sent"),
            PeerPhase::AnswerSent => write!(f, "answer-sent"),
            PeerPhase::Connected => write!(f, "connected"),
            PeerPhase::Closed => write!(f, "closed"),
        }
    }
}

/// Negotiation surface of one peer connection. Session descriptions travel
/// as JSON-encoded strings, candidates as raw candidate lines.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<String>;
    /// Applies a remote offer and returns the local answer.
    async fn apply_offer(&self, sdp: &str) -> Result<String>;
    async fn apply_answer(&self, sdp: &str) -> Result<()>;
    async fn add_remote_candidate(&self, candidate: &str) -> Result<()>;
    /// Swaps the outbound video track in place on the existing sender,
    /// without renegotiating the session.
    async fn replace_video_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Creates transports with the local capture tracks attached and transport
/// callbacks routed into the session event stream.
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        media: &MediaHandle,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<dyn PeerTransport>>;
}

fn negotiation_error(peer: &str, err: impl fmt::Display) -> Error {
    Error::NegotiationFailed {
        peer: peer.to_owned(),
        reason: err.to_string(),
    }
}

pub struct RtcTransportFactory {
    ice_servers: Vec<String>,
}

impl RtcTransportFactory {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
        }
    }
}

#[async_trait]
impl PeerTransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        media: &MediaHandle,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| negotiation_error(peer_id, e))?;
        let api = APIBuilder::new().with_media_engine(media_engine).build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| negotiation_error(peer_id, e))?,
        );

        for track in media.tracks() {
            pc.add_track(track)
                .await
                .map_err(|e| negotiation_error(peer_id, e))?;
        }

        let events_tx = events.clone();
        let peer = peer_id.to_owned();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events_tx = events_tx.clone();
            let peer = peer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Ok(init) = candidate.to_json() else { return };
                let _ = events_tx
                    .send(SessionEvent::LocalCandidate {
                        peer,
                        candidate: init.candidate,
                    })
                    .await;
            })
        }));

        let events_tx = events.clone();
        let peer = peer_id.to_owned();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events_tx = events_tx.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        _ => TrackKind::Video,
                    };
                    let stream_id = track.stream_id();
                    if kind == TrackKind::Audio {
                        AudioPlayback::spawn(Arc::clone(&track));
                    }
                    let _ = events_tx
                        .send(SessionEvent::TrackArrived {
                            peer,
                            stream_id,
                            kind,
                        })
                        .await;
                })
            },
        ));

        let events_tx = events;
        let peer = peer_id.to_owned();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events_tx = events_tx.clone();
            let peer = peer.clone();
            Box::pin(async move {
                let event = match state {
                    RTCPeerConnectionState::Connected => {
                        Some(SessionEvent::TransportConnected { peer })
                    }
                    RTCPeerConnectionState::Failed => Some(SessionEvent::NegotiationFailed {
                        peer,
                        reason: "transport failed".to_owned(),
                    }),
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                        Some(SessionEvent::TransportClosed { peer })
                    }
                    _ => None,
                };
                if let Some(event) = event {
                    let _ = events_tx.send(event).await;
                }
            })
        }));

        Ok(Arc::new(RtcPeerTransport {
            peer: peer_id.to_owned(),
            pc,
        }))
    }
}

pub struct RtcPeerTransport {
    peer: String,
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| negotiation_error(&self.peer, e))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| negotiation_error(&self.peer, e))?;
        serde_json::to_string(&offer).map_err(|e| negotiation_error(&self.peer, e))
    }

    async fn apply_offer(&self, sdp: &str) -> Result<String> {
        let offer = serde_json::from_str(sdp).map_err(|e| negotiation_error(&self.peer, e))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| negotiation_error(&self.peer, e))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| negotiation_error(&self.peer, e))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| negotiation_error(&self.peer, e))?;
        serde_json::to_string(&answer).map_err(|e| negotiation_error(&self.peer, e))
    }

    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        let answer = serde_json::from_str(sdp).map_err(|e| negotiation_error(&self.peer, e))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| negotiation_error(&self.peer, e))
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_owned(),
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| negotiation_error(&self.peer, e))
    }

    async fn replace_video_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()> {
        for sender in self.pc.get_senders().await {
            let is_video = match sender.track().await {
                Some(existing) => existing.kind() == RTPCodecType::Video,
                None => false,
            };
            if is_video {
                sender
                    .replace_track(Some(Arc::clone(&track)))
                    .await
                    .map_err(|e| negotiation_error(&self.peer, e))?;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| negotiation_error(&self.peer, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_monotonically() {
        assert!(PeerPhase::Created.can_advance_to(PeerPhase::OfferSent));
        assert!(PeerPhase::Created.can_advance_to(PeerPhase::AnswerSent));
        assert!(PeerPhase::OfferSent.can_advance_to(PeerPhase::Connected));
        assert!(PeerPhase::AnswerSent.can_advance_to(PeerPhase::Connected));
        assert!(!PeerPhase::Connected.can_advance_to(PeerPhase::OfferSent));
        assert!(!PeerPhase::OfferSent.can_advance_to(PeerPhase::Created));
    }

    #[test]
    fn every_open_phase_can_close() {
        for phase in [
            PeerPhase::Created,
            PeerPhase::OfferSent,
            PeerPhase::AnswerSent,
            PeerPhase::Connected,
        ] {
            assert!(phase.can_advance_to(PeerPhase::Closed));
        }
        assert!(!PeerPhase::Closed.can_advance_to(PeerPhase::Connected));
    }

    #[test]
    fn description_guards() {
        assert!(PeerPhase::Created.accepts_offer());
        assert!(!PeerPhase::Connected.accepts_offer());
        assert!(!PeerPhase::AnswerSent.accepts_offer());
        assert!(PeerPhase::OfferSent.accepts_answer());
        assert!(!PeerPhase::Connected.accepts_answer());
    }
}
