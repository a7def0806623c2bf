//! Peer session management.
//!
//! One reducer owns the peer-connection map and the remote participant
//! roster. Everything that can mutate them — signaling messages, transport
//! callbacks, completed negotiation steps — arrives as a `SessionEvent`, so
//! ordering is explicit and the whole state machine is testable without a
//! live transport. Slow negotiation work (SDP generation and application)
//! runs in spawned tasks that report back as events; the reducer itself
//! never waits on one peer while others have traffic.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::media::{MediaHandle, TrackKind};
use crate::peer::{PeerPhase, PeerTransport, PeerTransportFactory};
use crate::signaling::SignalingMessage;
use webrtc::track::track_local::TrackLocal;

pub type ParticipantId = String;

/// Remote participant state as exposed to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub media: Option<RemoteMedia>,
    pub video_active: bool,
    pub audio_active: bool,
}

impl Default for Participant {
    fn default() -> Self {
        Self {
            media: None,
            video_active: true,
            audio_active: true,
        }
    }
}

/// Inbound media negotiated for a participant. Live track handles stay in
/// the transport layer (audio is routed straight to playback); the roster
/// records which kinds have arrived and under which stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteMedia {
    pub stream_id: String,
    pub has_audio: bool,
    pub has_video: bool,
}

/// The remote participant collection: single source of truth for rendering.
/// All updates merge into existing entries; a flag learned before the track
/// arrives survives the track arriving, and vice versa.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    entries: HashMap<ParticipantId, Participant>,
}

impl Roster {
    pub fn ensure(&mut self, id: &str) -> &mut Participant {
        self.entries.entry(id.to_owned()).or_default()
    }

    pub fn attach_media(&mut self, id: &str, stream_id: &str, kind: TrackKind) {
        let entry = self.ensure(id);
        let media = entry.media.get_or_insert_with(RemoteMedia::default);
        if media.stream_id.is_empty() {
            media.stream_id = stream_id.to_owned();
        }
        match kind {
            TrackKind::Audio => media.has_audio = true,
            TrackKind::Video => media.has_video = true,
        }
    }

    pub fn set_video_active(&mut self, id: &str, enabled: bool) {
        self.ensure(id).video_active = enabled;
    }

    pub fn set_audio_active(&mut self, id: &str, enabled: bool) {
        self.ensure(id).audio_active = enabled;
    }

    pub fn clear_media(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.media = None;
        }
    }

    pub fn remove(&mut self, id: &str) {
        self.entries.remove(id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &HashMap<ParticipantId, Participant> {
        &self.entries
    }
}

/// Everything that can change session state.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Occupant snapshot delivered on join; one connection is initiated per id.
    Occupants(Vec<ParticipantId>),
    /// A participant joined after us; we hold a connection ready and answer
    /// their offer.
    PeerJoined(ParticipantId),
    PeerLeft(ParticipantId),
    OfferReceived { from: ParticipantId, sdp: String },
    AnswerReceived { from: ParticipantId, sdp: String },
    CandidateReceived { from: ParticipantId, candidate: String },
    /// Local SDP work finished in a spawned task.
    OfferReady { peer: ParticipantId, sdp: String },
    AnswerReady { peer: ParticipantId, sdp: String },
    AnswerApplied { peer: ParticipantId },
    NegotiationFailed { peer: ParticipantId, reason: String },
    TransportConnected { peer: ParticipantId },
    TransportClosed { peer: ParticipantId },
    LocalCandidate { peer: ParticipantId, candidate: String },
    TrackArrived {
        peer: ParticipantId,
        stream_id: String,
        kind: TrackKind,
    },
    RemoteVideoState { peer: ParticipantId, enabled: bool },
    RemoteAudioState { peer: ParticipantId, enabled: bool },
    InitialVideoStates(HashMap<ParticipantId, bool>),
    InitialAudioStates(HashMap<ParticipantId, bool>),
}

struct PeerEntry {
    transport: Arc<dyn PeerTransport>,
    phase: PeerPhase,
    /// A negotiation step is in flight for this peer; further descriptions
    /// are ignored until it reports back.
    pending: bool,
}

/// Owns the peer map and roster. Mutated only from the driver task.
pub struct PeerSessionManager {
    peers: HashMap<ParticipantId, PeerEntry>,
    roster: Roster,
    factory: Arc<dyn PeerTransportFactory>,
    events_tx: mpsc::Sender<SessionEvent>,
    outbound: Option<mpsc::Sender<SignalingMessage>>,
    local_media: Option<Arc<MediaHandle>>,
}

impl PeerSessionManager {
    pub fn new(factory: Arc<dyn PeerTransportFactory>, events_tx: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            peers: HashMap::new(),
            roster: Roster::default(),
            factory,
            events_tx,
            outbound: None,
            local_media: None,
        }
    }

    /// Activates the session for a joined room: outbound signaling plus the
    /// shared local capture attached to every connection created from here.
    pub fn bind(&mut self, outbound: mpsc::Sender<SignalingMessage>, media: Arc<MediaHandle>) {
        self.outbound = Some(outbound);
        self.local_media = Some(media);
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    pub(crate) fn peer_phase(&self, id: &str) -> Option<PeerPhase> {
        self.peers.get(id).map(|entry| entry.phase)
    }

    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Occupants(ids) => {
                for id in ids {
                    self.roster.ensure(&id);
                    self.initiate(&id).await;
                }
            }
            SessionEvent::PeerJoined(id) => {
                info!(peer = %id, "participant joined");
                self.roster.ensure(&id);
                if self.peers.contains_key(&id) {
                    debug!(peer = %id, "replacing stale connection");
                    self.close_peer(&id);
                }
                // Responder path: the connection waits for the joiner's offer.
                if let Err(e) = self.create_peer(&id).await {
                    warn!(peer = %id, error = %e, "failed to prepare connection");
                }
            }
            SessionEvent::PeerLeft(id) => {
                info!(peer = %id, "participant disconnected");
                self.close_peer(&id);
                self.roster.remove(&id);
            }
            SessionEvent::OfferReceived { from, sdp } => self.on_offer(from, sdp).await,
            SessionEvent::AnswerReceived { from, sdp } => self.on_answer(from, sdp),
            SessionEvent::CandidateReceived { from, candidate } => {
                self.on_remote_candidate(from, candidate)
            }
            SessionEvent::OfferReady { peer, sdp } => {
                let Some(entry) = self.peers.get_mut(&peer) else {
                    debug!(peer = %peer, "offer ready for closed peer");
                    return;
                };
                entry.pending = false;
                if !entry.phase.can_advance_to(PeerPhase::OfferSent) {
                    debug!(peer = %peer, phase = %entry.phase, "not sending offer");
                    return;
                }
                entry.phase = PeerPhase::OfferSent;
                self.send(SignalingMessage::Offer {
                    sdp,
                    caller: None,
                    target: Some(peer),
                })
                .await;
            }
            SessionEvent::AnswerReady { peer, sdp } => {
                let Some(entry) = self.peers.get_mut(&peer) else {
                    debug!(peer = %peer, "answer ready for closed peer");
                    return;
                };
                entry.pending = false;
                if !entry.phase.can_advance_to(PeerPhase::AnswerSent) {
                    debug!(peer = %peer, phase = %entry.phase, "not sending answer");
                    return;
                }
                entry.phase = PeerPhase::AnswerSent;
                self.send(SignalingMessage::Answer {
                    sdp,
                    caller: None,
                    target: Some(peer),
                })
                .await;
            }
            SessionEvent::AnswerApplied { peer } => {
                if let Some(entry) = self.peers.get_mut(&peer) {
                    entry.pending = false;
                }
            }
            SessionEvent::NegotiationFailed { peer, reason } => {
                // Contained: this peer goes away, the session continues.
                warn!(peer = %peer, reason = %reason, "negotiation failed, dropping peer");
                self.close_peer(&peer);
                self.roster.clear_media(&peer);
            }
            SessionEvent::TransportConnected { peer } => {
                if let Some(entry) = self.peers.get_mut(&peer) {
                    if entry.phase.can_advance_to(PeerPhase::Connected) {
                        info!(peer = %peer, "peer connected");
                        entry.phase = PeerPhase::Connected;
                    }
                }
            }
            SessionEvent::TransportClosed { peer } => {
                debug!(peer = %peer, "transport closed");
                self.close_peer(&peer);
                self.roster.clear_media(&peer);
            }
            SessionEvent::LocalCandidate { peer, candidate } => {
                self.send(SignalingMessage::IceCandidate {
                    candidate,
                    from: None,
                    target: Some(peer),
                })
                .await;
            }
            SessionEvent::TrackArrived {
                peer,
                stream_id,
                kind,
            } => {
                self.roster.attach_media(&peer, &stream_id, kind);
            }
            SessionEvent::RemoteVideoState { peer, enabled } => {
                self.roster.set_video_active(&peer, enabled);
            }
            SessionEvent::RemoteAudioState { peer, enabled } => {
                self.roster.set_audio_active(&peer, enabled);
            }
            SessionEvent::InitialVideoStates(states) => {
                for (peer, enabled) in states {
                    self.roster.set_video_active(&peer, enabled);
                }
            }
            SessionEvent::InitialAudioStates(states) => {
                for (peer, enabled) in states {
                    self.roster.set_audio_active(&peer, enabled);
                }
            }
        }
    }

    /// Initiator path: connect out to a participant that was already in the
    /// room when we joined.
    async fn initiate(&mut self, id: &str) {
        if self.peers.contains_key(id) {
            debug!(peer = %id, "connection already exists");
            return;
        }
        let transport = match self.create_peer(id).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(peer = %id, error = %e, "failed to create connection");
                return;
            }
        };
        if let Some(entry) = self.peers.get_mut(id) {
            entry.pending = true;
        }
        let events = self.events_tx.clone();
        let peer = id.to_owned();
        tokio::spawn(async move {
            let event = match transport.create_offer().await {
                Ok(sdp) => SessionEvent::OfferReady { peer, sdp },
                Err(e) => SessionEvent::NegotiationFailed {
                    peer,
                    reason: e.to_string(),
                },
            };
            let _ = events.send(event).await;
        });
    }

    async fn on_offer(&mut self, from: ParticipantId, sdp: String) {
        let transport = match self.peers.get(&from) {
            Some(entry) if entry.pending || !entry.phase.accepts_offer() => {
                debug!(peer = %from, phase = %entry.phase, "ignoring out-of-order offer");
                return;
            }
            Some(entry) => Arc::clone(&entry.transport),
            None => {
                // Offers can outrun the membership broadcast; create the
                // connection on demand rather than dropping the message.
                self.roster.ensure(&from);
                match self.create_peer(&from).await {
                    Ok(transport) => transport,
                    Err(e) => {
                        warn!(peer = %from, error = %e, "failed to create connection for offer");
                        return;
                    }
                }
            }
        };
        if let Some(entry) = self.peers.get_mut(&from) {
            entry.pending = true;
        }
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match transport.apply_offer(&sdp).await {
                Ok(answer) => SessionEvent::AnswerReady {
                    peer: from,
                    sdp: answer,
                },
                Err(e) => SessionEvent::NegotiationFailed {
                    peer: from,
                    reason: e.to_string(),
                },
            };
            let _ = events.send(event).await;
        });
    }

    fn on_answer(&mut self, from: ParticipantId, sdp: String) {
        let Some(entry) = self.peers.get_mut(&from) else {
            debug!(peer = %from, "answer for unknown peer");
            return;
        };
        if entry.pending || !entry.phase.accepts_answer() {
            debug!(peer = %from, phase = %entry.phase, "ignoring duplicate answer");
            return;
        }
        entry.pending = true;
        let transport = Arc::clone(&entry.transport);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match transport.apply_answer(&sdp).await {
                Ok(()) => SessionEvent::AnswerApplied { peer: from },
                Err(e) => SessionEvent::NegotiationFailed {
                    peer: from,
                    reason: e.to_string(),
                },
            };
            let _ = events.send(event).await;
        });
    }

    fn on_remote_candidate(&mut self, from: ParticipantId, candidate: String) {
        let Some(entry) = self.peers.get(&from) else {
            // Connection not created yet; ICE renegotiation recovers.
            debug!(peer = %from, "dropping candidate for unknown peer");
            return;
        };
        let transport = Arc::clone(&entry.transport);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.add_remote_candidate(&candidate).await {
                let _ = events
                    .send(SessionEvent::NegotiationFailed {
                        peer: from,
                        reason: e.to_string(),
                    })
                    .await;
            }
        });
    }

    async fn create_peer(&mut self, id: &str) -> Result<Arc<dyn PeerTransport>> {
        let media = self
            .local_media
            .clone()
            .ok_or_else(|| Error::InvalidInput("no local media bound".to_owned()))?;
        let transport = self
            .factory
            .create(id, &media, self.events_tx.clone())
            .await?;
        self.peers.insert(
            id.to_owned(),
            PeerEntry {
                transport: Arc::clone(&transport),
                phase: PeerPhase::Created,
                pending: false,
            },
        );
        Ok(transport)
    }

    /// Closes and removes one peer connection. Later signaling for the same
    /// id is treated as a fresh peer.
    fn close_peer(&mut self, id: &str) {
        if let Some(entry) = self.peers.remove(id) {
            let transport = entry.transport;
            tokio::spawn(async move {
                if let Err(e) = transport.close().await {
                    debug!(error = %e, "error closing transport");
                }
            });
        }
    }

    /// Tears the whole session down: every transport closed, roster cleared,
    /// signaling unbound. Suspended negotiation tasks find their peer gone
    /// and no-op.
    pub fn close_all(&mut self) {
        let ids: Vec<ParticipantId> = self.peers.keys().cloned().collect();
        for id in ids {
            self.close_peer(&id);
        }
        self.roster.clear();
        self.outbound = None;
        self.local_media = None;
    }

    /// Live-swaps the outbound video track on every open connection.
    pub fn replace_video_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) {
        for (id, entry) in &self.peers {
            let transport = Arc::clone(&entry.transport);
            let track = Arc::clone(&track);
            let events = self.events_tx.clone();
            let peer = id.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.replace_video_track(track).await {
                    let _ = events
                        .send(SessionEvent::NegotiationFailed {
                            peer,
                            reason: e.to_string(),
                        })
                        .await;
                }
            });
        }
    }

    async fn send(&mut self, msg: SignalingMessage) {
        let Some(tx) = &self.outbound else {
            debug!("dropping outbound message, signaling not bound");
            return;
        };
        if tx.send(msg).await.is_err() {
            warn!("signaling channel closed");
            self.outbound = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockTransport {
        peer: String,
        offers_created: AtomicUsize,
        offers_applied: AtomicUsize,
        answers_applied: AtomicUsize,
        candidates: Mutex<Vec<String>>,
        closed: AtomicUsize,
        fail_offers: bool,
    }

    #[async_trait]
    impl PeerTransport for MockTransport {
        async fn create_offer(&self) -> Result<String> {
            if self.fail_offers {
                return Err(Error::NegotiationFailed {
                    peer: self.peer.clone(),
                    reason: "scripted failure".to_owned(),
                });
            }
            self.offers_created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("offer-from-local-to-{}", self.peer))
        }

        async fn apply_offer(&self, _sdp: &str) -> Result<String> {
            self.offers_applied.fetch_add(1, Ordering::SeqCst);
            Ok(format!("answer-from-local-to-{}", self.peer))
        }

        async fn apply_answer(&self, _sdp: &str) -> Result<()> {
            self.answers_applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn add_remote_candidate(&self, candidate: &str) -> Result<()> {
            self.candidates.lock().unwrap().push(candidate.to_owned());
            Ok(())
        }

        async fn replace_video_track(
            &self,
            _track: Arc<dyn TrackLocal + Send + Sync>,
        ) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockFactory {
        created: Mutex<Vec<Arc<MockTransport>>>,
        fail_offers: bool,
    }

    impl MockFactory {
        fn transport_for(&self, peer: &str) -> Option<Arc<MockTransport>> {
            self.created
                .lock()
                .unwrap()
                .iter()
                .find(|t| t.peer == peer)
                .cloned()
        }

        fn created_count(&self) -> usize {
            self.created.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PeerTransportFactory for MockFactory {
        async fn create(
            &self,
            peer_id: &str,
            _media: &MediaHandle,
            _events: mpsc::Sender<SessionEvent>,
        ) -> Result<Arc<dyn PeerTransport>> {
            let transport = Arc::new(MockTransport {
                peer: peer_id.to_owned(),
                fail_offers: self.fail_offers,
                ..Default::default()
            });
            self.created.lock().unwrap().push(Arc::clone(&transport));
            Ok(transport)
        }
    }

    struct Fixture {
        manager: PeerSessionManager,
        factory: Arc<MockFactory>,
        events_rx: mpsc::Receiver<SessionEvent>,
        outbound_rx: mpsc::Receiver<SignalingMessage>,
    }

    fn fixture() -> Fixture {
        fixture_with(MockFactory::default())
    }

    fn fixture_with(factory: MockFactory) -> Fixture {
        let factory = Arc::new(factory);
        let (events_tx, events_rx) = mpsc::channel(32);
        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        let mut manager = PeerSessionManager::new(Arc::clone(&factory) as _, events_tx);
        manager.bind(outbound_tx, Arc::new(MediaHandle::detached()));
        Fixture {
            manager,
            factory,
            events_rx,
            outbound_rx,
        }
    }

    impl Fixture {
        /// Waits for the next spawned-task completion and feeds it back in,
        /// the way the driver loop would.
        async fn pump(&mut self) {
            let event = self.events_rx.recv().await.expect("expected an event");
            self.manager.handle_event(event).await;
        }
    }

    #[tokio::test]
    async fn initiator_path_reaches_connected() {
        let mut fx = fixture();
        fx.manager
            .handle_event(SessionEvent::Occupants(vec!["a".into()]))
            .await;
        fx.pump().await; // OfferReady

        let msg = fx.outbound_rx.try_recv().expect("offer should be sent");
        let SignalingMessage::Offer { target, .. } = msg else {
            panic!("expected offer, got {msg:?}");
        };
        assert_eq!(target.as_deref(), Some("a"));
        assert_eq!(fx.manager.peer_phase("a"), Some(PeerPhase::OfferSent));

        fx.manager
            .handle_event(SessionEvent::AnswerReceived {
                from: "a".into(),
                sdp: "answer".into(),
            })
            .await;
        fx.pump().await; // AnswerApplied
        fx.manager
            .handle_event(SessionEvent::TransportConnected { peer: "a".into() })
            .await;
        assert_eq!(fx.manager.peer_phase("a"), Some(PeerPhase::Connected));
        let transport = fx.factory.transport_for("a").unwrap();
        assert_eq!(transport.answers_applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unexpected_offer_creates_connection_on_demand() {
        let mut fx = fixture();
        fx.manager
            .handle_event(SessionEvent::OfferReceived {
                from: "b".into(),
                sdp: "offer".into(),
            })
            .await;
        fx.pump().await; // AnswerReady

        let msg = fx.outbound_rx.try_recv().expect("answer should be sent");
        assert!(matches!(msg, SignalingMessage::Answer { target: Some(t), .. } if t == "b"));
        assert_eq!(fx.manager.peer_phase("b"), Some(PeerPhase::AnswerSent));
        // Roster entry appears with default flags even before any state event.
        assert_eq!(fx.manager.roster().get("b"), Some(&Participant::default()));
    }

    #[tokio::test]
    async fn duplicate_offer_is_ignored_after_answer() {
        let mut fx = fixture();
        fx.manager
            .handle_event(SessionEvent::OfferReceived {
                from: "b".into(),
                sdp: "offer".into(),
            })
            .await;
        fx.pump().await;
        fx.manager
            .handle_event(SessionEvent::OfferReceived {
                from: "b".into(),
                sdp: "offer-again".into(),
            })
            .await;

        let transport = fx.factory.transport_for("b").unwrap();
        assert_eq!(transport.offers_applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_answer_is_not_reapplied() {
        let mut fx = fixture();
        fx.manager
            .handle_event(SessionEvent::Occupants(vec!["a".into()]))
            .await;
        fx.pump().await; // OfferReady
        fx.manager
            .handle_event(SessionEvent::AnswerReceived {
                from: "a".into(),
                sdp: "answer".into(),
            })
            .await;
        fx.pump().await; // AnswerApplied
        fx.manager
            .handle_event(SessionEvent::TransportConnected { peer: "a".into() })
            .await;
        fx.manager
            .handle_event(SessionEvent::AnswerReceived {
                from: "a".into(),
                sdp: "answer-again".into(),
            })
            .await;

        let transport = fx.factory.transport_for("a").unwrap();
        assert_eq!(transport.answers_applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejoin_replaces_stale_connection() {
        let mut fx = fixture();
        fx.manager
            .handle_event(SessionEvent::PeerJoined("a".into()))
            .await;
        fx.manager
            .handle_event(SessionEvent::PeerJoined("a".into()))
            .await;

        assert_eq!(fx.manager.peer_count(), 1);
        assert_eq!(fx.factory.created_count(), 2);
        // The first transport was closed when it was replaced.
        let first = fx.factory.created.lock().unwrap()[0].clone();
        tokio::task::yield_now().await;
        assert_eq!(first.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn candidate_for_unknown_peer_is_dropped() {
        let mut fx = fixture();
        fx.manager
            .handle_event(SessionEvent::CandidateReceived {
                from: "ghost".into(),
                candidate: "candidate:1".into(),
            })
            .await;
        assert_eq!(fx.factory.created_count(), 0);
        assert!(fx.events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn candidates_reach_the_matching_connection() {
        let mut fx = fixture();
        fx.manager
            .handle_event(SessionEvent::PeerJoined("a".into()))
            .await;
        fx.manager
            .handle_event(SessionEvent::CandidateReceived {
                from: "a".into(),
                candidate: "candidate:42".into(),
            })
            .await;
        tokio::task::yield_now().await;

        let transport = fx.factory.transport_for("a").unwrap();
        assert_eq!(
            transport.candidates.lock().unwrap().as_slice(),
            &["candidate:42".to_owned()]
        );
    }

    #[tokio::test]
    async fn local_candidates_are_forwarded_addressed() {
        let mut fx = fixture();
        fx.manager
            .handle_event(SessionEvent::LocalCandidate {
                peer: "a".into(),
                candidate: "candidate:7".into(),
            })
            .await;
        let msg = fx.outbound_rx.try_recv().unwrap();
        let SignalingMessage::IceCandidate { candidate, target, .. } = msg else {
            panic!("expected ice-candidate");
        };
        assert_eq!(candidate, "candidate:7");
        assert_eq!(target.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn track_then_flag_and_flag_then_track_converge() {
        let mut fx = fixture();
        fx.manager
            .handle_event(SessionEvent::TrackArrived {
                peer: "a".into(),
                stream_id: "s1".into(),
                kind: TrackKind::Video,
            })
            .await;
        fx.manager
            .handle_event(SessionEvent::RemoteVideoState {
                peer: "a".into(),
                enabled: false,
            })
            .await;

        fx.manager
            .handle_event(SessionEvent::RemoteVideoState {
                peer: "b".into(),
                enabled: false,
            })
            .await;
        fx.manager
            .handle_event(SessionEvent::TrackArrived {
                peer: "b".into(),
                stream_id: "s1".into(),
                kind: TrackKind::Video,
            })
            .await;

        let a = fx.manager.roster().get("a").unwrap();
        let b = fx.manager.roster().get("b").unwrap();
        assert_eq!(a, b);
        assert!(!a.video_active);
        assert!(a.audio_active);
        assert!(a.media.as_ref().unwrap().has_video);
    }

    #[tokio::test]
    async fn flag_update_leaves_other_flag_and_media_untouched() {
        let mut fx = fixture();
        fx.manager
            .handle_event(SessionEvent::TrackArrived {
                peer: "b".into(),
                stream_id: "s1".into(),
                kind: TrackKind::Audio,
            })
            .await;
        fx.manager
            .handle_event(SessionEvent::RemoteVideoState {
                peer: "b".into(),
                enabled: false,
            })
            .await;

        let b = fx.manager.roster().get("b").unwrap();
        assert!(!b.video_active);
        assert!(b.audio_active);
        assert!(b.media.as_ref().unwrap().has_audio);
    }

    #[tokio::test]
    async fn initial_state_snapshots_merge() {
        let mut fx = fixture();
        let mut video = HashMap::new();
        video.insert("a".to_owned(), false);
        let mut audio = HashMap::new();
        audio.insert("a".to_owned(), true);
        fx.manager
            .handle_event(SessionEvent::InitialVideoStates(video))
            .await;
        fx.manager
            .handle_event(SessionEvent::InitialAudioStates(audio))
            .await;

        let a = fx.manager.roster().get("a").unwrap();
        assert!(!a.video_active);
        assert!(a.audio_active);
    }

    #[tokio::test]
    async fn disconnect_removes_peer_and_roster_entry() {
        let mut fx = fixture();
        fx.manager
            .handle_event(SessionEvent::Occupants(vec!["a".into(), "b".into()]))
            .await;
        fx.pump().await;
        fx.pump().await;
        assert_eq!(fx.manager.roster().len(), 2);

        fx.manager
            .handle_event(SessionEvent::PeerLeft("a".into()))
            .await;
        assert_eq!(fx.manager.roster().len(), 1);
        assert_eq!(fx.manager.peer_count(), 1);
        assert!(fx.manager.roster().get("a").is_none());
    }

    #[tokio::test]
    async fn negotiation_failure_is_contained_to_one_peer() {
        let mut fx = fixture();
        fx.manager
            .handle_event(SessionEvent::Occupants(vec!["a".into(), "b".into()]))
            .await;
        fx.pump().await;
        fx.pump().await;

        fx.manager
            .handle_event(SessionEvent::NegotiationFailed {
                peer: "a".into(),
                reason: "boom".into(),
            })
            .await;

        assert!(fx.manager.peer_phase("a").is_none());
        assert_eq!(fx.manager.peer_phase("b"), Some(PeerPhase::OfferSent));
        // The roster keeps b's entry; a's media is gone but flags survive.
        assert!(fx.manager.roster().get("b").is_some());
    }

    #[tokio::test]
    async fn offer_completion_for_closed_peer_noops() {
        let mut fx = fixture();
        fx.manager
            .handle_event(SessionEvent::Occupants(vec!["a".into()]))
            .await;
        // Peer leaves before the spawned offer task reports back.
        fx.manager
            .handle_event(SessionEvent::PeerLeft("a".into()))
            .await;
        fx.pump().await; // OfferReady for the closed peer

        assert!(fx.outbound_rx.try_recv().is_err());
        assert!(fx.manager.peer_phase("a").is_none());
    }

    #[tokio::test]
    async fn close_all_releases_every_connection() {
        let mut fx = fixture();
        fx.manager
            .handle_event(SessionEvent::Occupants(vec!["a".into(), "b".into()]))
            .await;
        fx.manager.close_all();
        tokio::task::yield_now().await;

        assert_eq!(fx.manager.peer_count(), 0);
        assert!(fx.manager.roster().is_empty());
        for transport in fx.factory.created.lock().unwrap().iter() {
            assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn failed_offer_creation_drops_only_that_peer() {
        let mut fx = fixture_with(MockFactory {
            fail_offers: true,
            ..Default::default()
        });
        fx.manager
            .handle_event(SessionEvent::Occupants(vec!["a".into()]))
            .await;
        fx.pump().await; // NegotiationFailed
        assert!(fx.manager.peer_phase("a").is_none());
    }
}
