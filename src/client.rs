//! Client facade and the driver task behind it.
//!
//! All mutable session state lives in one driver task. Public methods turn
//! user intent into commands; signaling messages and transport callbacks
//! arrive as events; the driver folds both into the session and publishes a
//! read-only snapshot through a watch channel for the presentation layer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::media::{MediaHandle, MediaSource, TrackKind};
use crate::midi::{MidiEvent, MidiRelay};
use crate::peer::{PeerTransportFactory, RtcTransportFactory};
use crate::room::RoomController;
use crate::session::{Participant, ParticipantId, PeerSessionManager, SessionEvent};
use crate::signaling::{SignalingChannel, SignalingMessage};
use webrtc::track::track_local::TrackLocal;

/// Read-only view of the whole session, published after every state change.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub room_id: Option<String>,
    pub share_url: Option<String>,
    pub joined: bool,
    pub local: LocalMediaState,
    pub participants: HashMap<ParticipantId, Participant>,
    /// Remote participants plus the local user, never below one.
    pub participant_count: usize,
    pub error: Option<String>,
}

impl Default for RoomSnapshot {
    fn default() -> Self {
        Self {
            room_id: None,
            share_url: None,
            joined: false,
            local: LocalMediaState::default(),
            participants: HashMap::new(),
            participant_count: 1,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalMediaState {
    pub capturing: bool,
    pub video_active: bool,
    pub audio_active: bool,
}

impl Default for LocalMediaState {
    fn default() -> Self {
        Self {
            capturing: false,
            video_active: true,
            audio_active: true,
        }
    }
}

enum Command {
    EnsureConnected {
        reply: oneshot::Sender<Result<()>>,
    },
    CreateRoom {
        room_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    CheckRoom {
        room_id: String,
        reply: oneshot::Sender<bool>,
    },
    CompleteJoin {
        room_id: String,
        media: MediaHandle,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    SetVideo {
        enabled: bool,
    },
    SetAudio {
        enabled: bool,
    },
    ReplaceVideoTrack {
        track: Arc<dyn TrackLocal + Send + Sync>,
    },
    SendMidi {
        event: MidiEvent,
    },
    ReportError {
        message: String,
    },
}

pub struct Client {
    commands: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<RoomSnapshot>,
    midi_handle: broadcast::Sender<MidiEvent>,
    media_source: Arc<dyn MediaSource>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        media_source: Arc<dyn MediaSource>,
        factory: Arc<dyn PeerTransportFactory>,
    ) -> Self {
        Self::build(config, media_source, factory, None)
    }

    /// Default-device capture and WebRTC transports.
    pub fn with_defaults(config: ClientConfig) -> Self {
        let factory = Arc::new(RtcTransportFactory::new(&config));
        Self::new(config, Arc::new(crate::media::DeviceMediaSource), factory)
    }

    fn build(
        config: ClientConfig,
        media_source: Arc<dyn MediaSource>,
        factory: Arc<dyn PeerTransportFactory>,
        preconnected: Option<SignalingChannel>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (snapshot_tx, snapshot_rx) = watch::channel(RoomSnapshot::default());
        let midi = MidiRelay::new();
        let midi_handle = midi.handle();
        let room = RoomController::new(config.share_url_base.clone());
        let session = PeerSessionManager::new(factory, events_tx);

        let driver = Driver {
            config,
            commands_rx,
            events_rx,
            session,
            room,
            signaling: preconnected,
            snapshot_tx,
            midi,
            local_media: None,
        };
        tokio::spawn(driver.run());

        Self {
            commands: commands_tx,
            snapshot_rx,
            midi_handle,
            media_source,
        }
    }

    /// Creates a room under a fresh identifier and joins it. Returns the
    /// room id; the shareable URL appears in the snapshot.
    pub async fn create_room(&self) -> Result<String> {
        let room_id = RoomController::generate_room_id();
        let result = self.create_and_join(&room_id).await;
        if let Err(e) = &result {
            self.report_error(e).await;
        }
        result.map(|()| room_id)
    }

    async fn create_and_join(&self, room_id: &str) -> Result<()> {
        self.ensure_connected().await?;
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::CreateRoom {
            room_id: room_id.to_owned(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(driver_gone)??;
        self.join_checked(room_id).await
    }

    /// Joins an existing room. The identifier is verified with the relay
    /// before any media is acquired; on `RoomNotFound` local state is left
    /// untouched.
    pub async fn join_room(&self, room_id: &str) -> Result<()> {
        let result = async {
            let room_id = room_id.trim();
            if room_id.is_empty() {
                return Err(Error::InvalidInput("room id must not be empty".to_owned()));
            }
            self.ensure_connected().await?;
            self.join_checked(room_id).await
        }
        .await;
        if let Err(e) = &result {
            self.report_error(e).await;
        }
        result
    }

    async fn join_checked(&self, room_id: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::CheckRoom {
            room_id: room_id.to_owned(),
            reply: tx,
        })
        .await?;
        let exists = rx
            .await
            .map_err(|_| Error::SignalingUnavailable("room check failed".to_owned()))?;
        if !exists {
            return Err(Error::RoomNotFound(room_id.to_owned()));
        }

        // Media comes before the join message: if the user denies access,
        // the relay never learns we tried.
        let media = self.media_source.acquire().await?;
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::CompleteJoin {
            room_id: room_id.to_owned(),
            media,
            reply: tx,
        })
        .await?;
        rx.await.map_err(driver_gone)?
    }

    /// Leaves the current room. Safe to call when nothing is joined.
    pub async fn leave_room(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Leave { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn set_video_enabled(&self, enabled: bool) {
        let _ = self.commands.send(Command::SetVideo { enabled }).await;
    }

    pub async fn set_audio_enabled(&self, enabled: bool) {
        let _ = self.commands.send(Command::SetAudio { enabled }).await;
    }

    /// Swaps the outbound video track on every open connection, e.g. after a
    /// camera change. No renegotiation.
    pub async fn replace_video_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) {
        let _ = self.commands.send(Command::ReplaceVideoTrack { track }).await;
    }

    /// Broadcasts a local note event to the room.
    pub async fn send_note(&self, event: MidiEvent) {
        let _ = self.commands.send(Command::SendMidi { event }).await;
    }

    /// Remote note events, for the visualizer.
    pub fn midi_feed(&self) -> broadcast::Receiver<MidiEvent> {
        self.midi_handle.subscribe()
    }

    pub fn snapshot(&self) -> watch::Receiver<RoomSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn state(&self) -> RoomSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    async fn ensure_connected(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::EnsureConnected { reply: tx }).await?;
        rx.await.map_err(driver_gone)?
    }

    async fn report_error(&self, error: &Error) {
        let _ = self
            .commands
            .send(Command::ReportError {
                message: error.to_string(),
            })
            .await;
    }

    async fn send_command(&self, cmd: Command) -> Result<()> {
        self.commands.send(cmd).await.map_err(|_| driver_gone(()))
    }
}

fn driver_gone<T>(_: T) -> Error {
    Error::SignalingUnavailable("client driver stopped".to_owned())
}

struct Driver {
    config: ClientConfig,
    commands_rx: mpsc::Receiver<Command>,
    events_rx: mpsc::Receiver<SessionEvent>,
    session: PeerSessionManager,
    room: RoomController,
    signaling: Option<SignalingChannel>,
    snapshot_tx: watch::Sender<RoomSnapshot>,
    midi: MidiRelay,
    local_media: Option<Arc<MediaHandle>>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                Some(event) = self.events_rx.recv() => {
                    self.session.handle_event(event).await;
                    self.publish();
                }
                msg = Self::next_signal(&mut self.signaling) => {
                    match msg {
                        Some(msg) => {
                            self.handle_signal(msg).await;
                            self.publish();
                        }
                        None => {
                            self.signaling = None;
                            if self.room.is_joined() {
                                self.force_leave(Some("signaling connection lost".to_owned()));
                            }
                            self.publish();
                        }
                    }
                }
            }
        }
        self.force_leave(None);
    }

    async fn next_signal(signaling: &mut Option<SignalingChannel>) -> Option<SignalingMessage> {
        match signaling {
            Some(channel) => channel.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::EnsureConnected { reply } => {
                self.room.begin_action();
                let result = self.ensure_connected().await;
                let _ = reply.send(result);
                self.publish();
            }
            Command::CreateRoom { room_id, reply } => {
                let result = self.send_signal(SignalingMessage::CreateRoom { room_id }).await;
                let _ = reply.send(result);
            }
            Command::CheckRoom { room_id, reply } => {
                // The reply is resolved by the matching room-exists response;
                // dropping it on send failure cancels the waiter.
                match self.send_signal(SignalingMessage::CheckRoom { room_id }).await {
                    Ok(()) => self.room.register_check(reply),
                    Err(e) => debug!(error = %e, "room check not sent"),
                }
            }
            Command::CompleteJoin {
                room_id,
                media,
                reply,
            } => {
                let Some(channel) = &self.signaling else {
                    media.stop();
                    let _ = reply.send(Err(Error::SignalingUnavailable(
                        "not connected".to_owned(),
                    )));
                    return;
                };
                let media = Arc::new(media);
                self.session.bind(channel.sender(), Arc::clone(&media));
                match self
                    .send_signal(SignalingMessage::JoinRoom {
                        room_id: room_id.clone(),
                    })
                    .await
                {
                    Ok(()) => {
                        self.room.mark_joined(&room_id);
                        self.local_media = Some(media);
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        media.stop();
                        self.session.close_all();
                        let _ = reply.send(Err(e));
                    }
                }
                self.publish();
            }
            Command::Leave { reply } => {
                self.force_leave(None);
                let _ = reply.send(());
                self.publish();
            }
            Command::SetVideo { enabled } => {
                if let Some(media) = &self.local_media {
                    media.set_enabled(TrackKind::Video, enabled);
                    let _ = self
                        .send_signal(SignalingMessage::VideoStateChange { enabled })
                        .await;
                }
                self.publish();
            }
            Command::SetAudio { enabled } => {
                if let Some(media) = &self.local_media {
                    media.set_enabled(TrackKind::Audio, enabled);
                    if self.config.sync_audio_state {
                        let _ = self
                            .send_signal(SignalingMessage::AudioStateChange { enabled })
                            .await;
                    }
                }
                self.publish();
            }
            Command::ReplaceVideoTrack { track } => {
                self.session.replace_video_track(track);
            }
            Command::SendMidi { event } => match self.room.room_id() {
                Some(room_id) if self.room.is_joined() => {
                    let room_id = room_id.to_owned();
                    let _ = self
                        .send_signal(SignalingMessage::MidiMessage {
                            room_id,
                            payload: event,
                        })
                        .await;
                }
                _ => debug!("dropping midi event, not in a room"),
            },
            Command::ReportError { message } => {
                self.room.set_error(message);
                self.publish();
            }
        }
    }

    async fn handle_signal(&mut self, msg: SignalingMessage) {
        match msg {
            SignalingMessage::RoomExists { exists } => self.room.resolve_check(exists),
            SignalingMessage::AllUsers { users } => {
                self.session.handle_event(SessionEvent::Occupants(users)).await
            }
            SignalingMessage::UserJoined { participant_id } => {
                self.session
                    .handle_event(SessionEvent::PeerJoined(participant_id))
                    .await
            }
            SignalingMessage::UserDisconnected { participant_id } => {
                self.session
                    .handle_event(SessionEvent::PeerLeft(participant_id))
                    .await
            }
            SignalingMessage::Offer {
                sdp,
                caller: Some(caller),
                ..
            } => {
                self.session
                    .handle_event(SessionEvent::OfferReceived { from: caller, sdp })
                    .await
            }
            SignalingMessage::Answer {
                sdp,
                caller: Some(caller),
                ..
            } => {
                self.session
                    .handle_event(SessionEvent::AnswerReceived { from: caller, sdp })
                    .await
            }
            SignalingMessage::IceCandidate {
                candidate,
                from: Some(from),
                ..
            } => {
                self.session
                    .handle_event(SessionEvent::CandidateReceived { from, candidate })
                    .await
            }
            SignalingMessage::InitialVideoStates { states } => {
                self.session
                    .handle_event(SessionEvent::InitialVideoStates(states))
                    .await
            }
            SignalingMessage::InitialAudioStates { states } => {
                self.session
                    .handle_event(SessionEvent::InitialAudioStates(states))
                    .await
            }
            SignalingMessage::RemoteVideoStateChange {
                participant_id,
                enabled,
            } => {
                self.session
                    .handle_event(SessionEvent::RemoteVideoState {
                        peer: participant_id,
                        enabled,
                    })
                    .await
            }
            SignalingMessage::RemoteAudioStateChange {
                participant_id,
                enabled,
            } => {
                self.session
                    .handle_event(SessionEvent::RemoteAudioState {
                        peer: participant_id,
                        enabled,
                    })
                    .await
            }
            SignalingMessage::RoomNotFound { room_id } => {
                // Room closed between check and join; back to the entry screen.
                let message = Error::RoomNotFound(room_id.unwrap_or_else(|| "room".to_owned()));
                self.force_leave(Some(message.to_string()));
            }
            SignalingMessage::RoomFull { room_id } => {
                let message = Error::RoomFull(room_id.unwrap_or_else(|| "room".to_owned()));
                self.force_leave(Some(message.to_string()));
            }
            SignalingMessage::RemoteMidiMessage { payload, .. } => self.midi.dispatch(payload),
            other => debug!(?other, "ignoring unexpected signaling event"),
        }
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.signaling.is_some() {
            return Ok(());
        }
        match SignalingChannel::connect(&self.config.signaling_url).await {
            Ok(channel) => {
                self.signaling = Some(channel);
                Ok(())
            }
            Err(e) => {
                self.room.set_error(e.to_string());
                Err(e)
            }
        }
    }

    async fn send_signal(&mut self, msg: SignalingMessage) -> Result<()> {
        let sender = match &self.signaling {
            Some(channel) => channel.sender(),
            None => {
                return Err(Error::SignalingUnavailable("not connected".to_owned()));
            }
        };
        if sender.send(msg).await.is_err() {
            self.signaling = None;
            return Err(Error::SignalingUnavailable(
                "signaling connection closed".to_owned(),
            ));
        }
        Ok(())
    }

    /// Full teardown: capture stopped, peers closed, roster cleared, room
    /// reset, signaling dropped so the next create/join starts clean.
    /// Idempotent.
    fn force_leave(&mut self, error: Option<String>) {
        if let Some(media) = self.local_media.take() {
            media.stop();
        }
        self.session.close_all();
        self.room.reset();
        if let Some(message) = error {
            self.room.set_error(message);
        }
        self.signaling = None;
    }

    fn publish(&self) {
        let local = LocalMediaState {
            capturing: self.local_media.is_some(),
            video_active: self
                .local_media
                .as_ref()
                .map_or(true, |m| m.is_enabled(TrackKind::Video)),
            audio_active: self
                .local_media
                .as_ref()
                .map_or(true, |m| m.is_enabled(TrackKind::Audio)),
        };
        let snapshot = RoomSnapshot {
            room_id: self.room.room_id().map(str::to_owned),
            share_url: self.room.share_url().map(str::to_owned),
            joined: self.room.is_joined(),
            local,
            participants: self.session.roster().entries().clone(),
            participant_count: (1 + self.session.roster().len()).max(1),
            error: self.room.error().map(str::to_owned),
        };
        let _ = self.snapshot_tx.send(snapshot);
    }
}
