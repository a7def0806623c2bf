//! Peer-to-peer conferencing client: room lifecycle, WebRTC mesh
//! negotiation over a websocket signaling relay, local capture control, and
//! a low-latency note-event side channel.

mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod media;
pub mod midi;
pub mod peer;
pub mod room;
pub mod session;
pub mod signaling;

pub use client::{Client, LocalMediaState, RoomSnapshot};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use media::{DeviceMediaSource, MediaHandle, MediaSource, TrackKind};
pub use midi::{MidiEvent, MidiKind, MidiRelay};
pub use session::{Participant, ParticipantId, RemoteMedia, SessionEvent};
pub use signaling::SignalingMessage;
