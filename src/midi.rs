//! Room-wide MIDI note relay.
//!
//! Local note events go out through the signaling channel; remote events fan
//! out to visualizer subscribers through a broadcast feed. The relay is an
//! owned resource: subscriptions are handed out explicitly and deregister
//! when the receiver is dropped, so listener lifetimes stay paired with the
//! visualizer that created them.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MidiKind {
    NoteOn,
    NoteOff,
}

impl std::fmt::Display for MidiKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MidiKind::NoteOn => write!(f, "note-on"),
            MidiKind::NoteOff => write!(f, "note-off"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiEvent {
    #[serde(rename = "type")]
    pub kind: MidiKind,
    pub note: u8,
    pub velocity: u8,
    pub timestamp: u64,
}

impl MidiEvent {
    pub fn note_on(note: u8, velocity: u8) -> Self {
        Self {
            kind: MidiKind::NoteOn,
            note,
            velocity,
            timestamp: now_millis(),
        }
    }

    pub fn note_off(note: u8) -> Self {
        Self {
            kind: MidiKind::NoteOff,
            note,
            velocity: 0,
            timestamp: now_millis(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Fan-out point for remote note events.
pub struct MidiRelay {
    feed: broadcast::Sender<MidiEvent>,
}

impl MidiRelay {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(64);
        Self { feed }
    }

    /// Cloneable handle for publishing into the feed from elsewhere.
    pub fn handle(&self) -> broadcast::Sender<MidiEvent> {
        self.feed.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MidiEvent> {
        self.feed.subscribe()
    }

    /// Delivers a remote event to every live subscriber. Events arriving with
    /// no subscribers are dropped, not queued.
    pub fn dispatch(&self, event: MidiEvent) {
        let _ = self.feed.send(event);
    }
}

impl Default for MidiRelay {
    fn default() -> Self {
        Self::new()
    }
}
