//! Signaling channel: the wire protocol spoken with the relay server and a
//! thin websocket wrapper that bridges it onto channels.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::midi::MidiEvent;

/// Every event relayed through the signaling server, both directions.
///
/// Addressed events (`offer`, `answer`, `ice-candidate`) carry `target` on
/// the way out; the relay rewrites the sender into `caller`/`from` before
/// delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SignalingMessage {
    #[serde(rename_all = "camelCase")]
    CreateRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    CheckRoom { room_id: String },
    RoomExists { exists: bool },
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },
    AllUsers { users: Vec<String> },
    InitialVideoStates {
        #[serde(flatten)]
        states: HashMap<String, bool>,
    },
    InitialAudioStates {
        #[serde(flatten)]
        states: HashMap<String, bool>,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined { participant_id: String },
    #[serde(rename_all = "camelCase")]
    UserDisconnected { participant_id: String },
    Offer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    Answer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    IceCandidate {
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    #[serde(rename = "videoStateChange")]
    VideoStateChange { enabled: bool },
    #[serde(rename = "audioStateChange")]
    AudioStateChange { enabled: bool },
    #[serde(rename = "remoteVideoStateChange", rename_all = "camelCase")]
    RemoteVideoStateChange { participant_id: String, enabled: bool },
    #[serde(rename = "remoteAudioStateChange", rename_all = "camelCase")]
    RemoteAudioStateChange { participant_id: String, enabled: bool },
    #[serde(rename_all = "camelCase")]
    RoomNotFound {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RoomFull {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    // Flattened so the note fields sit beside roomId on the wire. The field
    // cannot be called `event`: that name is taken by the enum tag.
    #[serde(rename_all = "camelCase")]
    MidiMessage {
        room_id: String,
        #[serde(flatten)]
        payload: MidiEvent,
    },
    #[serde(rename_all = "camelCase")]
    RemoteMidiMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(flatten)]
        payload: MidiEvent,
    },
}

/// Persistent bidirectional connection to the relay. The websocket is split
/// into reader/writer tasks; callers interact with plain channels.
pub struct SignalingChannel {
    outgoing: mpsc::Sender<SignalingMessage>,
    incoming: mpsc::Receiver<SignalingMessage>,
}

impl SignalingChannel {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (incoming_tx, incoming_rx) = mpsc::channel(100);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<SignalingMessage>(100);

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to encode signaling message");
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(Ok(msg)) = read.next().await {
                let Message::Text(text) = msg else { continue };
                match serde_json::from_str::<SignalingMessage>(&text) {
                    Ok(signal) => {
                        if incoming_tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "ignoring unrecognized signaling frame"),
                }
            }
        });

        Ok(Self {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }

    /// In-memory channel pair, used by tests to stand in for the websocket.
    #[cfg(test)]
    pub(crate) fn from_parts(
        outgoing: mpsc::Sender<SignalingMessage>,
        incoming: mpsc::Receiver<SignalingMessage>,
    ) -> Self {
        Self { outgoing, incoming }
    }

    /// Cloneable outbound handle, independent of the receive side.
    pub fn sender(&self) -> mpsc::Sender<SignalingMessage> {
        self.outgoing.clone()
    }

    pub async fn send(&self, msg: SignalingMessage) -> Result<()> {
        self.outgoing
            .send(msg)
            .await
            .map_err(|_| Error::SignalingUnavailable("signaling connection closed".to_owned()))
    }

    /// `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.incoming.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::MidiKind;

    #[test]
    fn outbound_events_use_wire_names() {
        let json = serde_json::to_value(SignalingMessage::CheckRoom {
            room_id: "123456".to_owned(),
        })
        .unwrap();
        assert_eq!(json["event"], "check-room");
        assert_eq!(json["roomId"], "123456");

        let json = serde_json::to_value(SignalingMessage::VideoStateChange { enabled: false })
            .unwrap();
        assert_eq!(json["event"], "videoStateChange");
        assert_eq!(json["enabled"], false);

        let json = serde_json::to_value(SignalingMessage::Offer {
            sdp: "v=0".to_owned(),
            caller: None,
            target: Some("peer-a".to_owned()),
        })
        .unwrap();
        assert_eq!(json["event"], "offer");
        assert_eq!(json["target"], "peer-a");
        assert!(json.get("caller").is_none());
    }

    #[test]
    fn inbound_events_parse() {
        let msg: SignalingMessage =
            serde_json::from_str(r#"{"event":"all-users","users":["a","b"]}"#).unwrap();
        let SignalingMessage::AllUsers { users } = msg else {
            panic!("wrong variant");
        };
        assert_eq!(users, vec!["a", "b"]);

        let msg: SignalingMessage = serde_json::from_str(
            r#"{"event":"remoteVideoStateChange","participantId":"a","enabled":false}"#,
        )
        .unwrap();
        let SignalingMessage::RemoteVideoStateChange { participant_id, enabled } = msg else {
            panic!("wrong variant");
        };
        assert_eq!(participant_id, "a");
        assert!(!enabled);

        let msg: SignalingMessage = serde_json::from_str(
            r#"{"event":"initial-video-states","a":true,"b":false}"#,
        )
        .unwrap();
        let SignalingMessage::InitialVideoStates { states } = msg else {
            panic!("wrong variant");
        };
        assert_eq!(states.get("b"), Some(&false));
    }

    #[test]
    fn midi_payload_is_flattened() {
        let msg: SignalingMessage = serde_json::from_str(
            r#"{"event":"remote-midi-message","roomId":"1","type":"noteon","note":72,"velocity":80,"timestamp":10}"#,
        )
        .unwrap();
        let SignalingMessage::RemoteMidiMessage { payload, .. } = msg else {
            panic!("wrong variant");
        };
        assert_eq!(payload.kind, MidiKind::NoteOn);
        assert_eq!(payload.note, 72);

        // Outbound: the note fields land beside the tag and roomId, with no
        // nested object.
        let json = serde_json::to_value(SignalingMessage::MidiMessage {
            room_id: "1".to_owned(),
            payload: MidiEvent::note_on(60, 100),
        })
        .unwrap();
        assert_eq!(json["event"], "midi-message");
        assert_eq!(json["roomId"], "1");
        assert_eq!(json["type"], "noteon");
        assert_eq!(json["note"], 60);
        assert!(json.get("payload").is_none());
    }
}
