use serde::Deserialize;

/// Client configuration. Defaults mirror a local development setup; the
/// signaling URL can be overridden through `JAMLINK_SIGNALING_URL`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Websocket URL of the signaling relay.
    pub signaling_url: String,
    /// STUN/TURN URLs handed to every peer connection.
    pub ice_servers: Vec<String>,
    /// Base for shareable join URLs; the room id is appended as a path segment.
    pub share_url_base: String,
    /// Broadcast audio mute state alongside video state. Off by default:
    /// muting gates the local track without telling peers. Video state is
    /// always broadcast.
    pub sync_audio_state: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8080".to_owned(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_owned()],
            share_url_base: "http://localhost:3000/room".to_owned(),
            sync_audio_state: false,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("JAMLINK_SIGNALING_URL") {
            config.signaling_url = url;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_relay() {
        let config = ClientConfig::default();
        assert!(config.signaling_url.starts_with("ws://"));
        assert!(!config.sync_audio_state);
        assert!(!config.ice_servers.is_empty());
    }

    #[test]
    fn deserializes_partial_config() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"signaling_url": "ws://relay:9000"}"#).unwrap();
        assert_eq!(config.signaling_url, "ws://relay:9000");
        assert!(!config.sync_audio_state);
    }
}
