use crate::types::{ChatEntry, HistoryEntry, MediaPayload, OutputFormat, UserId};
use serde::{Deserialize, Serialize};

/// Broadcast-state slots a broadcaster can publish into. Matched
/// exhaustively; each slot is replaced wholesale, never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastKind {
    Video,
    Topic,
    Image,
}

/// Broadcaster-authored updates, tagged by slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BroadcastUpdate {
    Topic { text: String },
    /// Single base64 JPEG still.
    Image { frame: String },
    /// Frame sequence, encoded like a chat clip.
    Video { frames: Vec<String>, format: String },
}

impl BroadcastUpdate {
    pub fn kind(&self) -> BroadcastKind {
        match self {
            BroadcastUpdate::Topic { .. } => BroadcastKind::Topic,
            BroadcastUpdate::Image { .. } => BroadcastKind::Image,
            BroadcastUpdate::Video { .. } => BroadcastKind::Video,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Pre-room probe: does this room exist?
    JoinRoom {
        room: String,
    },
    Fingerprint {
        value: String,
    },
    /// Enter a room, declaring the media format this connection wants.
    Join {
        room: String,
        format: String,
    },
    Chat {
        #[serde(default)]
        text: String,
        format: String,
        ack: String,
        /// Base64-encoded still frames, in capture order.
        frames: Vec<String>,
    },
    /// Legacy relay: an already-encoded clip that gets split and re-encoded
    /// into the native filmstrip format.
    Message {
        ack: String,
        #[serde(default)]
        text: String,
        format: String,
        video: String,
    },
    Auth {
        password: String,
    },
    Broadcast {
        update: BroadcastUpdate,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "lowercase")]
pub enum ServerMessage {
    JoinRoom {
        exists: bool,
    },
    /// Join named an unknown room.
    Nak {
        room: String,
    },
    /// Sent once, after the first valid fingerprint.
    UserId {
        id: UserId,
    },
    /// Dev-only hint to refresh stale assets.
    Reload,
    Ack {
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        err: Option<String>,
    },
    Chat {
        #[serde(flatten)]
        entry: ChatEntry,
        #[serde(flatten)]
        media: Option<MediaPayload>,
    },
    Broadcaster {
        id: Option<UserId>,
    },
    Broadcast {
        kind: BroadcastKind,
        #[serde(flatten)]
        entry: ChatEntry,
        #[serde(flatten)]
        media: Option<MediaPayload>,
    },
    Active {
        count: usize,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Chat fan-out/replay message with media filtered to `format`.
    pub fn chat(entry: &HistoryEntry, format: OutputFormat) -> Self {
        ServerMessage::Chat {
            entry: entry.chat.clone(),
            media: MediaPayload::from_variants(&entry.media, format),
        }
    }

    /// Broadcast-slot replay/update message with media filtered to `format`.
    pub fn broadcast(kind: BroadcastKind, entry: &HistoryEntry, format: OutputFormat) -> Self {
        ServerMessage::Broadcast {
            kind,
            entry: entry.chat.clone(),
            media: MediaPayload::from_variants(&entry.media, format),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MediaData, MediaVariants};

    #[test]
    fn client_messages_use_original_event_names() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"t":"joinroom","room":"lobby"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::JoinRoom { room } if room == "lobby"));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"t":"fingerprint","value":"abc"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Fingerprint { value } if value == "abc"));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"t":"chat","text":"hi","format":"image/jpeg","ack":"k1","frames":["AAAA"]}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Chat {
                text,
                format,
                ack,
                frames,
            } => {
                assert_eq!(text, "hi");
                assert_eq!(format, "image/jpeg");
                assert_eq!(ack, "k1");
                assert_eq!(frames.len(), 1);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn broadcast_updates_are_tagged_by_kind() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"t":"broadcast","update":{"kind":"topic","text":"tonight: cats"}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Broadcast { update } => {
                assert_eq!(update.kind(), BroadcastKind::Topic);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn ack_omits_err_when_absent() {
        let ok = serde_json::to_string(&ServerMessage::Ack {
            key: "k1".to_string(),
            err: None,
        })
        .unwrap();
        assert!(!ok.contains("err"));

        let failed = serde_json::to_string(&ServerMessage::Ack {
            key: "k1".to_string(),
            err: Some("invalid frames".to_string()),
        })
        .unwrap();
        assert!(failed.contains("\"err\":\"invalid frames\""));
    }

    #[test]
    fn chat_message_flattens_entry_and_media() {
        let mut media = MediaVariants::new();
        media.insert(OutputFormat::Jpg, MediaData::Bytes(vec![0xFF]));
        let entry = HistoryEntry {
            chat: ChatEntry::new("user-1".to_string(), "hello", 10),
            media,
        };

        let json =
            serde_json::to_value(ServerMessage::chat(&entry, OutputFormat::Jpg)).unwrap();
        assert_eq!(json["t"], "chat");
        assert_eq!(json["text"], "hello");
        assert_eq!(json["userId"], "user-1");
        assert_eq!(json["videoType"], "jpg");
        assert_eq!(json["videoMime"], "image/jpeg");
        assert!(json["sent"].is_i64() || json["sent"].is_u64());

        // A format the pipeline didn't produce: entry goes out without media.
        let json = serde_json::to_value(ServerMessage::chat(&entry, OutputFormat::Mp4)).unwrap();
        assert_eq!(json["t"], "chat");
        assert!(json.get("video").is_none());
    }
}
