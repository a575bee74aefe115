use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Pseudonymous user identity, a one-way hash of fingerprint + server secret.
pub type UserId = String;

/// Encoded media representations a message can be delivered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Vertically concatenated "filmstrip" JPEG.
    Jpg,
    /// H.264 video container, for legacy (iOS) clients.
    Mp4,
}

impl OutputFormat {
    pub fn name(&self) -> &'static str {
        match self {
            OutputFormat::Jpg => "jpg",
            OutputFormat::Mp4 => "mp4",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            OutputFormat::Jpg => "image/jpeg",
            OutputFormat::Mp4 => "video/mp4",
        }
    }

    /// Map a client's negotiated mime type to the format it should receive.
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/jpeg" => Some(OutputFormat::Jpg),
            "video/mp4" => Some(OutputFormat::Mp4),
            _ => None,
        }
    }
}

/// One encoded representation: either raw bytes (base64'd on the wire) or a
/// ready-made `data:` URI produced by the pipeline.
#[derive(Debug, Clone)]
pub enum MediaData {
    Bytes(Vec<u8>),
    DataUri(String),
}

/// Per-entry map of encoding name to encoded media. Formats the pipeline did
/// not produce are simply absent.
pub type MediaVariants = HashMap<OutputFormat, MediaData>;

/// A committed chat message. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEntry {
    pub key: String,
    pub text: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub sent: DateTime<Utc>,
    #[serde(rename = "userId")]
    pub user_id: UserId,
    /// Declared number of still frames the clip was captured from.
    pub frames: usize,
    pub from: String,
}

impl ChatEntry {
    pub fn new(user_id: UserId, text: &str, frames: usize) -> Self {
        Self {
            key: ulid::Ulid::new().to_string(),
            text: crate::text::transform_text(text),
            sent: Utc::now(),
            user_id,
            frames,
            from: "clipchat".to_string(),
        }
    }
}

/// A chat entry together with its encoded media, as retained in history and
/// broadcast state.
#[derive(Debug)]
pub struct HistoryEntry {
    pub chat: ChatEntry,
    pub media: MediaVariants,
}

/// Media fields attached to outbound chat/broadcast events, filtered to the
/// receiving connection's negotiated format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    pub video: String,
    #[serde(rename = "videoType")]
    pub video_type: String,
    #[serde(rename = "videoMime")]
    pub video_mime: String,
}

impl MediaPayload {
    /// Pick the variant matching `format`, if the pipeline produced it.
    pub fn from_variants(variants: &MediaVariants, format: OutputFormat) -> Option<Self> {
        let data = match variants.get(&format)? {
            MediaData::Bytes(bytes) => BASE64.encode(bytes),
            MediaData::DataUri(uri) => uri.clone(),
        };
        Some(Self {
            video: data,
            video_type: format.name().to_string(),
            video_mime: format.mime().to_string(),
        })
    }
}
