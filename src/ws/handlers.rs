//! Per-connection session state machine.
//!
//! A `Session` owns one connection's progression (unjoined, joined without
//! identity, joined with identity) and turns inbound `ClientMessage`s into
//! outbound replies plus room side effects. Messages are processed serially
//! per connection, so acks go out in submission order.

use crate::identity::IdentityError;
use crate::protocol::{BroadcastUpdate, ClientMessage, ServerMessage};
use crate::registry::RoomRegistry;
use crate::room::{ChatRoom, RoomEvent};
use crate::types::{ChatEntry, MediaData, MediaVariants, OutputFormat, UserId};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Frame count recorded for legacy clips, which arrive pre-encoded.
const LEGACY_FRAME_COUNT: usize = 10;

/// The outcome of handling one client message.
pub struct Reply {
    pub messages: Vec<ServerMessage>,
    /// Present after a successful room join.
    pub subscription: Option<broadcast::Receiver<RoomEvent>>,
    /// The connection must be closed after flushing `messages`.
    pub disconnect: bool,
}

impl Reply {
    fn none() -> Self {
        Self {
            messages: Vec::new(),
            subscription: None,
            disconnect: false,
        }
    }

    fn message(msg: ServerMessage) -> Self {
        Self {
            messages: vec![msg],
            subscription: None,
            disconnect: false,
        }
    }

    fn disconnect(msg: ServerMessage) -> Self {
        Self {
            messages: vec![msg],
            subscription: None,
            disconnect: true,
        }
    }
}

pub struct Session {
    registry: Arc<RoomRegistry>,
    user_id: Option<UserId>,
    room: Option<Arc<ChatRoom>>,
    format: Option<OutputFormat>,
}

impl Session {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self {
            registry,
            user_id: None,
            room: None,
            format: None,
        }
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    /// Render a room event for this connection's negotiated format.
    pub fn filter_event(&self, event: RoomEvent) -> Option<ServerMessage> {
        Some(event.to_message(self.format?))
    }

    /// Leave the current room, if any. Called on connection teardown.
    pub async fn teardown(&mut self) {
        self.format = None;
        if let Some(room) = self.room.take() {
            room.leave().await;
        }
    }

    pub async fn handle(&mut self, msg: ClientMessage) -> Reply {
        match msg {
            ClientMessage::JoinRoom { room } => Reply::message(ServerMessage::JoinRoom {
                exists: self.registry.room_exists(&room),
            }),
            ClientMessage::Fingerprint { value } => self.handle_fingerprint(&value),
            ClientMessage::Join { room, format } => self.handle_join(&room, &format).await,
            ClientMessage::Chat {
                text,
                format,
                ack,
                frames,
            } => self.handle_chat(&text, &format, ack, &frames).await,
            ClientMessage::Message {
                ack,
                text,
                format,
                video,
            } => self.handle_legacy(&text, &format, ack, &video).await,
            ClientMessage::Auth { password } => self.handle_auth(&password).await,
            ClientMessage::Broadcast { update } => self.handle_broadcast(update).await,
        }
    }

    fn handle_fingerprint(&mut self, value: &str) -> Reply {
        match self.registry.identity().bind(&self.user_id, value) {
            Ok(id) => {
                self.user_id = Some(id.clone());
                let mut reply = Reply::message(ServerMessage::UserId { id: id.clone() });
                if self.registry.identity().should_reload(&id) {
                    reply.messages.push(ServerMessage::Reload);
                }
                reply
            }
            Err(IdentityError::AlreadyBound) => {
                Reply::message(ServerMessage::error("fingerprint already set"))
            }
            // Bad fingerprints force-disconnect.
            Err(err @ IdentityError::InvalidFingerprint) => {
                Reply::disconnect(ServerMessage::error(err.to_string()))
            }
        }
    }

    async fn handle_join(&mut self, room_name: &str, format: &str) -> Reply {
        if self.room.is_some() {
            return Reply::message(ServerMessage::error("already in a room"));
        }
        let Some(room) = self.registry.room(room_name) else {
            return Reply::message(ServerMessage::Nak {
                room: room_name.to_string(),
            });
        };
        let Some(format) = OutputFormat::from_mime(format) else {
            return Reply::message(ServerMessage::error("invalid video format"));
        };

        let (replay, rx) = room.join(format).await;
        tracing::debug!(room = %room.name(), format = format.name(), "connection joined room");
        self.room = Some(room);
        self.format = Some(format);
        Reply {
            messages: replay,
            subscription: Some(rx),
            disconnect: false,
        }
    }

    async fn handle_chat(
        &mut self,
        text: &str,
        format: &str,
        ack: String,
        frames: &[String],
    ) -> Reply {
        let (user_id, room) = match self.identified_room() {
            Ok(pair) => pair,
            Err(reply) => return reply,
        };

        if !self.registry.message_throttle().check(&user_id) {
            return ack_err(ack, "exceeded message limit");
        }

        let Ok(frames) = decode_all(frames) else {
            return ack_err(ack, "invalid frames");
        };
        if let Err(e) = self.registry.pipeline().validate(format, &frames) {
            return ack_err(ack, e.ack_message());
        }

        match self.registry.pipeline().convert(&frames, format).await {
            Ok(media) => {
                let entry = ChatEntry::new(user_id, text, frames.len());
                // Ack first, then commit; the sender sees its own chat via
                // the room subscription like everyone else.
                let reply = Reply::message(ServerMessage::Ack {
                    key: ack,
                    err: None,
                });
                room.commit_chat(entry, media).await;
                reply
            }
            Err(e) => {
                tracing::error!(error = %e, "frame conversion failed");
                ack_err(ack, e.ack_message())
            }
        }
    }

    /// Legacy relay: split a pre-encoded clip back into frames and deliver
    /// it as a native filmstrip message.
    async fn handle_legacy(
        &mut self,
        text: &str,
        format: &str,
        ack: String,
        video: &str,
    ) -> Reply {
        let (user_id, room) = match self.identified_room() {
            Ok(pair) => pair,
            Err(reply) => return reply,
        };

        if !self.registry.message_throttle().check(&user_id) {
            return ack_err(ack, "exceeded message limit");
        }

        let Ok(video) = BASE64.decode(video) else {
            return ack_err(ack, "invalid video");
        };

        match self.registry.pipeline().refilmstrip(&video, format).await {
            Ok(media) => {
                let entry = ChatEntry::new(user_id, text, LEGACY_FRAME_COUNT);
                let reply = Reply::message(ServerMessage::Ack {
                    key: ack,
                    err: None,
                });
                room.commit_chat(entry, media).await;
                reply
            }
            Err(e) => {
                tracing::error!(error = %e, "legacy video conversion failed");
                ack_err(ack, e.ack_message())
            }
        }
    }

    async fn handle_auth(&mut self, password: &str) -> Reply {
        let (user_id, room) = match self.identified_room() {
            Ok(pair) => pair,
            Err(reply) => return reply,
        };
        // A wrong password is silently ignored; a correct one announces the
        // new broadcaster through the room channel.
        room.authenticate(&user_id, password).await;
        Reply::none()
    }

    async fn handle_broadcast(&mut self, update: BroadcastUpdate) -> Reply {
        let (user_id, room) = match self.identified_room() {
            Ok(pair) => pair,
            Err(reply) => return reply,
        };
        if !room.is_broadcaster(&user_id).await {
            return Reply::message(ServerMessage::error("not the broadcaster"));
        }

        let kind = update.kind();
        let (entry, media) = match update {
            BroadcastUpdate::Topic { text } => (
                ChatEntry::new(user_id.clone(), &text, 0),
                MediaVariants::new(),
            ),
            BroadcastUpdate::Image { frame } => {
                let Ok(frame) = BASE64.decode(&frame) else {
                    return Reply::message(ServerMessage::error("invalid image"));
                };
                if !crate::media::verify_jpeg_header(&frame) {
                    return Reply::message(ServerMessage::error("invalid image"));
                }
                let mut media = MediaVariants::new();
                media.insert(OutputFormat::Jpg, MediaData::Bytes(frame));
                (ChatEntry::new(user_id.clone(), "", 1), media)
            }
            BroadcastUpdate::Video { frames, format } => {
                let Ok(frames) = decode_all(&frames) else {
                    return Reply::message(ServerMessage::error("invalid frames"));
                };
                if let Err(e) = self.registry.pipeline().validate(&format, &frames) {
                    return Reply::message(ServerMessage::error(e.ack_message()));
                }
                match self.registry.pipeline().convert(&frames, &format).await {
                    Ok(media) => (ChatEntry::new(user_id.clone(), "", frames.len()), media),
                    Err(e) => {
                        tracing::error!(error = %e, "broadcast video conversion failed");
                        return Reply::message(ServerMessage::error(e.ack_message()));
                    }
                }
            }
        };

        match room.set_broadcast(&user_id, kind, entry, media).await {
            Ok(()) => Reply::none(),
            Err(e) => Reply::message(ServerMessage::error(e.to_string())),
        }
    }

    /// Chat-class operations need a bound identity and a joined room.
    fn identified_room(&self) -> Result<(UserId, Arc<ChatRoom>), Reply> {
        let Some(user_id) = self.user_id.clone() else {
            return Err(Reply::message(ServerMessage::error("no fingerprint set")));
        };
        let Some(room) = self.room.clone() else {
            return Err(Reply::message(ServerMessage::error("not in a room")));
        };
        Ok((user_id, room))
    }
}

fn ack_err(key: String, err: impl Into<String>) -> Reply {
    Reply::message(ServerMessage::Ack {
        key,
        err: Some(err.into()),
    })
}

fn decode_all(frames: &[String]) -> Result<Vec<Vec<u8>>, base64::DecodeError> {
    frames.iter().map(|f| BASE64.decode(f)).collect()
}
