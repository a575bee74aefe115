//! Per-room state machine: history, broadcast slots, broadcaster role, and
//! event fan-out.

use crate::history::HistoryBuffer;
use crate::protocol::{BroadcastKind, ServerMessage};
use crate::types::{HistoryEntry, MediaVariants, OutputFormat, UserId};
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const PASSWORD_LEN: usize = 6;
const PASSWORD_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RoomError {
    #[error("not the broadcaster")]
    NotBroadcaster,
}

/// Room options, injected by the registry.
#[derive(Debug, Clone)]
pub struct RoomOptions {
    pub history_limit: usize,
    pub history_expiry_ms: u64,
    pub expiry_gain_factor: f64,
}

/// Events fanned out to every member's subscription. Each member filters
/// media to its own negotiated format before forwarding.
#[derive(Clone)]
pub enum RoomEvent {
    Chat(Arc<HistoryEntry>),
    Broadcast {
        kind: BroadcastKind,
        entry: Arc<HistoryEntry>,
    },
    Broadcaster(Option<UserId>),
    Active(usize),
}

impl RoomEvent {
    /// Render the event for one connection's negotiated format.
    pub fn to_message(&self, format: OutputFormat) -> ServerMessage {
        match self {
            RoomEvent::Chat(entry) => ServerMessage::chat(entry, format),
            RoomEvent::Broadcast { kind, entry } => ServerMessage::broadcast(*kind, entry, format),
            RoomEvent::Broadcaster(id) => ServerMessage::Broadcaster { id: id.clone() },
            RoomEvent::Active(count) => ServerMessage::Active { count: *count },
        }
    }
}

/// The three independent broadcast slots. Replaced wholesale by updates,
/// never merged.
#[derive(Default)]
struct BroadcastState {
    video: Option<Arc<HistoryEntry>>,
    topic: Option<Arc<HistoryEntry>>,
    image: Option<Arc<HistoryEntry>>,
}

impl BroadcastState {
    fn slot_mut(&mut self, kind: BroadcastKind) -> &mut Option<Arc<HistoryEntry>> {
        match kind {
            BroadcastKind::Video => &mut self.video,
            BroadcastKind::Topic => &mut self.topic,
            BroadcastKind::Image => &mut self.image,
        }
    }

    fn slots(&self) -> [(BroadcastKind, &Option<Arc<HistoryEntry>>); 3] {
        [
            (BroadcastKind::Video, &self.video),
            (BroadcastKind::Topic, &self.topic),
            (BroadcastKind::Image, &self.image),
        ]
    }
}

struct RoomInner {
    history: HistoryBuffer,
    broadcast: BroadcastState,
    broadcaster: Option<UserId>,
    active: usize,
}

/// One chat room. All mutable state sits behind a single lock, so every
/// mutation happens in one logical turn; encodes run outside the lock.
pub struct ChatRoom {
    name: String,
    password: String,
    events: broadcast::Sender<RoomEvent>,
    inner: RwLock<RoomInner>,
}

impl ChatRoom {
    pub fn new(name: String, options: &RoomOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let password = generate_password();
        tracing::info!(room = %name, "created chat room");
        Self {
            name,
            password,
            events,
            inner: RwLock::new(RoomInner {
                history: HistoryBuffer::new(
                    options.history_limit,
                    options.history_expiry_ms,
                    options.expiry_gain_factor,
                ),
                broadcast: BroadcastState::default(),
                broadcaster: None,
                active: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The generated broadcaster password, for the operator log and tests.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Add a member: bumps presence and returns the replay (broadcaster,
    /// non-empty broadcast slots, history snapshot) filtered to `format`,
    /// plus this member's event subscription.
    ///
    /// The subscription is created under the same lock as the replay so no
    /// event between the two can be missed or doubled.
    pub async fn join(
        &self,
        format: OutputFormat,
    ) -> (Vec<ServerMessage>, broadcast::Receiver<RoomEvent>) {
        let mut inner = self.inner.write().await;
        inner.active += 1;
        let _ = self.events.send(RoomEvent::Active(inner.active));

        let rx = self.events.subscribe();

        let mut replay = vec![
            ServerMessage::Broadcaster {
                id: inner.broadcaster.clone(),
            },
            // The Active event above went out before this member subscribed,
            // so the count has to ride along in the replay.
            ServerMessage::Active {
                count: inner.active,
            },
        ];
        for (kind, slot) in inner.broadcast.slots() {
            if let Some(entry) = slot {
                replay.push(ServerMessage::broadcast(kind, entry, format));
            }
        }
        for entry in inner.history.snapshot(Utc::now()) {
            replay.push(ServerMessage::chat(&entry, format));
        }

        (replay, rx)
    }

    pub async fn leave(&self) {
        let mut inner = self.inner.write().await;
        inner.active = inner.active.saturating_sub(1);
        let _ = self.events.send(RoomEvent::Active(inner.active));
    }

    pub async fn active(&self) -> usize {
        self.inner.read().await.active
    }

    /// Commit a converted chat: append to history and fan out. History order
    /// is commit order, which may differ from submission order across
    /// connections.
    pub async fn commit_chat(&self, entry: crate::types::ChatEntry, media: MediaVariants) {
        let entry = Arc::new(HistoryEntry { chat: entry, media });
        let mut inner = self.inner.write().await;
        tracing::debug!(room = %self.name, key = %entry.chat.key, "committing chat to history");
        inner.history.append(entry.clone());
        let _ = self.events.send(RoomEvent::Chat(entry));
    }

    /// Claim the broadcaster role by presenting the room password. The last
    /// successful claimant wins; a wrong password is silently ignored.
    pub async fn authenticate(&self, user_id: &UserId, password: &str) -> bool {
        if password != self.password {
            return false;
        }
        let mut inner = self.inner.write().await;
        let old = inner.broadcaster.replace(user_id.clone());
        tracing::info!(room = %self.name, new = %user_id, old = ?old, "new broadcaster");
        let _ = self
            .events
            .send(RoomEvent::Broadcaster(inner.broadcaster.clone()));
        true
    }

    pub async fn is_broadcaster(&self, user_id: &UserId) -> bool {
        self.inner.read().await.broadcaster.as_deref() == Some(user_id.as_str())
    }

    /// Replace one broadcast slot wholesale and fan the update out. The
    /// broadcaster role is re-verified inside the lock, since the role may
    /// have moved while the payload was being encoded.
    pub async fn set_broadcast(
        &self,
        user_id: &UserId,
        kind: BroadcastKind,
        entry: crate::types::ChatEntry,
        media: MediaVariants,
    ) -> Result<(), RoomError> {
        let entry = Arc::new(HistoryEntry { chat: entry, media });
        let mut inner = self.inner.write().await;
        if inner.broadcaster.as_deref() != Some(user_id.as_str()) {
            return Err(RoomError::NotBroadcaster);
        }
        *inner.broadcast.slot_mut(kind) = Some(entry.clone());
        let _ = self.events.send(RoomEvent::Broadcast { kind, entry });
        Ok(())
    }
}

fn generate_password() -> String {
    let mut rng = rand::rng();
    (0..PASSWORD_LEN)
        .map(|_| PASSWORD_CHARS[rng.random_range(0..PASSWORD_CHARS.len())] as char)
        .collect()
}
