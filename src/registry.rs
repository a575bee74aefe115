//! Owns the admission throttle, identity registry, media pipeline, and the
//! room map; routes inbound connections.

use crate::config::Config;
use crate::identity::IdentityRegistry;
use crate::media::MediaPipeline;
use crate::room::{ChatRoom, RoomOptions};
use crate::throttle::Throttle;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

pub struct RoomRegistry {
    connect_throttle: Throttle,
    message_throttle: Throttle,
    identity: IdentityRegistry,
    pipeline: MediaPipeline,
    rooms: HashMap<String, Arc<ChatRoom>>,
}

impl RoomRegistry {
    pub fn new(config: &Config) -> Self {
        let options = RoomOptions {
            history_limit: config.history_limit,
            history_expiry_ms: config.history_expiry_ms,
            expiry_gain_factor: config.expiry_gain_factor,
        };

        let mut rooms = HashMap::new();
        for name in &config.rooms {
            let room = Arc::new(ChatRoom::new(name.clone(), &options));
            // Operators hand the password to the intended broadcaster.
            tracing::info!(room = %name, password = %room.password(), "room ready");
            rooms.insert(name.clone(), room);
        }

        Self {
            connect_throttle: Throttle::new(
                config.connect_throttle.rate,
                config.connect_throttle.burst,
                config.connect_throttle.window,
            ),
            message_throttle: Throttle::new(
                config.message_throttle.rate,
                config.message_throttle.burst,
                config.message_throttle.window,
            ),
            identity: IdentityRegistry::new(config.id_key.clone(), config.dev_mode),
            pipeline: MediaPipeline::new(
                config.tmp_root.clone(),
                config.accepted_formats.clone(),
                config.output_formats.clone(),
                config.ffmpeg_bin.clone(),
                config.convert_bin.clone(),
            ),
            rooms,
        }
    }

    /// Admission check by peer address, before the WebSocket upgrade. The
    /// first `X-Forwarded-For` entry wins over the socket address when a
    /// proxy is in front. Returns false when the connection must be refused.
    pub fn admit(&self, peer: SocketAddr, forwarded_for: Option<&str>) -> bool {
        let key = forwarded_for
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| peer.ip().to_string());

        let allowed = self.connect_throttle.check(&key);
        if !allowed {
            tracing::warn!(address = %key, "connection refused: exceeded connection limit");
        }
        allowed
    }

    pub fn room(&self, name: &str) -> Option<Arc<ChatRoom>> {
        self.rooms.get(name).cloned()
    }

    pub fn room_exists(&self, name: &str) -> bool {
        self.rooms.contains_key(name)
    }

    pub fn message_throttle(&self) -> &Throttle {
        &self.message_throttle
    }

    pub fn identity(&self) -> &IdentityRegistry {
        &self.identity
    }

    pub fn pipeline(&self) -> &MediaPipeline {
        &self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry_with_connect_burst(burst: u32) -> RoomRegistry {
        let config = Config {
            id_key: "test-secret".to_string(),
            connect_throttle: crate::config::ThrottleConfig {
                rate: 1,
                burst,
                window: Duration::from_secs(60),
            },
            ..Config::default()
        };
        RoomRegistry::new(&config)
    }

    #[test]
    fn rooms_from_config_exist() {
        let registry = registry_with_connect_burst(30);
        assert!(registry.room_exists("lobby"));
        assert!(registry.room("lobby").is_some());
        assert!(!registry.room_exists("does-not-exist"));
        assert!(registry.room("does-not-exist").is_none());
    }

    #[test]
    fn admission_is_rate_limited_per_address() {
        let registry = registry_with_connect_burst(2);
        let peer: SocketAddr = "10.0.0.1:12345".parse().unwrap();

        assert!(registry.admit(peer, None));
        assert!(registry.admit(peer, None));
        assert!(!registry.admit(peer, None));

        // A different address is unaffected.
        let other: SocketAddr = "10.0.0.2:12345".parse().unwrap();
        assert!(registry.admit(other, None));
    }

    #[test]
    fn forwarded_header_takes_precedence() {
        let registry = registry_with_connect_burst(1);
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        assert!(registry.admit(peer, Some("203.0.113.7, 10.0.0.1")));
        // Same client behind the proxy is now limited...
        assert!(!registry.admit(peer, Some("203.0.113.7, 10.0.0.9")));
        // ...but a different forwarded client is not.
        assert!(registry.admit(peer, Some("203.0.113.8")));
    }
}
