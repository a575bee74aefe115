//! Environment-driven configuration.

use crate::types::OutputFormat;
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub rate: u32,
    pub burst: u32,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Rooms created at startup.
    pub rooms: Vec<String>,
    /// Server secret mixed into user-id hashes.
    pub id_key: String,
    pub history_limit: usize,
    pub history_expiry_ms: u64,
    /// Must be > 1; controls how much longer a quiet room retains its last
    /// messages.
    pub expiry_gain_factor: f64,
    /// Address-keyed throttle at connection admission.
    pub connect_throttle: ThrottleConfig,
    /// User-id-keyed throttle at message submission.
    pub message_throttle: ThrottleConfig,
    /// Mime types accepted as frame input.
    pub accepted_formats: Vec<String>,
    /// Representations the pipeline produces per message.
    pub output_formats: Vec<OutputFormat>,
    pub tmp_root: PathBuf,
    pub ffmpeg_bin: String,
    pub convert_bin: String,
    pub dev_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            rooms: vec!["lobby".to_string()],
            id_key: String::new(),
            history_limit: 15,
            history_expiry_ms: 10 * 60 * 1000,
            // Chosen so the last message in a quiet room lives about 6 hours.
            expiry_gain_factor: 1.2548346,
            connect_throttle: ThrottleConfig {
                rate: 3,
                burst: 30,
                window: Duration::from_secs(60),
            },
            message_throttle: ThrottleConfig {
                rate: 6,
                burst: 18,
                window: Duration::from_secs(60),
            },
            accepted_formats: vec!["image/jpeg".to_string()],
            output_formats: vec![OutputFormat::Jpg, OutputFormat::Mp4],
            tmp_root: std::env::temp_dir().join("clipchat"),
            ffmpeg_bin: "ffmpeg".to_string(),
            convert_bin: "convert".to_string(),
            dev_mode: false,
        }
    }
}

impl Config {
    /// Load config from environment variables, falling back to defaults with
    /// logged warnings where values are missing or unparseable.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let id_key = match std::env::var("CLIPCHAT_ID_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => {
                tracing::warn!(
                    "CLIPCHAT_ID_KEY not set; using a random secret - user ids will not be stable across restarts"
                );
                random_secret()
            }
        };

        let expiry_gain_factor = env_parse("CLIPCHAT_EXPIRY_GAIN", defaults.expiry_gain_factor);
        let expiry_gain_factor = if expiry_gain_factor > 1.0 {
            expiry_gain_factor
        } else {
            tracing::warn!(
                value = expiry_gain_factor,
                "CLIPCHAT_EXPIRY_GAIN must be > 1, using default"
            );
            defaults.expiry_gain_factor
        };

        let rooms = std::env::var("CLIPCHAT_ROOMS")
            .map(|v| {
                v.split(',')
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect::<Vec<_>>()
            })
            .ok()
            .filter(|rooms| !rooms.is_empty())
            .unwrap_or_else(|| defaults.rooms.clone());

        let config = Self {
            port: env_parse("CLIPCHAT_PORT", defaults.port),
            rooms,
            id_key,
            history_limit: env_parse("CLIPCHAT_HISTORY_LIMIT", defaults.history_limit),
            history_expiry_ms: env_parse("CLIPCHAT_HISTORY_EXPIRY_MS", defaults.history_expiry_ms),
            expiry_gain_factor,
            connect_throttle: ThrottleConfig {
                rate: env_parse("CLIPCHAT_CONNECT_RATE", defaults.connect_throttle.rate),
                burst: env_parse("CLIPCHAT_CONNECT_BURST", defaults.connect_throttle.burst),
                window: Duration::from_millis(env_parse(
                    "CLIPCHAT_CONNECT_WINDOW_MS",
                    defaults.connect_throttle.window.as_millis() as u64,
                )),
            },
            message_throttle: ThrottleConfig {
                rate: env_parse("CLIPCHAT_MESSAGE_RATE", defaults.message_throttle.rate),
                burst: env_parse("CLIPCHAT_MESSAGE_BURST", defaults.message_throttle.burst),
                window: Duration::from_millis(env_parse(
                    "CLIPCHAT_MESSAGE_WINDOW_MS",
                    defaults.message_throttle.window.as_millis() as u64,
                )),
            },
            accepted_formats: defaults.accepted_formats.clone(),
            output_formats: defaults.output_formats.clone(),
            tmp_root: std::env::var("CLIPCHAT_TMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| defaults.tmp_root.clone()),
            ffmpeg_bin: std::env::var("CLIPCHAT_FFMPEG")
                .unwrap_or_else(|_| defaults.ffmpeg_bin.clone()),
            convert_bin: std::env::var("CLIPCHAT_CONVERT")
                .unwrap_or_else(|_| defaults.convert_bin.clone()),
            dev_mode: std::env::var("CLIPCHAT_DEV")
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(false),
        };

        tracing::info!(
            port = config.port,
            rooms = ?config.rooms,
            history_limit = config.history_limit,
            dev_mode = config.dev_mode,
            "config loaded"
        );
        config
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(key, value, "unparseable env value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn random_secret() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    hex::encode(bytes)
}
