use std::env;
use std::time::Duration;

use crate::session::endpoint::EndpointConfig;
use crate::signaling::PeerId;
use crate::transport::ChunkConfig;
use crate::transport::chunk::{DEFAULT_MAX_FRAGMENT_BYTES, DEFAULT_MAX_MESSAGE_BYTES};

const DEFAULT_CHANNEL_OPEN_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_LOG_FILTER: &str = "info";

/// Peerlink runtime configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Liveness deadline for pre-negotiated channel agreement
    pub channel_open_timeout: Duration,
    /// Default deadline for `Session::wait_connected`
    pub negotiation_timeout: Duration,
    /// Largest fragment put on the wire
    pub max_frame_bytes: usize,
    /// Largest payload a peer may reassemble
    pub max_message_bytes: usize,
    pub auto_answer: bool,
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Config {
    /// Load configuration from environment variables. Unparsable values fall
    /// back to their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            channel_open_timeout: env_millis("PEERLINK_CHANNEL_OPEN_TIMEOUT_MS")
                .unwrap_or(defaults.channel_open_timeout),
            negotiation_timeout: env_millis("PEERLINK_NEGOTIATION_TIMEOUT_MS")
                .unwrap_or(defaults.negotiation_timeout),
            max_frame_bytes: env_parse("PEERLINK_MAX_FRAME_BYTES")
                .filter(|bytes: &usize| *bytes > 0)
                .unwrap_or(defaults.max_frame_bytes),
            max_message_bytes: env_parse("PEERLINK_MAX_MESSAGE_BYTES")
                .filter(|bytes: &usize| *bytes > 0)
                .unwrap_or(defaults.max_message_bytes),
            auto_answer: env::var("PEERLINK_AUTO_ANSWER")
                .ok()
                .and_then(|raw| parse_bool(&raw))
                .unwrap_or(defaults.auto_answer),
            log_filter: env::var("PEERLINK_LOG")
                .ok()
                .filter(|raw| !raw.trim().is_empty())
                .unwrap_or(defaults.log_filter),
        }
    }

    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig::new(self.max_frame_bytes, self.max_message_bytes)
    }

    pub fn endpoint_config(&self, id: PeerId, remote: PeerId) -> EndpointConfig {
        EndpointConfig {
            id,
            remote,
            auto_answer: self.auto_answer,
            channel_open_timeout: self.channel_open_timeout,
            chunk: self.chunk_config(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel_open_timeout: Duration::from_millis(DEFAULT_CHANNEL_OPEN_TIMEOUT_MS),
            negotiation_timeout: Duration::from_millis(DEFAULT_NEGOTIATION_TIMEOUT_MS),
            max_frame_bytes: DEFAULT_MAX_FRAGMENT_BYTES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            auto_answer: true,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|raw| raw.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
