use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::media::DEFAULT_STUN_URL;
use crate::room::SessionConfig;
use crate::room::health::HealthConfig;
use crate::signaling::SignalingConfig;
use crate::signaling::correlator::DEFAULT_MATCH_TIMEOUT;
use crate::signaling::websocket::{DEFAULT_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY};

pub const DEFAULT_SOCKET_URL: &str = "http://127.0.0.1:3000";

/// Voice room client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Signaling server base URL (defaults to "http://127.0.0.1:3000")
    pub socket_url: String,
    pub auth_token: Option<String>,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub match_timeout: Duration,
    pub health_samples: u32,
    pub health_interval: Duration,
    pub fallback_stun: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let socket_url = env::var("VOICE_ROOM_SOCKET_URL")
            .map(|url| normalize_localhost(&url))
            .unwrap_or(defaults.socket_url);
        let auth_token = env::var("VOICE_ROOM_AUTH_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());
        let fallback_stun = env::var("VOICE_ROOM_FALLBACK_STUN")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or(defaults.fallback_stun);

        Self {
            socket_url,
            auth_token,
            reconnect_attempts: parse_var("VOICE_ROOM_RECONNECT_ATTEMPTS")
                .unwrap_or(defaults.reconnect_attempts),
            reconnect_delay: parse_var("VOICE_ROOM_RECONNECT_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_delay),
            match_timeout: parse_var("VOICE_ROOM_MATCH_TIMEOUT_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.match_timeout),
            health_samples: parse_var("VOICE_ROOM_HEALTH_SAMPLES")
                .filter(|samples| *samples > 0)
                .unwrap_or(defaults.health_samples),
            health_interval: parse_var("VOICE_ROOM_HEALTH_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.health_interval),
            fallback_stun,
        }
    }

    pub fn signaling_config(&self) -> SignalingConfig {
        SignalingConfig {
            url: self.socket_url.clone(),
            auth_token: self.auth_token.clone(),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay: self.reconnect_delay,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            match_timeout: self.match_timeout,
            fallback_stun: self.fallback_stun.clone(),
            health: HealthConfig {
                samples: self.health_samples,
                interval: self.health_interval,
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let health = HealthConfig::default();
        Self {
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            auth_token: None,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            match_timeout: DEFAULT_MATCH_TIMEOUT,
            health_samples: health.samples,
            health_interval: health.interval,
            fallback_stun: DEFAULT_STUN_URL.to_string(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring invalid value; using default");
            None
        }
    }
}

/// Normalize localhost to IPv4 to avoid an IPv6 (::1) preference when the
/// server only listens on 127.0.0.1.
pub fn normalize_localhost(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.host_str() == Some("localhost") => {
            if url.set_host(Some("127.0.0.1")).is_err() {
                return raw.to_string();
            }
            let mut normalized = url.to_string();
            if !raw.ends_with('/') && url.path() == "/" {
                normalized.pop();
            }
            normalized
        }
        _ => raw.to_string(),
    }
}
