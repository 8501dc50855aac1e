//! Centralized configuration for the DDP client.
//!
//! Protocol constants and timing defaults live in associated-constant groups;
//! [`ClientConfig`] carries the per-client values.

use crate::connection::ReconnectPolicy;
use crate::error::{DdpError, Result};
use std::time::Duration;
use url::Url;

/// Protocol-level constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Version offered in the first handshake.
    pub const DEFAULT_VERSION: &'static str = "1";
    /// Versions this client can speak, most preferred first.
    pub const SUPPORTED_VERSIONS: &'static [&'static str] = &["1", "pre2", "pre1"];
    /// Path Meteor serves raw WebSocket DDP on.
    pub const WEBSOCKET_PATH: &'static str = "/websocket";
    pub const LOGIN_METHOD: &'static str = "login";
    pub const LOGOUT_METHOD: &'static str = "logout";
}

/// Reconnection timing defaults.
pub struct ReconnectConfig;

impl ReconnectConfig {
    /// Wait before the first reconnection attempt after a loss.
    pub const INITIAL_DELAY: Duration = Duration::from_secs(1);
    pub const MAX_DELAY: Duration = Duration::from_secs(60);
    /// Each failed attempt multiplies the delay by this.
    pub const GROWTH_FACTOR: f64 = 2.0;
}

/// Heartbeat timing defaults.
pub struct HeartbeatConfig;

impl HeartbeatConfig {
    pub const INTERVAL: Duration = Duration::from_millis(17_500);
}

/// Event fan-out defaults.
pub struct EventConfig;

impl EventConfig {
    /// Slow observers lag (and lose old events) past this many buffered events.
    pub const CHANNEL_CAPACITY: usize = 1024;
}

/// Configuration for a single client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Normalized WebSocket URL of the server.
    pub url: String,
    /// Backoff applied between reconnection attempts.
    pub reconnect: ReconnectPolicy,
    /// Interval between client pings while connected; `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Version offered in the first handshake.
    pub protocol_version: String,
    /// Versions accepted when the server suggests another one.
    pub supported_versions: Vec<String>,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl ClientConfig {
    /// Create a configuration for `server_url`.
    ///
    /// `http`/`https` URLs are mapped to `ws`/`wss`, and a bare host gets the
    /// standard `/websocket` path.
    pub fn new(server_url: &str) -> Result<Self> {
        Ok(Self {
            url: normalize_url(server_url)?,
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Some(HeartbeatConfig::INTERVAL),
            protocol_version: ProtocolConfig::DEFAULT_VERSION.to_string(),
            supported_versions: ProtocolConfig::SUPPORTED_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            event_capacity: EventConfig::CHANNEL_CAPACITY,
        })
    }

    /// Set the reconnection backoff policy.
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set or disable the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the versions this client supports; the first one is offered first.
    pub fn with_versions<I, S>(mut self, versions: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let versions: Vec<String> = versions.into_iter().map(Into::into).collect();
        let first = versions.first().cloned().ok_or_else(|| DdpError::Config {
            message: "at least one protocol version is required".to_string(),
        })?;
        self.protocol_version = first;
        self.supported_versions = versions;
        Ok(self)
    }

    /// Set the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

fn normalize_url(server_url: &str) -> Result<String> {
    let mut url = Url::parse(server_url).map_err(|e| DdpError::Config {
        message: format!("Invalid server URL {}: {}", server_url, e),
    })?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(DdpError::Config {
                message: format!("Unsupported URL scheme: {}", other),
            })
        }
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme).map_err(|_| DdpError::Config {
            message: format!("Cannot convert {} to a WebSocket URL", server_url),
        })?;
    }

    if url.path().is_empty() || url.path() == "/" {
        url.set_path(ProtocolConfig::WEBSOCKET_PATH);
    }

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_url_becomes_websocket() {
        let config = ClientConfig::new("http://localhost:3000").unwrap();
        assert_eq!(config.url, "ws://localhost:3000/websocket");

        let config = ClientConfig::new("https://example.com/").unwrap();
        assert_eq!(config.url, "wss://example.com/websocket");
    }

    #[test]
    fn test_explicit_path_is_kept() {
        let config = ClientConfig::new("wss://example.com/sockjs/raw").unwrap();
        assert_eq!(config.url, "wss://example.com/sockjs/raw");
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(matches!(
            ClientConfig::new("ftp://example.com"),
            Err(DdpError::Config { .. })
        ));
        assert!(ClientConfig::new("not a url").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("ws://localhost:3000/websocket").unwrap();
        assert_eq!(config.protocol_version, "1");
        assert_eq!(config.supported_versions, vec!["1", "pre2", "pre1"]);
        assert_eq!(config.heartbeat_interval, Some(HeartbeatConfig::INTERVAL));
        assert!(!config.reconnect.jitter);
    }

    #[test]
    fn test_with_versions() {
        let config = ClientConfig::new("ws://localhost:3000")
            .unwrap()
            .with_versions(["pre2", "pre1"])
            .unwrap();
        assert_eq!(config.protocol_version, "pre2");
        assert!(ClientConfig::new("ws://localhost:3000")
            .unwrap()
            .with_versions(Vec::<String>::new())
            .is_err());
    }
}
