//! Connection state machine.
//!
//! Owns the connection status, the server-issued session id, the handshake
//! and version negotiation, heartbeat bookkeeping, and the reconnection
//! attempt counter. It performs no I/O; the engine turns its transitions into
//! transport actions.
//!
//! ```text
//! Offline ──connect──▶ Connecting ──connected──▶ Connected
//!    ▲                  │      ▲                    │
//!    │        open fail │      │ timer              │ transport lost
//!    │                  ▼      │                    ▼
//!    └──disconnect─── Failed ──┘◀──── timer ──── Waiting
//! ```

mod backoff;

pub use backoff::{Backoff, ReconnectPolicy};

use crate::config::ClientConfig;
use crate::protocol::Message;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Client-visible connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Offline,
    Connecting,
    Failed,
    Waiting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Offline => "offline",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Waiting => "waiting",
            ConnectionStatus::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a `failed` handshake reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionOutcome {
    /// Reopen the transport offering this version.
    Retry(String),
    /// No common version; the connection is abandoned.
    Unsupported { offered: String, suggested: String },
}

/// What the heartbeat timer should do on this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Heartbeat {
    Idle,
    Ping(Message),
    TimedOut,
}

/// What a reachability change means for the pending reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Unchanged,
    /// Recorded; no reconnection is pending.
    Noted,
    /// A reconnection is owed; stop its timer until the network returns.
    Deferred,
    /// A reconnection is owed; skip the rest of the backoff.
    ReconnectNow,
}

/// The connection half of the session.
#[derive(Debug)]
pub struct ConnectionMachine {
    status: ConnectionStatus,
    session_id: Option<String>,
    backoff: Backoff,
    version: String,
    supported: Vec<String>,
    transport_open: bool,
    reconnect_scheduled: bool,
    permanent_failure: bool,
    heartbeat_pending: bool,
    ping_seq: u64,
    renegotiated: bool,
    network_reachable: bool,
}

impl ConnectionMachine {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            status: ConnectionStatus::Offline,
            session_id: None,
            backoff: Backoff::new(config.reconnect.clone()),
            version: config.protocol_version.clone(),
            supported: config.supported_versions.clone(),
            transport_open: false,
            reconnect_scheduled: false,
            permanent_failure: false,
            heartbeat_pending: false,
            ping_seq: 0,
            renegotiated: false,
            network_reachable: true,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Number of consecutive failed attempts since the last successful handshake.
    pub fn attempts(&self) -> u32 {
        self.backoff.failures()
    }

    /// Protocol version offered in the next handshake.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_permanently_failed(&self) -> bool {
        self.permanent_failure
    }

    pub fn reconnect_scheduled(&self) -> bool {
        self.reconnect_scheduled
    }

    /// Start a connection attempt. Returns false if one is already underway.
    pub fn begin_connect(&mut self) -> bool {
        if matches!(
            self.status,
            ConnectionStatus::Connecting | ConnectionStatus::Connected
        ) {
            return false;
        }
        self.status = ConnectionStatus::Connecting;
        self.transport_open = false;
        self.reconnect_scheduled = false;
        self.permanent_failure = false;
        self.renegotiated = false;
        true
    }

    /// The transport reported open; returns the handshake to send.
    pub fn transport_opened(&mut self) -> Option<Message> {
        if self.status != ConnectionStatus::Connecting || self.transport_open {
            return None;
        }
        self.transport_open = true;
        Some(Message::Connect {
            version: self.version.clone(),
            support: self.supported.clone(),
            session: None,
        })
    }

    /// The server accepted the handshake. Returns false if no handshake was in flight.
    pub fn handshake_succeeded(&mut self, session: String) -> bool {
        if self.status != ConnectionStatus::Connecting || !self.transport_open {
            warn!(session = %session, status = %self.status, "Unexpected connected message");
            return false;
        }
        info!(session = %session, version = %self.version, "DDP session established");
        self.status = ConnectionStatus::Connected;
        self.session_id = Some(session);
        self.backoff.reset();
        self.heartbeat_pending = false;
        self.renegotiated = false;
        true
    }

    /// The server refused the offered version.
    pub fn handshake_failed(&mut self, suggested: &str) -> VersionOutcome {
        let offered = self.version.clone();
        if !self.renegotiated && suggested != offered && self.supported.iter().any(|v| v == suggested) {
            info!(offered = %offered, suggested = %suggested, "Renegotiating protocol version");
            self.renegotiated = true;
            self.version = suggested.to_string();
            self.transport_open = false;
            return VersionOutcome::Retry(suggested.to_string());
        }

        warn!(offered = %offered, suggested = %suggested, "No common protocol version");
        self.status = ConnectionStatus::Failed;
        self.transport_open = false;
        self.session_id = None;
        self.reconnect_scheduled = false;
        self.permanent_failure = true;
        VersionOutcome::Unsupported {
            offered,
            suggested: suggested.to_string(),
        }
    }

    /// The transport closed or could not be opened.
    ///
    /// Returns the delay until the next attempt, or `None` if the loss needs
    /// no reconnection (already offline or permanently failed).
    pub fn transport_lost(&mut self) -> Option<Duration> {
        let next = match self.status {
            ConnectionStatus::Connected => ConnectionStatus::Waiting,
            ConnectionStatus::Connecting => ConnectionStatus::Failed,
            ConnectionStatus::Offline
            | ConnectionStatus::Failed
            | ConnectionStatus::Waiting => return None,
        };

        let delay = self.backoff.next_delay();
        self.status = next;
        self.session_id = None;
        self.transport_open = false;
        self.heartbeat_pending = false;
        self.reconnect_scheduled = true;
        debug!(status = %next, attempt = self.backoff.failures(), delay = ?delay, "Reconnect scheduled");
        Some(delay)
    }

    /// The reconnection timer elapsed. Returns true if an attempt should start.
    ///
    /// While the network is unreachable the attempt stays owed and starts
    /// once [`set_network_reachable`](Self::set_network_reachable) reports
    /// the network back.
    pub fn reconnect_due(&mut self) -> bool {
        if !self.reconnect_scheduled || !self.network_reachable {
            return false;
        }
        self.reconnect_scheduled = false;
        if !matches!(
            self.status,
            ConnectionStatus::Waiting | ConnectionStatus::Failed
        ) {
            return false;
        }
        self.begin_connect()
    }

    /// Explicit disconnect. Returns false if already offline.
    pub fn disconnect(&mut self) -> bool {
        let was_offline = self.status == ConnectionStatus::Offline;
        self.status = ConnectionStatus::Offline;
        self.session_id = None;
        self.transport_open = false;
        self.reconnect_scheduled = false;
        self.heartbeat_pending = false;
        !was_offline
    }

    pub fn is_network_reachable(&self) -> bool {
        self.network_reachable
    }

    /// Record a change in network reachability reported by the host.
    pub fn set_network_reachable(&mut self, reachable: bool) -> Reachability {
        if self.network_reachable == reachable {
            return Reachability::Unchanged;
        }
        self.network_reachable = reachable;
        let owed = self.reconnect_scheduled
            && matches!(
                self.status,
                ConnectionStatus::Waiting | ConnectionStatus::Failed
            );
        match (reachable, owed) {
            (true, true) => {
                info!(status = %self.status, "Network reachable; reconnecting now");
                Reachability::ReconnectNow
            }
            (false, true) => {
                info!(status = %self.status, "Network unreachable; reconnect deferred");
                Reachability::Deferred
            }
            _ => {
                debug!(reachable, status = %self.status, "Network reachability changed");
                Reachability::Noted
            }
        }
    }

    /// Any inbound frame proves the connection is alive.
    pub fn frame_received(&mut self) {
        self.heartbeat_pending = false;
    }

    /// Advance the client heartbeat.
    pub fn heartbeat_tick(&mut self) -> Heartbeat {
        if !self.is_connected() {
            return Heartbeat::Idle;
        }
        if self.heartbeat_pending {
            warn!("Heartbeat timed out");
            return Heartbeat::TimedOut;
        }
        self.heartbeat_pending = true;
        self.ping_seq += 1;
        Heartbeat::Ping(Message::Ping {
            id: Some(self.ping_seq.to_string()),
        })
    }
}
