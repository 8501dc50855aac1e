//! In-process transport.
//!
//! `MemoryConnector` hands every opened link to a [`MemoryListener`], which
//! yields the server side as a [`MemoryPeer`]. Tests script a fake server on
//! the peer; embedders can bridge it to anything that speaks text frames.

use super::{Connector, TransportEvent, TransportLink};
use crate::error::{DdpError, Result};
use crate::protocol::Message;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Connector whose transports terminate in this process.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refusing: Arc<AtomicBool>,
    opened: Arc<AtomicUsize>,
}

impl MemoryConnector {
    /// Create a connector and the listener receiving its peers.
    pub fn new() -> (Self, MemoryListener) {
        let (peers, incoming) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                refusing: Arc::new(AtomicBool::new(false)),
                opened: Arc::new(AtomicUsize::new(0)),
            },
            MemoryListener { incoming },
        )
    }

    /// Make subsequent `open` calls fail, as if the server were unreachable.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of `open` calls so far, refused ones included.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, url: &str) -> Result<TransportLink> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if self.refusing.load(Ordering::SeqCst) {
            return Err(DdpError::transport(format!("connection refused: {}", url)));
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            url: url.to_string(),
            inbound: server_rx,
            outbound: server_tx,
        };
        self.peers
            .send(peer)
            .map_err(|_| DdpError::transport("memory listener dropped"))?;

        debug!(url = %url, "Opened memory transport");
        Ok(TransportLink {
            sender: client_tx,
            events: client_rx,
        })
    }
}

/// Receives the server side of every transport opened by a [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    /// Wait for the next opened transport.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.recv().await
    }

    /// Take an already-opened transport without waiting.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.try_recv().ok()
    }
}

/// Server side of a memory transport.
#[derive(Debug)]
pub struct MemoryPeer {
    url: String,
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryPeer {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next frame from the client; `None` once the client closed its side.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Next frame from the client, decoded.
    ///
    /// Frames that are not valid DDP messages are skipped.
    pub async fn recv_message(&mut self) -> Option<Message> {
        loop {
            let frame = self.recv().await?;
            match serde_json::from_str(&frame) {
                Ok(message) => return Some(message),
                Err(e) => debug!(error = %e, "Skipping undecodable frame"),
            }
        }
    }

    /// Send a raw frame to the client. Returns false if the client is gone.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.outbound
            .send(TransportEvent::Frame(frame.into()))
            .is_ok()
    }

    pub fn send_message(&self, message: &Message) -> bool {
        match serde_json::to_string(message) {
            Ok(frame) => self.send(frame),
            Err(_) => false,
        }
    }

    /// Close the transport from the server side.
    pub fn close(self, reason: Option<&str>) {
        let _ = self
            .outbound
            .send(TransportEvent::Closed(reason.map(str::to_string)));
    }
}
