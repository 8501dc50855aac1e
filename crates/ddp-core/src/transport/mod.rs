//! Transport seam.
//!
//! The engine never touches sockets. A [`Connector`] opens a duplex text
//! stream to a URL and hands back a [`TransportLink`]: a sender for outbound
//! frames and a receiver of inbound [`TransportEvent`]s. Dropping the sender
//! closes the transport.

mod memory;

pub use memory::{MemoryConnector, MemoryListener, MemoryPeer};

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Something that happened on an open transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One inbound text frame.
    Frame(String),
    /// The transport closed, with an optional reason.
    Closed(Option<String>),
}

/// An open transport.
#[derive(Debug)]
pub struct TransportLink {
    pub sender: mpsc::UnboundedSender<String>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a transport to `url`. Resolves once the transport is open.
    async fn open(&self, url: &str) -> Result<TransportLink>;
}
