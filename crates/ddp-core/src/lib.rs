//! DDP Core - session state machine and correlation engine for DDP clients.
//!
//! This crate implements the client side of the Distributed Data Protocol:
//! connection lifecycle with automatic reconnection, subscription tracking,
//! and method-call correlation with result/data-flush ordering. Sockets and
//! the document cache are left to the embedder: transports plug in through
//! [`Connector`], and document messages are forwarded as
//! [`ClientEvent::Document`].
//!
//! # Example
//!
//! ```rust,ignore
//! use ddp_core::{Client, ClientConfig, MemoryConnector};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> ddp_core::Result<()> {
//!     let (connector, _listener) = MemoryConnector::new();
//!     let client = Client::new(ClientConfig::new("ws://localhost:3000")?, connector);
//!     client.connect()?;
//!
//!     let mut posts = client.subscribe("posts", vec![json!({"limit": 10})]).await?;
//!     posts.ready().await?;
//!
//!     let sum = client.call_and_wait("add", vec![json!(1), json!(2)]).await?;
//!     println!("1 + 2 = {}", sum);
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod callback;
pub mod codec;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod methods;
pub mod protocol;
pub mod subscriptions;
pub mod transport;

mod client;

// Re-export commonly used types
pub use account::{Account, AccountHandler, AccountSnapshot};
pub use callback::Callback;
pub use client::{Client, ClientBuilder};
pub use codec::{Codec, JsonCodec};
pub use config::{ClientConfig, EventConfig, HeartbeatConfig, ProtocolConfig, ReconnectConfig};
pub use connection::{Backoff, ConnectionStatus, ReconnectPolicy};
pub use engine::{Action, Engine};
pub use error::{DdpError, Result};
pub use events::{ClientEvent, EventBus};
pub use methods::{CallOptions, MethodCall, MethodHandler, MethodInfo, MethodStub};
pub use protocol::{Message, ServerError};
pub use subscriptions::{SubscriptionHandle, SubscriptionInfo, SubscriptionState};
pub use transport::{
    Connector, MemoryConnector, MemoryListener, MemoryPeer, TransportEvent, TransportLink,
};
