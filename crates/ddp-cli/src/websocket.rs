//! WebSocket transport.
//!
//! Opens a raw WebSocket and pumps text frames between it and the channels of
//! a [`TransportLink`]. A writer task owns the sink and a reader task owns the
//! stream; dropping the link's sender ends the writer, which closes the socket.

use async_trait::async_trait;
use ddp_core::{Connector, DdpError, TransportEvent, TransportLink};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::debug;

/// Connector for `ws://` servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> ddp_core::Result<TransportLink> {
        debug!(url = %url, "Connecting to WebSocket");
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| DdpError::transport(format!("WebSocket connect failed: {}", e)))?;
        let (mut sink, mut stream) = ws.split();
        debug!(url = %url, "WebSocket connected");

        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    debug!(error = %e, "WebSocket send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if events_tx.send(TransportEvent::Frame(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.to_string());
                    }
                    // Pong is handled automatically by tungstenite
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Some(format!("WebSocket error: {}", e)),
                    None => break None,
                }
            };
            let _ = events_tx.send(TransportEvent::Closed(reason));
        });

        Ok(TransportLink {
            sender: frames_tx,
            events: events_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let err = WebSocketConnector
            .open("ws://127.0.0.1:1/websocket")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
