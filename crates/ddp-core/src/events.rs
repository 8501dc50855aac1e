//! Client lifecycle events.
//!
//! Everything an observer might want to know about the session is published
//! as a [`ClientEvent`] on a broadcast channel. Publishing never blocks and
//! never fails: with no receivers the event is simply dropped.

use crate::account::Account;
use crate::connection::ConnectionStatus;
use crate::error::DdpError;
use crate::methods::MethodInfo;
use crate::protocol::{Message, ServerError};
use crate::subscriptions::SubscriptionInfo;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::sync::broadcast;

/// A lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    // Connection
    ConnectionStatusChanged(ConnectionStatus),
    WillConnect,
    WillDisconnect,
    DidConnect {
        session: String,
    },
    DidFail(#[serde(serialize_with = "display")] DdpError),
    ReachabilityChanged(bool),

    // Account
    AccountChanged(Option<Account>),
    WillLogin {
        method: String,
        params: Vec<Value>,
    },
    DidLogin(Account),
    DidFailLogin(#[serde(serialize_with = "display")] DdpError),
    WillLogout,
    DidLogout,

    // Subscriptions
    WillSubscribe(SubscriptionInfo),
    WillUnsubscribe(SubscriptionInfo),
    SubscriptionReady(SubscriptionInfo),
    SubscriptionError {
        subscription: SubscriptionInfo,
        error: ServerError,
    },

    // Methods
    WillCallMethod(MethodInfo),
    MethodResult {
        method: MethodInfo,
        result: std::result::Result<Value, ServerError>,
    },
    MethodDataUpdated(MethodInfo),

    // Data
    Document(Message),

    // Diagnostics
    MessageSent(Message),
    MessageReceived(Message),
    InvariantViolation(#[serde(serialize_with = "display")] DdpError),
}

fn display<S: Serializer>(err: &DdpError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(err)
}

/// Fan-out point for [`ClientEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: ClientEvent) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_emit_without_receivers() {
        let bus = EventBus::new(4);
        bus.emit(ClientEvent::WillConnect);
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_receivers_see_events_in_order() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.emit(ClientEvent::WillConnect);
        bus.emit(ClientEvent::DidConnect {
            session: "s1".to_string(),
        });
        assert_eq!(rx.recv().await.unwrap(), ClientEvent::WillConnect);
        assert_eq!(
            rx.recv().await.unwrap(),
            ClientEvent::DidConnect {
                session: "s1".to_string()
            }
        );
    }

    #[test]
    fn test_events_serialize_as_tagged_json() {
        let value = serde_json::to_value(ClientEvent::ConnectionStatusChanged(
            ConnectionStatus::Waiting,
        ))
        .unwrap();
        assert_eq!(
            value,
            json!({"event": "connection-status-changed", "data": "waiting"})
        );

        let value = serde_json::to_value(ClientEvent::DidFail(DdpError::transport("reset"))).unwrap();
        assert_eq!(value["data"], "Transport error: reset");

        let value = serde_json::to_value(ClientEvent::WillLogout).unwrap();
        assert_eq!(value, json!({"event": "will-logout"}));
    }
}
