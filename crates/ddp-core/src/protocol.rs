//! DDP message types.
//!
//! Every frame on the wire is a JSON object whose `msg` field names the
//! message type. The enum below is the structured form the engine works with;
//! turning it into bytes is the codec's job.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single DDP protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "camelCase")]
pub enum Message {
    // Handshake
    Connect {
        version: String,
        support: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    Connected {
        session: String,
    },
    Failed {
        version: String,
    },

    // Heartbeat
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    // Subscriptions
    Sub {
        id: String,
        name: String,
        #[serde(default)]
        params: Vec<Value>,
    },
    Unsub {
        id: String,
    },
    Ready {
        subs: Vec<String>,
    },
    Nosub {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ServerError>,
    },

    // Remote procedure calls
    Method {
        id: String,
        method: String,
        #[serde(default)]
        params: Vec<Value>,
        #[serde(rename = "randomSeed", default, skip_serializing_if = "Option::is_none")]
        random_seed: Option<String>,
    },
    Result {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ServerError>,
    },
    Updated {
        methods: Vec<String>,
    },

    // Server complaint about a malformed client message
    Error {
        reason: String,
        #[serde(
            rename = "offendingMessage",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        offending_message: Option<Value>,
    },

    // Document stream
    Added {
        collection: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fields: Option<Map<String, Value>>,
    },
    Changed {
        collection: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fields: Option<Map<String, Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cleared: Option<Vec<String>>,
    },
    Removed {
        collection: String,
        id: String,
    },
    AddedBefore {
        collection: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fields: Option<Map<String, Value>>,
        #[serde(default)]
        before: Option<String>,
    },
    MovedBefore {
        collection: String,
        id: String,
        #[serde(default)]
        before: Option<String>,
    },
}

impl Message {
    /// The value of the `msg` field for this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Connect { .. } => "connect",
            Message::Connected { .. } => "connected",
            Message::Failed { .. } => "failed",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Sub { .. } => "sub",
            Message::Unsub { .. } => "unsub",
            Message::Ready { .. } => "ready",
            Message::Nosub { .. } => "nosub",
            Message::Method { .. } => "method",
            Message::Result { .. } => "result",
            Message::Updated { .. } => "updated",
            Message::Error { .. } => "error",
            Message::Added { .. } => "added",
            Message::Changed { .. } => "changed",
            Message::Removed { .. } => "removed",
            Message::AddedBefore { .. } => "addedBefore",
            Message::MovedBefore { .. } => "movedBefore",
        }
    }

    /// Whether this message patches the document cache.
    pub fn is_document(&self) -> bool {
        matches!(
            self,
            Message::Added { .. }
                | Message::Changed { .. }
                | Message::Removed { .. }
                | Message::AddedBefore { .. }
                | Message::MovedBefore { .. }
        )
    }
}

/// Application-level error object sent by the server in `result` and `nosub`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code; Meteor sends either a number or a string here.
    pub error: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "errorType", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ServerError {
    /// Create a server error with a code and human-readable reason.
    pub fn new(error: impl Into<Value>, reason: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            reason: Some(reason.into()),
            message: None,
            error_type: None,
            details: None,
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match &self.error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match (&self.reason, &self.message) {
            (Some(reason), _) => write!(f, "{} [{}]", reason, code),
            (None, Some(message)) => write!(f, "{}", message),
            (None, None) => write!(f, "[{}]", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sub_serializes_with_msg_tag() {
        let msg = Message::Sub {
            id: "a1".to_string(),
            name: "posts".to_string(),
            params: vec![json!(10)],
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"msg": "sub", "id": "a1", "name": "posts", "params": [10]})
        );
    }

    #[test]
    fn test_connect_omits_missing_session() {
        let msg = Message::Connect {
            version: "1".to_string(),
            support: vec!["1".to_string(), "pre2".to_string()],
            session: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("session").is_none());
        assert_eq!(value["msg"], "connect");
    }

    #[test]
    fn test_result_with_error_parses() {
        let msg: Message = serde_json::from_value(json!({
            "msg": "result",
            "id": "3",
            "error": {"error": 403, "reason": "Login forbidden", "errorType": "Meteor.Error"}
        }))
        .unwrap();
        match msg {
            Message::Result { id, result, error } => {
                assert_eq!(id, "3");
                assert!(result.is_none());
                let error = error.unwrap();
                assert_eq!(error.error, json!(403));
                assert_eq!(error.error_type.as_deref(), Some("Meteor.Error"));
            }
            other => panic!("Expected result, got {:?}", other),
        }
    }

    #[test]
    fn test_camel_case_document_messages() {
        let msg: Message = serde_json::from_value(json!({
            "msg": "addedBefore",
            "collection": "posts",
            "id": "p1",
            "fields": {"title": "hi"},
            "before": null
        }))
        .unwrap();
        assert!(msg.is_document());
        assert_eq!(msg.kind(), "addedBefore");
    }

    #[test]
    fn test_ping_without_id() {
        let msg: Message = serde_json::from_value(json!({"msg": "ping"})).unwrap();
        assert_eq!(msg, Message::Ping { id: None });
        assert!(!msg.is_document());
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::new(403, "Incorrect password");
        assert_eq!(err.to_string(), "Incorrect password [403]");

        let err = ServerError::new("not-found", "Subscription not found");
        assert_eq!(err.to_string(), "Subscription not found [not-found]");
    }
}
