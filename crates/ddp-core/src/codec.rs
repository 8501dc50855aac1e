//! Frame codec seam.
//!
//! The engine deals in [`Message`] values; the transport moves text frames.
//! A `Codec` converts between the two. `JsonCodec` is the standard DDP
//! encoding (one JSON object per frame).

use crate::error::{DdpError, Result};
use crate::protocol::Message;

/// Converts protocol messages to and from transport frames.
pub trait Codec: Send + Sync + 'static {
    /// Encode a message into a single frame.
    fn encode(&self, message: &Message) -> Result<String>;

    /// Decode a single frame into a message.
    fn decode(&self, frame: &str) -> Result<Message>;
}

/// Plain JSON encoding, as spoken by Meteor servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, message: &Message) -> Result<String> {
        Ok(serde_json::to_string(message)?)
    }

    fn decode(&self, frame: &str) -> Result<Message> {
        let value: serde_json::Value = serde_json::from_str(frame)?;

        // Servers open with a `{"server_id": "0"}` banner that carries no `msg`.
        if value.get("msg").is_none() {
            return Err(DdpError::Codec {
                message: format!("frame has no msg field: {}", frame),
            });
        }

        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ready() {
        let msg = JsonCodec.decode(r#"{"msg":"ready","subs":["a","b"]}"#).unwrap();
        assert_eq!(
            msg,
            Message::Ready {
                subs: vec!["a".to_string(), "b".to_string()]
            }
        );
    }

    #[test]
    fn test_decode_server_banner_is_error() {
        let err = JsonCodec.decode(r#"{"server_id":"0"}"#).unwrap_err();
        assert!(matches!(err, DdpError::Codec { .. }));
    }

    #[test]
    fn test_decode_unknown_msg_is_error() {
        assert!(JsonCodec.decode(r#"{"msg":"teleport"}"#).is_err());
    }

    #[test]
    fn test_encode_method() {
        let frame = JsonCodec
            .encode(&Message::Method {
                id: "1".to_string(),
                method: "insertPost".to_string(),
                params: vec![serde_json::json!("hi")],
                random_seed: None,
            })
            .unwrap();
        assert_eq!(
            frame,
            r#"{"msg":"method","id":"1","method":"insertPost","params":["hi"]}"#
        );
    }
}
