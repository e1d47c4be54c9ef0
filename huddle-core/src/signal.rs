//! Signaling envelope and the per-client writer.
//!
//! Every frame on the signaling channel is `{event: string, data: object}`.
//! The `data` object is kept as an open dictionary: control events carry
//! ad-hoc fields, and forwarded peer-to-peer payloads (SDP, ICE candidates)
//! pass through untouched apart from sender/target rewriting.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Field in `data` that requests unicast forwarding to another peer
pub const TARGET_PEER_ID: &str = "targetPeerId";
/// Field in `data` stamped with the sender's peer id on forwarded messages
pub const PEER_ID: &str = "peerId";

/// A signaling frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl SignalMessage {
    #[must_use]
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Parse an inbound frame. The event field must be a non-empty string;
    /// anything else is rejected so the caller can log and skip it.
    pub fn parse(text: &str) -> Result<Self> {
        let msg: Self = serde_json::from_str(text)?;
        if msg.event.is_empty() {
            return Err(Error::InvalidMessage("missing event field".to_string()));
        }
        Ok(msg)
    }

    /// String field lookup inside `data`
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// The forwarding target, when this frame addresses a single peer
    #[must_use]
    pub fn target_peer_id(&self) -> Option<String> {
        self.data_str(TARGET_PEER_ID).map(str::to_string)
    }

    /// Rewrite this frame for unicast forwarding: stamp the sender's id as
    /// `peerId` and strip `targetPeerId`.
    #[must_use]
    pub fn into_forwarded(self, sender: &str) -> Self {
        let mut data = match self.data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        data.remove(TARGET_PEER_ID);
        data.insert(PEER_ID.to_string(), Value::String(sender.to_string()));
        Self {
            event: self.event,
            data: Value::Object(data),
        }
    }
}

/// Thread-safe writer for one signaling connection.
///
/// Concurrent writers (the signaling loop, RTP relay callbacks, the keyframe
/// dispatcher) all go through this handle; frames are serialized and pushed
/// onto a single ordered channel drained by the connection's socket pump.
/// `close` empties the slot, which ends the pump and closes the socket.
#[derive(Clone)]
pub struct ClientWriter {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

impl ClientWriter {
    /// Create a writer and the receiving end for the socket pump.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Serialize and enqueue one frame. Frames sent through the same writer
    /// arrive in order.
    pub fn send(&self, msg: &SignalMessage) -> Result<()> {
        let text = serde_json::to_string(msg)?;
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(text).map_err(|_| Error::WriterClosed),
            None => Err(Error::WriterClosed),
        }
    }

    /// Drop the outbound channel; the socket pump sees end-of-stream and
    /// closes the connection.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_rejects_missing_event() {
        assert!(SignalMessage::parse(r#"{"data":{}}"#).is_err());
        assert!(SignalMessage::parse("not json").is_err());
        assert!(SignalMessage::parse(r#"{"event":"join"}"#).is_ok());
    }

    #[test]
    fn test_forwarding_rewrite() {
        let msg = SignalMessage::new(
            "offer",
            json!({"targetPeerId": "B", "sdp": "v=0..."}),
        );
        assert_eq!(msg.target_peer_id().as_deref(), Some("B"));

        let forwarded = msg.into_forwarded("A");
        assert_eq!(forwarded.event, "offer");
        assert_eq!(forwarded.data_str(PEER_ID), Some("A"));
        assert_eq!(forwarded.data_str(TARGET_PEER_ID), None);
        assert_eq!(forwarded.data_str("sdp"), Some("v=0..."));
    }

    #[tokio::test]
    async fn test_writer_preserves_order() {
        let (writer, mut rx) = ClientWriter::channel();
        for i in 0..10 {
            writer
                .send(&SignalMessage::new("tick", json!({ "n": i })))
                .unwrap();
        }
        for i in 0..10 {
            let text = rx.recv().await.unwrap();
            let msg = SignalMessage::parse(&text).unwrap();
            assert_eq!(msg.data["n"], json!(i));
        }
    }

    #[tokio::test]
    async fn test_writer_close_ends_pump() {
        let (writer, mut rx) = ClientWriter::channel();
        writer.send(&SignalMessage::new("a", json!({}))).unwrap();
        writer.close();
        assert!(writer.send(&SignalMessage::new("b", json!({}))).is_err());
        assert!(writer.is_closed());

        assert!(rx.recv().await.is_some()); // the frame sent before close
        assert!(rx.recv().await.is_none()); // then end-of-stream
    }
}
