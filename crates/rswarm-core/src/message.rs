//! Wire message record and MessagePack codec.
//!
//! The master and every worker exchange [`Message`] records over the
//! [`RpcTransport`](crate::transport::RpcTransport). The payload (`data`) is
//! a JSON-like tree of primitives/lists/maps — `serde_json::Value` already
//! models exactly that, so it is reused here rather than inventing a parallel
//! type; `rmp-serde` serializes it to MessagePack for the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RswarmError;

/// Current wire protocol version. Bump when making a breaking change to the
/// message schema; master and worker must agree.
pub const PROTOCOL_VERSION: i32 = 1;

/// The payload carried in `Message::data`: string keys to JSON-like values.
pub type MessageData = BTreeMap<String, serde_json::Value>;

/// Well-known message type strings exchanged with the master.
///
/// `Message::message_type` is kept as a plain `String` on the wire (forward
/// compatibility with message types this worker doesn't know about — see
/// [`MessageKind::parse`]), but this enum gives dispatch code exhaustive
/// matching over the types this runtime understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    ClientReady,
    ClientStopped,
    Heartbeat,
    Stats,
    Spawn,
    SpawningComplete,
    Stop,
    Quit,
    Reconnect,
    Ack,
    Exception,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::ClientReady => "client_ready",
            MessageKind::ClientStopped => "client_stopped",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Stats => "stats",
            MessageKind::Spawn => "spawn",
            MessageKind::SpawningComplete => "spawning_complete",
            MessageKind::Stop => "stop",
            MessageKind::Quit => "quit",
            MessageKind::Reconnect => "reconnect",
            MessageKind::Ack => "ack",
            MessageKind::Exception => "exception",
        }
    }

    /// Parse a wire `type` string into a known kind, or `None` for a type
    /// this runtime doesn't recognize (forward compatibility — the caller
    /// logs and ignores rather than treating this as an error).
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "client_ready" => MessageKind::ClientReady,
            "client_stopped" => MessageKind::ClientStopped,
            "heartbeat" => MessageKind::Heartbeat,
            "stats" => MessageKind::Stats,
            "spawn" => MessageKind::Spawn,
            "spawning_complete" => MessageKind::SpawningComplete,
            "stop" => MessageKind::Stop,
            "quit" => MessageKind::Quit,
            "reconnect" => MessageKind::Reconnect,
            "ack" => MessageKind::Ack,
            "exception" => MessageKind::Exception,
            _ => return None,
        })
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single control-protocol message record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: MessageData,
    #[serde(rename = "nodeId")]
    pub node_id: String,
    pub version: i32,
}

impl Message {
    pub fn new(message_type: impl Into<String>, data: MessageData, node_id: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            data,
            node_id: node_id.into(),
            version: PROTOCOL_VERSION,
        }
    }

    /// The parsed [`MessageKind`], or `None` if this message's type isn't
    /// one this runtime recognizes.
    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::parse(&self.message_type)
    }

    pub fn client_ready(node_id: impl Into<String>) -> Self {
        let mut data = MessageData::new();
        data.insert("version".to_string(), serde_json::json!(PROTOCOL_VERSION));
        Self::new(MessageKind::ClientReady.as_str(), data, node_id)
    }

    pub fn client_stopped(node_id: impl Into<String>) -> Self {
        Self::new(MessageKind::ClientStopped.as_str(), MessageData::new(), node_id)
    }

    pub fn spawning_complete(node_id: impl Into<String>, user_count: u32) -> Self {
        let mut data = MessageData::new();
        data.insert("user_count".to_string(), serde_json::json!(user_count));
        Self::new(MessageKind::SpawningComplete.as_str(), data, node_id)
    }

    pub fn heartbeat(
        node_id: impl Into<String>,
        state: &str,
        current_cpu_usage: f64,
        count: u32,
    ) -> Self {
        let mut data = MessageData::new();
        data.insert("state".to_string(), serde_json::json!(state));
        data.insert(
            "current_cpu_usage".to_string(),
            serde_json::json!(current_cpu_usage),
        );
        data.insert("count".to_string(), serde_json::json!(count));
        Self::new(MessageKind::Heartbeat.as_str(), data, node_id)
    }

    pub fn exception(node_id: impl Into<String>, msg: &str, traceback: &str) -> Self {
        let mut data = MessageData::new();
        data.insert("msg".to_string(), serde_json::json!(msg));
        data.insert("traceback".to_string(), serde_json::json!(traceback));
        Self::new(MessageKind::Exception.as_str(), data, node_id)
    }
}

/// Encode/decode [`Message`] records to/from the MessagePack wire format.
///
/// Kept as a unit struct (rather than free functions) so the transport layer
/// can hold a codec handle and swap implementations in tests without
/// touching call sites.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, RswarmError> {
        rmp_serde::to_vec_named(message)
            .map_err(|e| RswarmError::Protocol(format!("failed to encode message: {e}")))
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Message, RswarmError> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| RswarmError::Protocol(format!("failed to decode message: {e}")))
    }
}

/// Build a worker node identity: `<hostname>_<32-hex>`.
pub fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let token = Uuid::new_v4().simple().to_string();
    format!("{hostname}_{token}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> MessageData {
        let mut data = MessageData::new();
        data.insert("user_count".to_string(), serde_json::json!(5));
        data.insert("spawn_rate".to_string(), serde_json::json!(2.5));
        data
    }

    #[test]
    fn round_trip_all_known_kinds() {
        let codec = MessageCodec;
        for kind in [
            MessageKind::ClientReady,
            MessageKind::ClientStopped,
            MessageKind::Heartbeat,
            MessageKind::Stats,
            MessageKind::Spawn,
            MessageKind::SpawningComplete,
            MessageKind::Stop,
            MessageKind::Quit,
            MessageKind::Reconnect,
            MessageKind::Ack,
            MessageKind::Exception,
        ] {
            let msg = Message::new(kind.as_str(), sample_data(), "host_abc123");
            let bytes = codec.encode(&msg).expect("encode should succeed");
            let decoded = codec.decode(&bytes).expect("decode should succeed");
            assert_eq!(msg, decoded);
        }
    }

    #[test]
    fn kind_parses_known_type() {
        let msg = Message::new("spawn", MessageData::new(), "n1");
        assert_eq!(msg.kind(), Some(MessageKind::Spawn));
    }

    #[test]
    fn kind_is_none_for_unknown_type() {
        let msg = Message::new("totally_unknown_future_type", MessageData::new(), "n1");
        assert_eq!(msg.kind(), None);
    }

    #[test]
    fn client_ready_carries_protocol_version() {
        let msg = Message::client_ready("node1");
        assert_eq!(msg.message_type, "client_ready");
        assert_eq!(
            msg.data.get("version").and_then(|v| v.as_i64()),
            Some(PROTOCOL_VERSION as i64)
        );
    }

    #[test]
    fn spawning_complete_carries_user_count() {
        let msg = Message::spawning_complete("node1", 42);
        assert_eq!(
            msg.data.get("user_count").and_then(|v| v.as_u64()),
            Some(42)
        );
    }

    #[test]
    fn heartbeat_carries_expected_fields() {
        let msg = Message::heartbeat("node1", "running", 12.5, 3);
        assert_eq!(msg.data.get("state").and_then(|v| v.as_str()), Some("running"));
        assert_eq!(
            msg.data.get("current_cpu_usage").and_then(|v| v.as_f64()),
            Some(12.5)
        );
        assert_eq!(msg.data.get("count").and_then(|v| v.as_u64()), Some(3));
    }

    #[test]
    fn decode_garbage_is_protocol_error() {
        let codec = MessageCodec;
        let err = codec.decode(&[0xff, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, RswarmError::Protocol(_)));
    }

    #[test]
    fn generate_node_id_has_underscore_separated_hex_suffix() {
        let id = generate_node_id();
        let (_, suffix) = id.rsplit_once('_').expect("node id must contain an underscore");
        assert_eq!(suffix.len(), 32);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generate_node_id_is_unique_per_call() {
        let a = generate_node_id();
        let b = generate_node_id();
        assert_ne!(a, b);
    }
}
