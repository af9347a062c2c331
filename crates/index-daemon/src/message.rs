//! Handshake protocol messages.
//!
//! The handshake is JSON sent as a binary WebSocket frame (UTF-8 bytes),
//! the same framing as the index messages that follow it.

use index_core::DeviceId;
use serde::{Deserialize, Serialize};

/// Maximum message size (50MB) to prevent memory exhaustion from malicious peers.
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

/// Hello message exchanged when a peer connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Always "hello"
    #[serde(rename = "type")]
    pub msg_type: String,

    #[serde(rename = "deviceId")]
    pub device_id: DeviceId,

    pub role: Role,
}

impl HelloMessage {
    pub fn new(device_id: DeviceId, role: Role) -> Self {
        Self {
            msg_type: "hello".to_string(),
            device_id,
            role,
        }
    }

    /// Serialize to UTF-8 JSON bytes for sending as binary WebSocket frame.
    pub fn to_binary(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("HelloMessage serialization should not fail")
    }

    /// Try to parse a hello from binary data.
    ///
    /// Returns None if the data is not valid JSON or not a hello message.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        let msg: Self = serde_json::from_slice(data).ok()?;
        if msg.msg_type == "hello" {
            Some(msg)
        } else {
            None
        }
    }
}
