//! Wire protocol definitions.
//!
//! This module provides the binary protocol layer shared by the client and
//! the broker:
//! - Control codes, QoS levels and session protocol variants
//! - Frame encoding/decoding with variable-length framing
//! - Per-command packet encode and parse

pub mod codec;
pub mod packets;

pub use codec::{encode_frame, read_frame, CodecError, RawFrame, MAX_REMAINING_LENGTH};

use thiserror::Error;

/// First frame byte reserved for the key exchange. Deliberately outside the
/// nibble-packed command space so future commands can never collide with it;
/// progress frames (code 15) never set all four flag bits.
pub const KEY_EXCHANGE_BYTE: u8 = 0xFF;

/// Protocol level carried in the connect variable header.
pub const PROTOCOL_LEVEL: u8 = 4;

/// Frame control codes (high nibble of the first frame byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCode {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    Ping = 12,
    Pong = 13,
    Disconnect = 14,
    Progress = 15,
}

impl ControlCode {
    /// Decode a control nibble. Returns `None` for 0 and out-of-range values.
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        Some(match nibble {
            1 => Self::Connect,
            2 => Self::ConnAck,
            3 => Self::Publish,
            4 => Self::PubAck,
            5 => Self::PubRec,
            6 => Self::PubRel,
            7 => Self::PubComp,
            8 => Self::Subscribe,
            9 => Self::SubAck,
            10 => Self::Unsubscribe,
            11 => Self::UnsubAck,
            12 => Self::Ping,
            13 => Self::Pong,
            14 => Self::Disconnect,
            15 => Self::Progress,
            _ => return None,
        })
    }

    pub fn nibble(self) -> u8 {
        self as u8
    }
}

/// Delivery guarantee requested for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Qos {
    /// Fire and forget.
    AtMostOnce,
    /// Single acknowledgment.
    AtLeastOnce,
    /// Three-step acknowledgment handshake.
    ExactlyOnce,
    /// Broker-only: deliver to the owning collaborator, never re-publish.
    TransferOnly,
}

impl Qos {
    pub fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => Self::AtMostOnce,
            1 => Self::AtLeastOnce,
            2 => Self::ExactlyOnce,
            3 => Self::TransferOnly,
            _ => return None,
        })
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
            Self::TransferOnly => 3,
        }
    }

    /// Whether publishes at this level carry a message id.
    pub fn needs_message_id(self) -> bool {
        !matches!(self, Self::AtMostOnce)
    }
}

/// Session protocol variant, selected by the connect protocol-name token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    /// Publish/subscribe fan-out sessions.
    PubSub,
    /// Synchronous request/response sessions.
    SyncRpc,
    /// Chunked file transfer sessions.
    FileTransfer,
}

impl ProtocolKind {
    pub fn token(self) -> &'static str {
        match self {
            Self::PubSub => "PSUB",
            Self::SyncRpc => "SRPC",
            Self::FileTransfer => "FXFR",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "PSUB" => Some(Self::PubSub),
            "SRPC" => Some(Self::SyncRpc),
            "FXFR" => Some(Self::FileTransfer),
            _ => None,
        }
    }
}

/// A decoded application-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
    /// Present iff qos > 0; id 0 is reserved for "no id".
    pub message_id: u16,
}

impl ApplicationMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: Qos::AtMostOnce,
            retain: false,
            message_id: 0,
        }
    }

    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}

/// Connect refusal codes and their fixed error-text table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u8)]
pub enum ConnectRefusal {
    #[error("unacceptable protocol name or level")]
    UnacceptableProtocol = 1,
    #[error("client identifier rejected")]
    IdentifierRejected = 2,
    #[error("server unavailable")]
    ServerUnavailable = 3,
    #[error("bad user name or password")]
    BadCredentials = 4,
    #[error("not authorized")]
    NotAuthorized = 5,
}

impl ConnectRefusal {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::UnacceptableProtocol,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadCredentials,
            5 => Self::NotAuthorized,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_code_round_trips() {
        for nibble in 1..=15u8 {
            let code = ControlCode::from_nibble(nibble).unwrap();
            assert_eq!(code.nibble(), nibble);
        }
        assert!(ControlCode::from_nibble(0).is_none());
    }

    #[test]
    fn protocol_tokens_round_trip() {
        for kind in [
            ProtocolKind::PubSub,
            ProtocolKind::SyncRpc,
            ProtocolKind::FileTransfer,
        ] {
            assert_eq!(ProtocolKind::from_token(kind.token()), Some(kind));
        }
        assert!(ProtocolKind::from_token("MQTT").is_none());
    }

    #[test]
    fn refusal_codes_have_text() {
        let refusal = ConnectRefusal::from_code(4).unwrap();
        assert_eq!(refusal.code(), 4);
        assert_eq!(refusal.to_string(), "bad user name or password");
        assert!(ConnectRefusal::from_code(0).is_none());
        assert!(ConnectRefusal::from_code(6).is_none());
    }
}
