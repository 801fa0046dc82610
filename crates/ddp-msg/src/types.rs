//! ---
//! ddp_section: "02-wire-protocol"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Message model, fixed-width codec, and framed transports."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier shared by a physical device and its digital counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u8);

impl DeviceId {
    /// Raw identifier as carried on the wire.
    pub fn get(self) -> u8 {
        self.0
    }
}

impl From<u8> for DeviceId {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Selector byte values of the five message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MessageKind {
    /// Physical device opens a session.
    Announce = 1,
    /// Platform accepts the session.
    AnnounceAck = 2,
    /// One raw sample.
    Data = 3,
    /// Platform accepts one sample.
    DataAck = 4,
    /// Physical device ends the session.
    Terminate = 5,
}

impl MessageKind {
    /// Map a selector byte to its kind.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Announce),
            2 => Some(Self::AnnounceAck),
            3 => Some(Self::Data),
            4 => Some(Self::DataAck),
            5 => Some(Self::Terminate),
            _ => None,
        }
    }

    /// Selector byte written on the wire.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Stable lowercase name for logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Announce => "announce",
            Self::AnnounceAck => "announce_ack",
            Self::Data => "data",
            Self::DataAck => "data_ack",
            Self::Terminate => "terminate",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol message. Field values are bounded by the active
/// [`WireFormat`](crate::WireFormat).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Session opener carrying the number of samples that will follow.
    Announce {
        /// Announcing device.
        device_id: DeviceId,
        /// Number of `Data` messages the device intends to send.
        sample_count: u64,
    },
    /// Reply to `Announce`.
    AnnounceAck,
    /// Raw ADC sample.
    Data {
        /// Device-side timestamp.
        timestamp: u64,
        /// Raw ADC counts.
        raw_value: u64,
    },
    /// Reply to `Data` carrying the number of samples still expected.
    DataAck {
        /// Samples still expected after this one.
        remaining_count: u64,
    },
    /// Session closer.
    Terminate,
}

impl Message {
    /// Kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Announce { .. } => MessageKind::Announce,
            Message::AnnounceAck => MessageKind::AnnounceAck,
            Message::Data { .. } => MessageKind::Data,
            Message::DataAck { .. } => MessageKind::DataAck,
            Message::Terminate => MessageKind::Terminate,
        }
    }
}
