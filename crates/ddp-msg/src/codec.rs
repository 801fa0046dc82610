//! ---
//! ddp_section: "02-wire-protocol"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Message model, fixed-width codec, and framed transports."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
//! Fixed-width codec. Every message is `selector (1 byte) ++ fields`, all
//! fields big-endian unsigned, widths taken from [`WireFormat`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ddp_common::ProtocolConfig;

use crate::types::{DeviceId, Message, MessageKind};
use crate::{CodecError, Result};

const SELECTOR_LEN: usize = 1;
const DEVICE_ID_LEN: usize = 1;

/// Negotiated-by-convention field widths shared by both ends of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFormat {
    timestamp_bits: u8,
    value_bits: u8,
    remaining_count_bits: u8,
}

impl WireFormat {
    /// Build a format, rejecting widths that are not whole bytes in `8..=64`.
    pub fn new(timestamp_bits: u8, value_bits: u8, remaining_count_bits: u8) -> Result<Self> {
        check_width("timestamp", timestamp_bits)?;
        check_width("raw_value", value_bits)?;
        check_width("remaining_count", remaining_count_bits)?;
        Ok(Self {
            timestamp_bits,
            value_bits,
            remaining_count_bits,
        })
    }

    /// Build a format from the protocol section of the configuration.
    pub fn from_config(config: &ProtocolConfig) -> Result<Self> {
        Self::new(
            config.timestamp_bits,
            config.value_bits,
            config.remaining_count_bits,
        )
    }

    /// Width of the timestamp field in bits.
    pub fn timestamp_bits(&self) -> u8 {
        self.timestamp_bits
    }

    /// Width of the raw value field in bits.
    pub fn value_bits(&self) -> u8 {
        self.value_bits
    }

    /// Width of the sample/remaining count fields in bits.
    pub fn remaining_count_bits(&self) -> u8 {
        self.remaining_count_bits
    }

    /// Largest raw ADC value representable on the wire.
    pub fn max_raw_value(&self) -> u64 {
        max_for(self.value_bits)
    }

    /// Largest sample count representable on the wire.
    pub fn max_sample_count(&self) -> u64 {
        max_for(self.remaining_count_bits)
    }

    /// Largest timestamp representable on the wire.
    pub fn max_timestamp(&self) -> u64 {
        max_for(self.timestamp_bits)
    }

    /// Total frame length (selector included) of a message type.
    pub fn frame_len(&self, kind: MessageKind) -> usize {
        SELECTOR_LEN
            + match kind {
                MessageKind::Announce => DEVICE_ID_LEN + bytes_for(self.remaining_count_bits),
                MessageKind::AnnounceAck | MessageKind::Terminate => 0,
                MessageKind::Data => bytes_for(self.timestamp_bits) + bytes_for(self.value_bits),
                MessageKind::DataAck => bytes_for(self.remaining_count_bits),
            }
    }

    /// Encode one message into exactly one frame.
    pub fn encode(&self, message: &Message) -> Result<Bytes> {
        let kind = message.kind();
        let mut buf = BytesMut::with_capacity(self.frame_len(kind));
        buf.put_u8(kind.as_u8());
        match *message {
            Message::Announce {
                device_id,
                sample_count,
            } => {
                buf.put_u8(device_id.get());
                put_field(
                    &mut buf,
                    "sample_count",
                    sample_count,
                    self.remaining_count_bits,
                )?;
            }
            Message::AnnounceAck | Message::Terminate => {}
            Message::Data {
                timestamp,
                raw_value,
            } => {
                put_field(&mut buf, "timestamp", timestamp, self.timestamp_bits)?;
                put_field(&mut buf, "raw_value", raw_value, self.value_bits)?;
            }
            Message::DataAck { remaining_count } => {
                put_field(
                    &mut buf,
                    "remaining_count",
                    remaining_count,
                    self.remaining_count_bits,
                )?;
            }
        }
        Ok(buf.freeze())
    }

    /// Decode exactly one frame. The slice must hold one complete message and
    /// nothing else.
    pub fn decode(&self, frame: &[u8]) -> Result<Message> {
        let Some(&selector) = frame.first() else {
            return Err(CodecError::MalformedMessage {
                kind: None,
                expected: SELECTOR_LEN,
                actual: 0,
            });
        };
        let kind = MessageKind::from_u8(selector).ok_or(CodecError::UnknownMessageType(selector))?;
        let expected = self.frame_len(kind);
        if frame.len() != expected {
            return Err(CodecError::MalformedMessage {
                kind: Some(kind),
                expected,
                actual: frame.len(),
            });
        }

        let mut body = &frame[SELECTOR_LEN..];
        let message = match kind {
            MessageKind::Announce => {
                let device_id = DeviceId(body.get_u8());
                let sample_count = body.get_uint(bytes_for(self.remaining_count_bits));
                Message::Announce {
                    device_id,
                    sample_count,
                }
            }
            MessageKind::AnnounceAck => Message::AnnounceAck,
            MessageKind::Data => {
                let timestamp = body.get_uint(bytes_for(self.timestamp_bits));
                let raw_value = body.get_uint(bytes_for(self.value_bits));
                Message::Data {
                    timestamp,
                    raw_value,
                }
            }
            MessageKind::DataAck => Message::DataAck {
                remaining_count: body.get_uint(bytes_for(self.remaining_count_bits)),
            },
            MessageKind::Terminate => Message::Terminate,
        };
        Ok(message)
    }
}

impl Default for WireFormat {
    fn default() -> Self {
        Self {
            timestamp_bits: 32,
            value_bits: 16,
            remaining_count_bits: 16,
        }
    }
}

fn check_width(field: &'static str, bits: u8) -> Result<()> {
    if bits == 0 || bits > 64 || bits % 8 != 0 {
        return Err(CodecError::UnsupportedWidth { field, bits });
    }
    Ok(())
}

fn bytes_for(bits: u8) -> usize {
    usize::from(bits / 8)
}

fn max_for(bits: u8) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn put_field(buf: &mut BytesMut, field: &'static str, value: u64, bits: u8) -> Result<()> {
    if value > max_for(bits) {
        return Err(CodecError::FieldOverflow { field, value, bits });
    }
    buf.put_uint(value, bytes_for(bits));
    Ok(())
}
