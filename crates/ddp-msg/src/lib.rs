//! ---
//! ddp_section: "02-wire-protocol"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Message model, fixed-width codec, and framed transports."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod codec;
pub mod logging;
pub mod transport;
pub mod types;

/// Shared result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors raised while encoding or decoding a single wire message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The byte count does not match the fixed size of the identified type.
    /// `kind` is `None` when the input was too short to carry a selector.
    #[error("malformed message (kind {kind:?}): expected {expected} bytes, got {actual}")]
    MalformedMessage {
        /// Message type identified by the selector byte, if any.
        kind: Option<MessageKind>,
        /// Fixed frame length for that type.
        expected: usize,
        /// Number of bytes actually supplied.
        actual: usize,
    },
    /// The selector byte is outside `1..=5`.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    /// A field value does not fit the configured width.
    #[error("{field} value {value} does not fit in {bits} bits")]
    FieldOverflow {
        /// Name of the offending field.
        field: &'static str,
        /// Value that was rejected.
        value: u64,
        /// Configured width of the field.
        bits: u8,
    },
    /// A configured width is not a multiple of 8 in `8..=64`.
    #[error("unsupported width for {field}: {bits} bits")]
    UnsupportedWidth {
        /// Name of the offending field.
        field: &'static str,
        /// Rejected width.
        bits: u8,
    },
}

pub use codec::WireFormat;
pub use logging::{log_message, MessageDirection};
pub use transport::{
    Connection, FramedConnection, InMemoryConnection, PeerEndpoint, TransportError,
};
pub use types::{DeviceId, Message, MessageKind};
