//! ---
//! ddp_section: "02-wire-protocol"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Message model, fixed-width codec, and framed transports."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use tracing::trace;

use crate::types::Message;

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Frame read from the physical device.
    Inbound,
    /// Frame written to the physical device.
    Outbound,
}

/// Emit a structured trace entry for one frame crossing a connection.
pub fn log_message(direction: MessageDirection, peer: &str, message: &Message) {
    trace!(
        peer,
        kind = message.kind().as_str(),
        direction = ?direction,
        message = ?message,
        "wire activity"
    );
}
