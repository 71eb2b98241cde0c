//! Wire protocol: typed envelopes and events for the duplex connection.
//!
//! Every message on the socket is a JSON object discriminated by a `type`
//! field. [`OutboundEnvelope`] covers the four message kinds this engine
//! sends; [`InboundEvent`] covers the event kinds it consumes. Anything the
//! remote sends outside that union is a non-fatal protocol error — logged and
//! dropped, never a session fault.

pub mod inbound;
pub mod outbound;

pub use inbound::{parse_inbound, InboundEvent, RemoteErrorBody};
pub use outbound::{
    ConversationItem, OutboundEnvelope, SessionSettings, ToolSpec, TurnDetection,
};
