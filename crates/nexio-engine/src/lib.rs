//! Transport Engine
//!
//! This crate implements the connection engine underneath the multiplexing
//! layer: the transport-level packet vocabulary and payload framing, the
//! three transport variants (HTTP long-polling, WebSocket, WebTransport
//! style sessions), the connection object with its heartbeat and upgrade
//! state machines, and the server that validates handshakes and routes
//! follow-up requests to live connections by session id.

pub mod config;
pub mod error;
pub mod packet;
pub mod payload;
pub mod server;
pub mod sid;
pub mod socket;
pub mod transport;

pub use config::EngineConfig;
pub use error::{EngineError, HandshakeError};
pub use packet::{EncodedFrame, OpenPacket, Packet, PacketType};
pub use server::{EngineServer, RequestContext};
pub use socket::{CloseReason, Handler, Message, ReadyState, Socket};
pub use transport::{Transport, TransportKind};

/// Engine wire protocol revisions understood by the server.
///
/// v4 is the target; v3 is accepted for its inverted heartbeat and
/// length-prefixed payload framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V3,
    V4,
}

impl ProtocolVersion {
    pub fn as_u8(self) -> u8 {
        match self {
            ProtocolVersion::V3 => 3,
            ProtocolVersion::V4 => 4,
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = error::HandshakeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(ProtocolVersion::V3),
            4 => Ok(ProtocolVersion::V4),
            _ => Err(error::HandshakeError::UnsupportedProtocolVersion),
        }
    }
}
