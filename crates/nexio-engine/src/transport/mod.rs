//! Transport variants
//!
//! Each variant turns one HTTP exchange, socket, or session into a stream of
//! decoded packets plus a way to send packets back. Dispatch is by variant
//! tag; the connection never sees the wire mechanics.

pub mod polling;
pub mod websocket;
pub mod webtransport;

pub use polling::{negotiate_encoding, ContentEncoding, PollingTransport};
pub use websocket::WebSocketTransport;
pub use webtransport::WebTransportSession;

use crate::error::EngineError;
use crate::packet::{EncodedFrame, Packet};
use std::fmt;

/// Transport names on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Polling,
    WebSocket,
    WebTransport,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Polling => "polling",
            TransportKind::WebSocket => "websocket",
            TransportKind::WebTransport => "webtransport",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "polling" => Some(TransportKind::Polling),
            "websocket" => Some(TransportKind::WebSocket),
            "webtransport" => Some(TransportKind::WebTransport),
            _ => None,
        }
    }

    /// Whether a connection on this transport needs no further upgrade
    pub fn handles_upgrades(self) -> bool {
        !matches!(self, TransportKind::Polling)
    }

    /// Whether the transport can carry raw binary frames
    pub fn supports_binary(self) -> bool {
        !matches!(self, TransportKind::Polling)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag distinguishing which transport instance emitted an event. A
/// connection ignores events from transports it has already discarded.
pub type TransportId = u64;

/// Events a transport pushes into its connection's event loop
#[derive(Debug)]
pub enum TransportEvent {
    Packet(Packet),
    /// The transport became writable (a poll cycle parked)
    Drain,
    Error(String),
    Close,
}

/// A concrete duplex channel carrying engine packets
#[derive(Debug)]
pub enum Transport {
    Polling(PollingTransport),
    WebSocket(WebSocketTransport),
    WebTransport(WebTransportSession),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Polling(_) => TransportKind::Polling,
            Transport::WebSocket(_) => TransportKind::WebSocket,
            Transport::WebTransport(_) => TransportKind::WebTransport,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    pub fn handles_upgrades(&self) -> bool {
        self.kind().handles_upgrades()
    }

    /// Whether a send right now would reach the wire
    pub fn writable(&self) -> bool {
        match self {
            Transport::Polling(t) => t.writable(),
            Transport::WebSocket(t) => t.writable(),
            Transport::WebTransport(t) => t.writable(),
        }
    }

    /// Queue packets onto the wire. Fails with `TransportNotWritable` when
    /// no poll cycle is parked, and `Closed` after shutdown.
    pub fn send(&self, packets: Vec<Packet>) -> Result<(), EngineError> {
        match self {
            Transport::Polling(t) => t.send(packets),
            Transport::WebSocket(t) => t.send(packets),
            Transport::WebTransport(t) => t.send(packets),
        }
    }

    /// Send pre-encoded frames, skipping packet encoding on fan-out.
    /// Only binary-capable transports accept raw frames.
    pub fn send_raw(&self, frames: Vec<EncodedFrame>) -> Result<(), EngineError> {
        match self {
            Transport::Polling(_) => Err(EngineError::TransportNotWritable),
            Transport::WebSocket(t) => t.send_raw(frames),
            Transport::WebTransport(t) => t.send_raw(frames),
        }
    }

    /// Close the wire side
    pub fn shutdown(&self) {
        match self {
            Transport::Polling(t) => t.shutdown(),
            Transport::WebSocket(t) => t.shutdown(),
            Transport::WebTransport(t) => t.shutdown(),
        }
    }

    /// Detach from the connection: no further events are delivered
    pub fn discard(&self) {
        match self {
            Transport::Polling(t) => t.discard(),
            Transport::WebSocket(t) => t.discard(),
            Transport::WebTransport(t) => t.discard(),
        }
    }

    pub fn as_polling(&self) -> Option<&PollingTransport> {
        match self {
            Transport::Polling(t) => Some(t),
            _ => None,
        }
    }
}
