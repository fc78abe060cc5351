//! Transport-level packets
//!
//! Text wire form is `<type digit><data>`. Binary data passes through
//! untouched on binary-capable transports and is framed as `b<base64>` on
//! text transports.

use crate::error::EngineError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Transport packet types, `0..=6` on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Open = 0,
    Close = 1,
    Ping = 2,
    Pong = 3,
    Message = 4,
    Upgrade = 5,
    Noop = 6,
}

impl PacketType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = EngineError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Open),
            1 => Ok(PacketType::Close),
            2 => Ok(PacketType::Ping),
            3 => Ok(PacketType::Pong),
            4 => Ok(PacketType::Message),
            5 => Ok(PacketType::Upgrade),
            6 => Ok(PacketType::Noop),
            _ => Err(EngineError::InvalidPacket("unknown packet type")),
        }
    }
}

/// Payload of a transport packet
#[derive(Debug, Clone, PartialEq)]
pub enum PacketData {
    None,
    Text(String),
    Binary(Bytes),
}

/// A transport-level packet
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub data: PacketData,
}

/// A packet encoded for one wire frame
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedFrame {
    Text(String),
    Binary(Bytes),
}

/// JSON payload of the `open` packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPacket {
    pub sid: String,
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    pub max_payload: u64,
}

impl Packet {
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            data: PacketData::None,
        }
    }

    pub fn open(payload: &OpenPacket) -> Result<Self, EngineError> {
        Ok(Self {
            packet_type: PacketType::Open,
            data: PacketData::Text(serde_json::to_string(payload)?),
        })
    }

    pub fn close() -> Self {
        Self::new(PacketType::Close)
    }

    pub fn ping() -> Self {
        Self::new(PacketType::Ping)
    }

    pub fn ping_probe() -> Self {
        Self {
            packet_type: PacketType::Ping,
            data: PacketData::Text("probe".into()),
        }
    }

    pub fn pong() -> Self {
        Self::new(PacketType::Pong)
    }

    pub fn pong_probe() -> Self {
        Self {
            packet_type: PacketType::Pong,
            data: PacketData::Text("probe".into()),
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self {
            packet_type: PacketType::Message,
            data: PacketData::Text(text.into()),
        }
    }

    pub fn binary(data: Bytes) -> Self {
        Self {
            packet_type: PacketType::Message,
            data: PacketData::Binary(data),
        }
    }

    pub fn upgrade() -> Self {
        Self::new(PacketType::Upgrade)
    }

    pub fn noop() -> Self {
        Self::new(PacketType::Noop)
    }

    /// Whether this is the `ping "probe"` opening an upgrade handshake
    pub fn is_probe_ping(&self) -> bool {
        self.packet_type == PacketType::Ping
            && matches!(&self.data, PacketData::Text(t) if t == "probe")
    }

    /// Encode as text. Binary payloads are base64-framed with a `b` prefix.
    pub fn encode_text(&self) -> String {
        match &self.data {
            PacketData::None => ((b'0' + self.packet_type.as_u8()) as char).to_string(),
            PacketData::Text(text) => {
                let mut out = String::with_capacity(1 + text.len());
                out.push((b'0' + self.packet_type.as_u8()) as char);
                out.push_str(text);
                out
            }
            PacketData::Binary(data) => {
                let mut out = String::from("b");
                out.push_str(&BASE64.encode(data));
                out
            }
        }
    }

    /// Encode for a wire frame. Raw binary only when the transport
    /// supports binary frames.
    pub fn encode(&self, supports_binary: bool) -> EncodedFrame {
        match &self.data {
            PacketData::Binary(data) if supports_binary => EncodedFrame::Binary(data.clone()),
            _ => EncodedFrame::Text(self.encode_text()),
        }
    }

    /// Decode a text frame
    pub fn decode_text(raw: &str) -> Result<Packet, EngineError> {
        let mut chars = raw.chars();
        let first = chars
            .next()
            .ok_or(EngineError::InvalidPacket("empty packet"))?;

        if first == 'b' {
            let data = BASE64.decode(chars.as_str())?;
            return Ok(Packet::binary(Bytes::from(data)));
        }

        let digit = (first as u32)
            .checked_sub('0' as u32)
            .ok_or(EngineError::InvalidPacket("unknown packet type"))?;
        let packet_type =
            PacketType::try_from(u8::try_from(digit).map_err(|_| {
                EngineError::InvalidPacket("unknown packet type")
            })?)?;

        let rest = chars.as_str();
        let data = if rest.is_empty() {
            PacketData::None
        } else {
            PacketData::Text(rest.to_string())
        };
        Ok(Packet { packet_type, data })
    }

    /// Decode a raw binary frame, which is always a message
    pub fn decode_binary(data: Bytes) -> Packet {
        Packet::binary(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_roundtrip() {
        let packet = Packet::message("hello");
        let encoded = packet.encode_text();
        assert_eq!(encoded, "4hello");
        assert_eq!(Packet::decode_text(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_bare_packet_roundtrip() {
        for packet in [Packet::ping(), Packet::pong(), Packet::noop(), Packet::upgrade()] {
            let encoded = packet.encode_text();
            assert_eq!(encoded.len(), 1);
            assert_eq!(Packet::decode_text(&encoded).unwrap(), packet);
        }
    }

    #[test]
    fn test_probe_roundtrip() {
        let packet = Packet::ping_probe();
        assert_eq!(packet.encode_text(), "2probe");
        let decoded = Packet::decode_text("2probe").unwrap();
        assert!(decoded.is_probe_ping());
    }

    #[test]
    fn test_binary_base64_roundtrip() {
        let packet = Packet::binary(Bytes::from_static(b"\x01\x02\x03\x04"));
        let encoded = packet.encode_text();
        assert_eq!(encoded, "bAQIDBA==");
        assert_eq!(Packet::decode_text(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_binary_passthrough_when_supported() {
        let packet = Packet::binary(Bytes::from_static(b"\xff\x00"));
        match packet.encode(true) {
            EncodedFrame::Binary(b) => assert_eq!(b, Bytes::from_static(b"\xff\x00")),
            other => panic!("expected binary frame, got {other:?}"),
        }
        match packet.encode(false) {
            EncodedFrame::Text(t) => assert!(t.starts_with('b')),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn test_open_packet_json() {
        let open = OpenPacket {
            sid: "abc".into(),
            upgrades: vec!["websocket".into()],
            ping_interval: 25_000,
            ping_timeout: 20_000,
            max_payload: 1_000_000,
        };
        let packet = Packet::open(&open).unwrap();
        let encoded = packet.encode_text();
        assert!(encoded.starts_with("0{"));
        assert!(encoded.contains("\"pingInterval\":25000"));
        assert!(encoded.contains("\"maxPayload\":1000000"));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert!(Packet::decode_text("9").is_err());
        assert!(Packet::decode_text("").is_err());
        assert!(Packet::decode_text("x").is_err());
    }
}
