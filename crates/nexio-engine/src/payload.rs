//! Payload framing for polling transports
//!
//! Protocol v4 joins packets with the `0x1e` record separator. Protocol v3
//! prefixes each packet with its byte length and a colon.

use crate::error::EngineError;
use crate::packet::Packet;
use crate::ProtocolVersion;

/// Record separator between v4 packets
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Frame a batch of packets into one poll response body
pub fn encode_payload(packets: &[Packet], protocol: ProtocolVersion) -> String {
    match protocol {
        ProtocolVersion::V4 => {
            let mut out = String::new();
            for (i, packet) in packets.iter().enumerate() {
                if i > 0 {
                    out.push(RECORD_SEPARATOR);
                }
                out.push_str(&packet.encode_text());
            }
            out
        }
        ProtocolVersion::V3 => {
            let mut out = String::new();
            for packet in packets {
                let encoded = packet.encode_text();
                out.push_str(&encoded.len().to_string());
                out.push(':');
                out.push_str(&encoded);
            }
            out
        }
    }
}

/// Parse a poll request body back into packets
pub fn decode_payload(raw: &str, protocol: ProtocolVersion) -> Result<Vec<Packet>, EngineError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    match protocol {
        ProtocolVersion::V4 => raw
            .split(RECORD_SEPARATOR)
            .map(Packet::decode_text)
            .collect(),
        ProtocolVersion::V3 => {
            let mut packets = Vec::new();
            let mut rest = raw;
            while !rest.is_empty() {
                let colon = rest
                    .find(':')
                    .ok_or(EngineError::InvalidPacket("missing length prefix"))?;
                let len: usize = rest[..colon]
                    .parse()
                    .map_err(|_| EngineError::InvalidPacket("bad length prefix"))?;
                let body_start = colon + 1;
                let body_end = body_start
                    .checked_add(len)
                    .filter(|end| *end <= rest.len())
                    .ok_or(EngineError::InvalidPacket("length prefix out of range"))?;
                let body = rest
                    .get(body_start..body_end)
                    .ok_or(EngineError::InvalidPacket("length prefix splits a character"))?;
                packets.push(Packet::decode_text(body)?);
                rest = &rest[body_end..];
            }
            Ok(packets)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketData;
    use bytes::Bytes;

    #[test]
    fn test_v4_roundtrip() {
        let packets = vec![
            Packet::message("first"),
            Packet::ping(),
            Packet::message("second"),
        ];
        let payload = encode_payload(&packets, ProtocolVersion::V4);
        assert_eq!(payload, "4first\u{1e}2\u{1e}4second");
        assert_eq!(decode_payload(&payload, ProtocolVersion::V4).unwrap(), packets);
    }

    #[test]
    fn test_v4_single_packet_has_no_separator() {
        let packets = vec![Packet::message("only")];
        let payload = encode_payload(&packets, ProtocolVersion::V4);
        assert_eq!(payload, "4only");
    }

    #[test]
    fn test_v3_roundtrip() {
        let packets = vec![Packet::message("hi"), Packet::noop()];
        let payload = encode_payload(&packets, ProtocolVersion::V3);
        assert_eq!(payload, "3:4hi1:6");
        assert_eq!(decode_payload(&payload, ProtocolVersion::V3).unwrap(), packets);
    }

    #[test]
    fn test_v3_rejects_bad_length() {
        assert!(decode_payload("99:4hi", ProtocolVersion::V3).is_err());
        assert!(decode_payload("4hi", ProtocolVersion::V3).is_err());
        assert!(decode_payload("x:4hi", ProtocolVersion::V3).is_err());
    }

    #[test]
    fn test_empty_payload() {
        assert!(decode_payload("", ProtocolVersion::V4).unwrap().is_empty());
        assert!(decode_payload("", ProtocolVersion::V3).unwrap().is_empty());
    }

    #[test]
    fn test_binary_in_payload_is_base64() {
        let packets = vec![Packet::binary(Bytes::from_static(b"\x01\x02"))];
        let payload = encode_payload(&packets, ProtocolVersion::V4);
        assert!(payload.starts_with('b'));
        let decoded = decode_payload(&payload, ProtocolVersion::V4).unwrap();
        assert!(matches!(&decoded[0].data, PacketData::Binary(b) if b.as_ref() == b"\x01\x02"));
    }
}
