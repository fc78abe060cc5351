//! Streaming packet decoder
//!
//! Text frames decode to packets immediately. A binary packet head opens a
//! reconstruction window: exactly `attachments` binary frames must follow
//! before the reassembled packet is yielded.

use crate::binary;
use crate::error::ParseError;
use crate::packet::{Packet, PacketType};
use bytes::Bytes;

struct PendingBinary {
    packet: Packet,
    expected: usize,
    received: Vec<Bytes>,
}

/// Stateful decoder for one connection
#[derive(Default)]
pub struct Decoder {
    pending: Option<PendingBinary>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while attachment frames are still expected
    pub fn reconstructing(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop any half-reassembled packet (connection teardown)
    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// Feed a text frame. Returns `None` when the frame opened a binary
    /// reconstruction window instead of completing a packet.
    pub fn decode_text(&mut self, raw: &str) -> Result<Option<Packet>, ParseError> {
        if self.pending.is_some() {
            return Err(ParseError::UnexpectedText);
        }

        let packet = Packet::decode(raw)?;
        match packet.packet_type {
            PacketType::BinaryEvent | PacketType::BinaryAck => {
                let expected = packet.attachments.unwrap_or(0);
                if expected == 0 {
                    return finalize(packet, &[]).map(Some);
                }
                self.pending = Some(PendingBinary {
                    packet,
                    expected,
                    received: Vec::with_capacity(expected),
                });
                Ok(None)
            }
            _ => Ok(Some(packet)),
        }
    }

    /// Feed a binary frame. Returns the reassembled packet once the last
    /// expected attachment arrives.
    pub fn decode_binary(&mut self, frame: Bytes) -> Result<Option<Packet>, ParseError> {
        let pending = self.pending.as_mut().ok_or(ParseError::UnexpectedBinary)?;
        pending.received.push(frame);
        if pending.received.len() < pending.expected {
            return Ok(None);
        }

        match self.pending.take() {
            Some(done) => finalize(done.packet, &done.received).map(Some),
            None => Err(ParseError::UnexpectedBinary),
        }
    }
}

/// Substitute attachments and normalize the packet back to its text variant.
fn finalize(mut packet: Packet, attachments: &[Bytes]) -> Result<Packet, ParseError> {
    if let Some(data) = packet.data.as_mut() {
        binary::reconstruct(data, attachments)?;
    }
    packet.packet_type = match packet.packet_type {
        PacketType::BinaryEvent => PacketType::Event,
        PacketType::BinaryAck => PacketType::Ack,
        other => other,
    };
    packet.attachments = None;
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Data;

    #[test]
    fn test_text_packet_passthrough() {
        let mut decoder = Decoder::new();
        let packet = decoder.decode_text(r#"2["chat","hi"]"#).unwrap().unwrap();
        assert_eq!(packet.packet_type, PacketType::Event);
        assert!(!decoder.reconstructing());
    }

    #[test]
    fn test_binary_event_reassembly() {
        let mut decoder = Decoder::new();
        let head = r#"52-["upload",{"_placeholder":true,"num":0},{"_placeholder":true,"num":1}]"#;

        assert!(decoder.decode_text(head).unwrap().is_none());
        assert!(decoder.reconstructing());

        assert!(decoder
            .decode_binary(Bytes::from_static(b"one"))
            .unwrap()
            .is_none());
        let packet = decoder
            .decode_binary(Bytes::from_static(b"two"))
            .unwrap()
            .unwrap();

        assert_eq!(packet.packet_type, PacketType::Event);
        assert_eq!(packet.attachments, None);
        assert_eq!(
            packet.data,
            Some(Data::Array(vec![
                Data::Text("upload".into()),
                Data::Binary(Bytes::from_static(b"one")),
                Data::Binary(Bytes::from_static(b"two")),
            ]))
        );
    }

    #[test]
    fn test_roundtrip_through_encode() {
        let original = Packet::event(
            "/files",
            Data::Array(vec![
                Data::Text("put".into()),
                Data::Binary(Bytes::from_static(b"\xde\xad")),
            ]),
        )
        .with_id(9);

        let encoded = original.clone().encode().unwrap();
        let mut decoder = Decoder::new();
        assert!(decoder.decode_text(&encoded.head).unwrap().is_none());
        let mut out = None;
        for frame in encoded.attachments {
            out = decoder.decode_binary(frame).unwrap();
        }
        assert_eq!(out.unwrap(), original);
    }

    #[test]
    fn test_binary_frame_without_header() {
        let mut decoder = Decoder::new();
        let err = decoder
            .decode_binary(Bytes::from_static(b"stray"))
            .unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedBinary));
    }

    #[test]
    fn test_text_frame_during_reconstruction() {
        let mut decoder = Decoder::new();
        decoder
            .decode_text(r#"51-["upload",{"_placeholder":true,"num":0}]"#)
            .unwrap();
        let err = decoder.decode_text(r#"2["chat"]"#).unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedText));
    }

    #[test]
    fn test_placeholder_out_of_range_is_fatal() {
        let mut decoder = Decoder::new();
        decoder
            .decode_text(r#"51-["upload",{"_placeholder":true,"num":3}]"#)
            .unwrap();
        let err = decoder
            .decode_binary(Bytes::from_static(b"only"))
            .unwrap_err();
        assert!(matches!(err, ParseError::IllegalAttachments));
    }
}
