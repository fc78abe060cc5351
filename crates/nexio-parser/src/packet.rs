//! Multiplexing packet types and text wire form
//!
//! Text form: `<type digit>[<attachment count>-][<namespace>,][<ack id>][<json>]`.
//! The namespace segment is omitted for the default "/" and the ack id is a
//! contiguous run of leading digits before the JSON payload.

use crate::binary;
use crate::error::ParseError;
use crate::value::Data;
use bytes::Bytes;

/// Control names that application events must not use
pub const RESERVED_EVENTS: [&str; 4] = ["connect", "connect_error", "disconnect", "disconnecting"];

/// Multiplexing packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    ConnectError = 4,
    BinaryEvent = 5,
    BinaryAck = 6,
}

impl PacketType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Connect),
            1 => Ok(PacketType::Disconnect),
            2 => Ok(PacketType::Event),
            3 => Ok(PacketType::Ack),
            4 => Ok(PacketType::ConnectError),
            5 => Ok(PacketType::BinaryEvent),
            6 => Ok(PacketType::BinaryAck),
            _ => Err(ParseError::InvalidPacketType(value)),
        }
    }
}

/// A multiplexing packet
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub nsp: String,
    pub id: Option<u64>,
    pub data: Option<Data>,
    pub attachments: Option<usize>,
}

/// A packet encoded once for fan-out: the text head plus binary attachments
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub head: String,
    pub attachments: Vec<Bytes>,
}

impl Packet {
    pub fn new(packet_type: PacketType, nsp: impl Into<String>) -> Self {
        Self {
            packet_type,
            nsp: nsp.into(),
            id: None,
            data: None,
            attachments: None,
        }
    }

    pub fn connect(nsp: impl Into<String>, data: Option<Data>) -> Self {
        Self {
            data,
            ..Self::new(PacketType::Connect, nsp)
        }
    }

    pub fn connect_error(nsp: impl Into<String>, data: Data) -> Self {
        Self {
            data: Some(data),
            ..Self::new(PacketType::ConnectError, nsp)
        }
    }

    pub fn disconnect(nsp: impl Into<String>) -> Self {
        Self::new(PacketType::Disconnect, nsp)
    }

    pub fn event(nsp: impl Into<String>, data: Data) -> Self {
        Self {
            data: Some(data),
            ..Self::new(PacketType::Event, nsp)
        }
    }

    pub fn ack(nsp: impl Into<String>, id: u64, data: Data) -> Self {
        Self {
            id: Some(id),
            data: Some(data),
            ..Self::new(PacketType::Ack, nsp)
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Encode into the text head plus attachments.
    ///
    /// Any raw binary leaves are deconstructed first, promoting the packet
    /// to its binary variant and recording the attachment count.
    pub fn encode(mut self) -> Result<EncodedPacket, ParseError> {
        let mut attachments = Vec::new();
        if let Some(data) = self.data.as_mut() {
            if data.contains_binary() {
                attachments = binary::deconstruct(data);
                self.packet_type = match self.packet_type {
                    PacketType::Event => PacketType::BinaryEvent,
                    PacketType::Ack => PacketType::BinaryAck,
                    other => other,
                };
                self.attachments = Some(attachments.len());
            }
        }

        let mut head = String::new();
        head.push((b'0' + self.packet_type.as_u8()) as char);
        if matches!(
            self.packet_type,
            PacketType::BinaryEvent | PacketType::BinaryAck
        ) {
            head.push_str(&self.attachments.unwrap_or(0).to_string());
            head.push('-');
        }
        if self.nsp != "/" {
            head.push_str(&self.nsp);
            head.push(',');
        }
        if let Some(id) = self.id {
            head.push_str(&id.to_string());
        }
        if let Some(data) = &self.data {
            head.push_str(&serde_json::to_string(data)?);
        }

        Ok(EncodedPacket { head, attachments })
    }

    /// Decode the text head of a packet.
    ///
    /// Binary packets come back with placeholders still in place; the
    /// streaming decoder reconstructs them once the attachment frames arrive.
    pub fn decode(raw: &str) -> Result<Packet, ParseError> {
        let bytes = raw.as_bytes();
        let first = *bytes.first().ok_or(ParseError::InvalidFormat("empty packet"))?;
        let packet_type = PacketType::try_from(first.wrapping_sub(b'0'))?;
        let mut pos = 1;

        let mut attachments = None;
        if matches!(packet_type, PacketType::BinaryEvent | PacketType::BinaryAck) {
            let start = pos;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
            if pos == start || pos >= bytes.len() || bytes[pos] != b'-' {
                return Err(ParseError::InvalidFormat("missing attachment count"));
            }
            let count = raw[start..pos]
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidFormat("attachment count overflow"))?;
            attachments = Some(count);
            pos += 1;
        }

        let mut nsp = String::from("/");
        if pos < bytes.len() && bytes[pos] == b'/' {
            let start = pos;
            while pos < bytes.len() && bytes[pos] != b',' {
                pos += 1;
            }
            nsp = raw[start..pos].to_string();
            if pos < bytes.len() {
                pos += 1;
            }
        }

        let start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        let id = if pos > start {
            Some(
                raw[start..pos]
                    .parse::<u64>()
                    .map_err(|_| ParseError::InvalidFormat("ack id overflow"))?,
            )
        } else {
            None
        };

        let data = if pos < bytes.len() {
            Some(serde_json::from_str::<Data>(&raw[pos..])?)
        } else {
            None
        };

        let packet = Packet {
            packet_type,
            nsp,
            id,
            data,
            attachments,
        };
        packet.validate()?;
        Ok(packet)
    }

    /// Enforce the payload invariants for each packet type.
    pub fn validate(&self) -> Result<(), ParseError> {
        match self.packet_type {
            PacketType::Connect | PacketType::Disconnect => match &self.data {
                None | Some(Data::Object(_)) => Ok(()),
                _ => Err(ParseError::InvalidPayload),
            },
            PacketType::ConnectError => Ok(()),
            PacketType::Event | PacketType::BinaryEvent => match &self.data {
                Some(Data::Array(items)) if !items.is_empty() => match &items[0] {
                    Data::Text(name) if !RESERVED_EVENTS.contains(&name.as_str()) => Ok(()),
                    Data::Number(_) => Ok(()),
                    _ => Err(ParseError::InvalidPayload),
                },
                _ => Err(ParseError::InvalidPayload),
            },
            PacketType::Ack | PacketType::BinaryAck => match &self.data {
                Some(Data::Array(_)) => Ok(()),
                _ => Err(ParseError::InvalidPayload),
            },
        }
    }
}
