//! Inter-node protocol messages
//!
//! Every message carries the origin node uid so receivers can drop echoes
//! of their own publications, and request/response pairs are correlated by
//! per-node monotonic request ids.

use nexio::{BroadcastFlags, BroadcastOptions, Data};
use nexio_parser::{Decoder, EncodedPacket, Packet, ParseError};
use serde::{Deserialize, Serialize};

/// A packet encoded once, in broker-serializable form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePacket {
    pub head: String,
    pub attachments: Vec<Vec<u8>>,
}

impl WirePacket {
    pub fn from_encoded(encoded: &EncodedPacket) -> Self {
        Self {
            head: encoded.head.clone(),
            attachments: encoded
                .attachments
                .iter()
                .map(|bytes| bytes.to_vec())
                .collect(),
        }
    }

    /// Decode back into a packet on the receiving node
    pub fn decode(&self) -> Result<Packet, ParseError> {
        let mut decoder = Decoder::new();
        let mut out = decoder.decode_text(&self.head)?;
        for attachment in &self.attachments {
            out = decoder.decode_binary(attachment.clone().into())?;
        }
        out.ok_or(ParseError::IllegalAttachments)
    }
}

/// Broadcast target description in broker-serializable form
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireOptions {
    pub rooms: Vec<String>,
    pub except: Vec<String>,
    pub volatile: bool,
}

impl WireOptions {
    pub fn from_options(opts: &BroadcastOptions) -> Self {
        Self {
            rooms: opts.rooms.iter().cloned().collect(),
            except: opts.except.iter().cloned().collect(),
            volatile: opts.flags.volatile,
        }
    }

    /// Rehydrate for the receiving node's local adapter
    pub fn into_options(self) -> BroadcastOptions {
        BroadcastOptions {
            rooms: self.rooms.into_iter().collect(),
            except: self.except.into_iter().collect(),
            flags: BroadcastFlags {
                volatile: self.volatile,
                // remote fan-out must never bounce back onto the channel
                local: true,
                timeout: None,
            },
        }
    }
}

/// Messages exchanged over the inter-node channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterMessage {
    Broadcast {
        origin: String,
        nsp: String,
        packet: WirePacket,
        opts: WireOptions,
    },
    BroadcastWithAck {
        origin: String,
        nsp: String,
        req_id: u64,
        packet: WirePacket,
        opts: WireOptions,
    },
    /// A node reporting how many of its sockets will acknowledge
    AckCount {
        origin: String,
        nsp: String,
        req_id: u64,
        requester: String,
        count: usize,
    },
    /// One responder's acknowledgement payload
    AckReply {
        origin: String,
        nsp: String,
        req_id: u64,
        requester: String,
        reply: Vec<Data>,
    },
    ServerCountRequest {
        origin: String,
        nsp: String,
        req_id: u64,
    },
    ServerCountResponse {
        origin: String,
        nsp: String,
        req_id: u64,
        requester: String,
    },
}

impl ClusterMessage {
    pub fn origin(&self) -> &str {
        match self {
            ClusterMessage::Broadcast { origin, .. }
            | ClusterMessage::BroadcastWithAck { origin, .. }
            | ClusterMessage::AckCount { origin, .. }
            | ClusterMessage::AckReply { origin, .. }
            | ClusterMessage::ServerCountRequest { origin, .. }
            | ClusterMessage::ServerCountResponse { origin, .. } => origin,
        }
    }

    pub fn nsp(&self) -> &str {
        match self {
            ClusterMessage::Broadcast { nsp, .. }
            | ClusterMessage::BroadcastWithAck { nsp, .. }
            | ClusterMessage::AckCount { nsp, .. }
            | ClusterMessage::AckReply { nsp, .. }
            | ClusterMessage::ServerCountRequest { nsp, .. }
            | ClusterMessage::ServerCountResponse { nsp, .. } => nsp,
        }
    }
}
