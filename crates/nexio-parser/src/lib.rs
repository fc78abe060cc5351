//! Multiplexing Packet Vocabulary and Wire Codec
//!
//! This crate defines the packet types exchanged by the multiplexing layer
//! (connect, disconnect, events, acknowledgements) together with their text
//! wire form and the deconstruction/reconstruction pass that moves raw
//! binary payloads in and out of indexed attachment frames.

pub mod binary;
pub mod decoder;
pub mod error;
pub mod packet;
pub mod value;

pub use decoder::Decoder;
pub use error::ParseError;
pub use packet::{EncodedPacket, Packet, PacketType, RESERVED_EVENTS};
pub use value::Data;

/// Revision of the multiplexing wire protocol implemented by this codec.
pub const PROTOCOL_VERSION: u8 = 5;
