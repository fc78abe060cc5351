//! Codec errors

use thiserror::Error;

/// Errors produced while encoding or decoding multiplexing packets
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Malformed packet: {0}")]
    InvalidFormat(&'static str),

    #[error("Invalid payload for packet type")]
    InvalidPayload,

    #[error("illegal attachments")]
    IllegalAttachments,

    #[error("Unexpected binary frame")]
    UnexpectedBinary,

    #[error("Text frame received during binary reconstruction")]
    UnexpectedText,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
