//! Engine errors
//!
//! `HandshakeError` is the fixed taxonomy surfaced before a connection
//! exists; these abort the request immediately and are never retried.
//! `EngineError` covers runtime failures on an established connection.

use thiserror::Error;

/// Runtime errors on an established connection or transport
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Transport is not writable")]
    TransportNotWritable,

    #[error("Connection closed")]
    Closed,

    #[error("Overlapping poll request")]
    PollOverlap,

    #[error("Invalid packet: {0}")]
    InvalidPacket(&'static str),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

/// Handshake rejection taxonomy
///
/// `BadRequest` carries an internal name subclassifying the failure
/// (e.g. "transport mismatch"); the wire message stays generic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("Transport unknown")]
    UnknownTransport,

    #[error("Session ID unknown")]
    UnknownSid,

    #[error("Bad handshake method")]
    BadHandshakeMethod,

    #[error("Bad request: {0}")]
    BadRequest(&'static str),

    #[error("Forbidden")]
    Forbidden(Option<String>),

    #[error("Unsupported protocol version")]
    UnsupportedProtocolVersion,
}

impl HandshakeError {
    /// Stable numeric code sent to the peer
    pub fn code(&self) -> u8 {
        match self {
            HandshakeError::UnknownTransport => 0,
            HandshakeError::UnknownSid => 1,
            HandshakeError::BadHandshakeMethod => 2,
            HandshakeError::BadRequest(_) => 3,
            HandshakeError::Forbidden(_) => 4,
            HandshakeError::UnsupportedProtocolVersion => 5,
        }
    }

    /// Wire message for the error body
    pub fn message(&self) -> &str {
        match self {
            HandshakeError::UnknownTransport => "Transport unknown",
            HandshakeError::UnknownSid => "Session ID unknown",
            HandshakeError::BadHandshakeMethod => "Bad handshake method",
            HandshakeError::BadRequest(_) => "Bad request",
            HandshakeError::Forbidden(Some(message)) => message,
            HandshakeError::Forbidden(None) => "Forbidden",
            HandshakeError::UnsupportedProtocolVersion => "Unsupported protocol version",
        }
    }

    /// HTTP status for the error response
    pub fn status(&self) -> u16 {
        match self {
            HandshakeError::Forbidden(_) => 403,
            _ => 400,
        }
    }

    /// JSON body `{code, message}` for the error response
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "code": self.code(),
            "message": self.message(),
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(HandshakeError::UnknownTransport.code(), 0);
        assert_eq!(HandshakeError::UnknownSid.code(), 1);
        assert_eq!(HandshakeError::BadHandshakeMethod.code(), 2);
        assert_eq!(HandshakeError::BadRequest("transport mismatch").code(), 3);
        assert_eq!(HandshakeError::Forbidden(None).code(), 4);
        assert_eq!(HandshakeError::UnsupportedProtocolVersion.code(), 5);
    }

    #[test]
    fn test_forbidden_is_403() {
        assert_eq!(HandshakeError::Forbidden(None).status(), 403);
        assert_eq!(HandshakeError::UnknownSid.status(), 400);
    }

    #[test]
    fn test_json_body() {
        let body = HandshakeError::UnknownSid.to_json();
        assert_eq!(body, r#"{"code":1,"message":"Session ID unknown"}"#);
    }

    #[test]
    fn test_forbidden_custom_message() {
        let err = HandshakeError::Forbidden(Some("origin not allowed".into()));
        assert_eq!(err.message(), "origin not allowed");
        assert_eq!(err.code(), 4);
    }
}
