//! Multiplexing-layer errors

use nexio_parser::Data;
use thiserror::Error;

/// Failures when emitting to a single socket
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("Socket is not connected")]
    Disconnected,

    #[error("Reserved event name: {0}")]
    ReservedEvent(String),

    #[error("Encode error: {0}")]
    Encode(#[from] nexio_parser::ParseError),

    #[error("Engine error: {0}")]
    Engine(#[from] nexio_engine::EngineError),
}

/// Failures while waiting for an acknowledgement
#[derive(Debug, Error)]
pub enum AckError {
    #[error("Acknowledgement timed out")]
    Timeout,

    #[error("Socket closed before acknowledgement")]
    SocketClosed,

    #[error(transparent)]
    Emit(#[from] EmitError),
}

/// Failures during a broadcast
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Reserved event name: {0}")]
    ReservedEvent(String),

    #[error("Encode error: {0}")]
    Encode(#[from] nexio_parser::ParseError),

    #[error("Namespace is gone")]
    NamespaceGone,

    #[error("Broker error: {0}")]
    Broker(String),
}

/// Middleware rejection, carried back to the peer in a `CONNECT_ERROR`
/// packet as `{message, data?}`
#[derive(Debug, Clone)]
pub struct ConnectDenial {
    pub message: String,
    pub data: Option<Data>,
}

impl ConnectDenial {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Data) -> Self {
        self.data = Some(data);
        self
    }

    /// The `CONNECT_ERROR` payload object
    pub fn to_payload(&self) -> Data {
        let mut entries = vec![("message".to_string(), Data::Text(self.message.clone()))];
        if let Some(data) = &self.data {
            entries.push(("data".to_string(), data.clone()));
        }
        Data::Object(entries)
    }
}
