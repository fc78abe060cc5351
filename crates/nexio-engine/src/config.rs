//! Engine configuration

use crate::server::RequestContext;
use crate::transport::TransportKind;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Pluggable handshake gate. Returning an error message rejects the request
/// with a `Forbidden` response carrying that message.
pub type AllowRequest = Arc<dyn Fn(&RequestContext) -> Result<(), String> + Send + Sync>;

/// Pluggable session id generator, fed a monotonic sequence number.
pub type SidGenerator = Arc<dyn Fn(u64) -> String + Send + Sync>;

/// Engine server configuration
#[derive(Clone)]
pub struct EngineConfig {
    /// Delay between server pings (protocol v4)
    pub ping_interval: Duration,
    /// How long to wait for the peer's pong before declaring it dead
    pub ping_timeout: Duration,
    /// How long an upgrade probe may stay incomplete
    pub upgrade_timeout: Duration,
    /// Maximum accepted payload size in bytes
    pub max_payload: usize,
    /// Transports accepted at handshake, in preference order
    pub transports: Vec<TransportKind>,
    /// Whether connections may upgrade to another transport
    pub allow_upgrades: bool,
    /// Poll responses at or above this size get a negotiated
    /// content-encoding hint attached
    pub compression_threshold: usize,
    /// Optional handshake gate
    pub allow_request: Option<AllowRequest>,
    /// Optional session id generator override
    pub sid_generator: Option<SidGenerator>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            ping_timeout: Duration::from_secs(20),
            upgrade_timeout: Duration::from_secs(10),
            max_payload: 1_000_000,
            transports: vec![
                TransportKind::Polling,
                TransportKind::WebSocket,
                TransportKind::WebTransport,
            ],
            allow_upgrades: true,
            compression_threshold: 1024,
            allow_request: None,
            sid_generator: None,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("ping_interval", &self.ping_interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("upgrade_timeout", &self.upgrade_timeout)
            .field("max_payload", &self.max_payload)
            .field("transports", &self.transports)
            .field("allow_upgrades", &self.allow_upgrades)
            .field("compression_threshold", &self.compression_threshold)
            .field("allow_request", &self.allow_request.is_some())
            .field("sid_generator", &self.sid_generator.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(25));
        assert_eq!(config.ping_timeout, Duration::from_secs(20));
        assert_eq!(config.transports.len(), 3);
        assert!(config.allow_upgrades);
    }
}
