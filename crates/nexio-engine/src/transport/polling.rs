//! HTTP long-polling transport
//!
//! Each inbound poll is a GET awaiting data and a POST delivering data. At
//! most one of each may be outstanding per connection; a second concurrent
//! GET or POST fails that exchange with an overlap error without touching
//! the transport itself.

use crate::error::EngineError;
use crate::packet::Packet;
use crate::payload::{decode_payload, encode_payload};
use crate::transport::{TransportEvent, TransportId};
use crate::ProtocolVersion;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Content encodings the polling responder can negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    Deflate,
}

impl ContentEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Deflate => "deflate",
        }
    }
}

/// Pick the preferred supported encoding from an `Accept-Encoding` header.
///
/// Entries are weighted by their `q` parameter per the standard preference
/// rules; unsupported encodings and `q=0` entries are skipped. Byte-level
/// compression itself is left to the HTTP layer.
pub fn negotiate_encoding(accept_encoding: &str) -> Option<ContentEncoding> {
    let mut best: Option<(f32, ContentEncoding)> = None;
    for entry in accept_encoding.split(',') {
        let mut parts = entry.trim().split(';');
        let name = parts.next().unwrap_or("").trim();
        let encoding = match name {
            "gzip" => ContentEncoding::Gzip,
            "deflate" => ContentEncoding::Deflate,
            _ => continue,
        };
        let mut q = 1.0f32;
        for param in parts {
            if let Some(value) = param.trim().strip_prefix("q=") {
                q = value.parse().unwrap_or(0.0);
            }
        }
        if q <= 0.0 {
            continue;
        }
        match best {
            Some((best_q, _)) if best_q >= q => {}
            _ => best = Some((q, encoding)),
        }
    }
    best.map(|(_, encoding)| encoding)
}

struct PollingShared {
    /// Parked GET waiting for outbound packets
    waiter: Mutex<Option<oneshot::Sender<String>>>,
    post_in_flight: AtomicBool,
    closed: AtomicBool,
    discarded: AtomicBool,
}

/// Long-polling transport state
pub struct PollingTransport {
    protocol: ProtocolVersion,
    max_payload: usize,
    inbox: mpsc::UnboundedSender<(TransportId, TransportEvent)>,
    tid: TransportId,
    shared: Arc<PollingShared>,
}

impl std::fmt::Debug for PollingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingTransport")
            .field("tid", &self.tid)
            .field("writable", &self.writable())
            .finish()
    }
}

impl PollingTransport {
    pub fn new(
        protocol: ProtocolVersion,
        max_payload: usize,
        inbox: mpsc::UnboundedSender<(TransportId, TransportEvent)>,
        tid: TransportId,
    ) -> Self {
        Self {
            protocol,
            max_payload,
            inbox,
            tid,
            shared: Arc::new(PollingShared {
                waiter: Mutex::new(None),
                post_in_flight: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                discarded: AtomicBool::new(false),
            }),
        }
    }

    /// Writable while a GET is parked awaiting data
    pub fn writable(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
            && self
                .shared
                .waiter
                .lock()
                .map(|waiter| waiter.is_some())
                .unwrap_or(false)
    }

    /// Handle a poll GET: park until packets are flushed, then return the
    /// framed payload body. A GET arriving while another is parked fails
    /// with `PollOverlap` and leaves the parked one untouched.
    pub async fn on_poll(&self) -> Result<String, EngineError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Ok(encode_payload(&[Packet::close()], self.protocol));
        }

        let rx = {
            let mut waiter = self
                .shared
                .waiter
                .lock()
                .map_err(|_| EngineError::Closed)?;
            if waiter.is_some() {
                return Err(EngineError::PollOverlap);
            }
            let (tx, rx) = oneshot::channel();
            *waiter = Some(tx);
            rx
        };

        trace!("[{}] poll parked", self.tid);
        // let the connection flush anything it has buffered
        let _ = self.inbox.send((self.tid, TransportEvent::Drain));

        match rx.await {
            Ok(payload) => Ok(payload),
            // transport torn down while parked
            Err(_) => Ok(encode_payload(&[Packet::noop()], self.protocol)),
        }
    }

    /// Handle a data POST, feeding decoded packets into the connection
    pub fn on_data(&self, body: &[u8]) -> Result<(), EngineError> {
        if body.len() > self.max_payload {
            return Err(EngineError::PayloadTooLarge(body.len()));
        }
        if self.shared.post_in_flight.swap(true, Ordering::SeqCst) {
            return Err(EngineError::PollOverlap);
        }

        let result = self.decode_and_dispatch(body);
        self.shared.post_in_flight.store(false, Ordering::SeqCst);
        result
    }

    fn decode_and_dispatch(&self, body: &[u8]) -> Result<(), EngineError> {
        let text = std::str::from_utf8(body)
            .map_err(|_| EngineError::InvalidPacket("payload is not utf-8"))?;
        let packets = decode_payload(text, self.protocol)?;
        if self.shared.discarded.load(Ordering::SeqCst) {
            return Ok(());
        }
        for packet in packets {
            let _ = self.inbox.send((self.tid, TransportEvent::Packet(packet)));
        }
        Ok(())
    }

    /// Complete the parked GET with a framed batch of packets
    pub fn send(&self, packets: Vec<Packet>) -> Result<(), EngineError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        let waiter = self
            .shared
            .waiter
            .lock()
            .map_err(|_| EngineError::Closed)?
            .take();
        match waiter {
            Some(tx) => {
                let payload = encode_payload(&packets, self.protocol);
                trace!("[{}] releasing poll with {} packets", self.tid, packets.len());
                tx.send(payload).map_err(|_| EngineError::Closed)
            }
            None => Err(EngineError::TransportNotWritable),
        }
    }

    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("[{}] polling transport shut down", self.tid);
        // release a parked GET with a close packet so the peer stops polling
        if let Ok(mut waiter) = self.shared.waiter.lock() {
            if let Some(tx) = waiter.take() {
                let _ = tx.send(encode_payload(&[Packet::close()], self.protocol));
            }
        }
    }

    pub fn discard(&self) {
        self.shared.discarded.store(true, Ordering::SeqCst);
    }
}
