//! Engine connection
//!
//! One logical connection owning exactly one active transport at a time.
//! Runs the heartbeat state machine, buffers outbound packets, and mediates
//! the probe/upgrade handshake that swaps the active transport without
//! losing packets.
//!
//! Inbound events are tagged with the id of the transport that produced
//! them; events from discarded transports are ignored, and events from an
//! upgrade probe are never delivered to the application.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::packet::{OpenPacket, Packet, PacketData, PacketType};
use crate::transport::{Transport, TransportEvent, TransportId, TransportKind};
use crate::ProtocolVersion;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Connection lifecycle. Transitions are monotonic; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Why a connection closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    TransportError,
    TransportClose,
    ForcedClose,
    PingTimeout,
    ServerShuttingDown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::TransportError => "transport error",
            CloseReason::TransportClose => "transport close",
            CloseReason::ForcedClose => "forced close",
            CloseReason::PingTimeout => "ping timeout",
            CloseReason::ServerShuttingDown => "server shutting down",
        }
    }
}

/// An application-level message crossing the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

/// Seam between the engine and the multiplexing layer. Messages for one
/// connection are delivered sequentially, in arrival order.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn on_connect(&self, socket: Arc<Socket>);
    async fn on_message(&self, socket: Arc<Socket>, message: Message);
    async fn on_close(&self, socket: Arc<Socket>, reason: CloseReason);
}

/// Request metadata captured at handshake time
#[derive(Debug, Clone, Default)]
pub struct HandshakeSummary {
    pub url: String,
    pub user_agent: Option<String>,
    pub origin: Option<String>,
    pub secure: bool,
    pub issued_ms: u64,
}

struct ProbeState {
    tid: TransportId,
    transport: Arc<Transport>,
    keepalive: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Timers {
    ping: Option<JoinHandle<()>>,
    ping_timeout: Option<JoinHandle<()>>,
    upgrade: Option<JoinHandle<()>>,
}

/// An engine connection
pub struct Socket {
    id: String,
    protocol: ProtocolVersion,
    config: EngineConfig,
    remote: HandshakeSummary,
    state: RwLock<ReadyState>,
    transport: RwLock<Option<Arc<Transport>>>,
    current_tid: AtomicU64,
    tid_seq: AtomicU64,
    upgrading: AtomicBool,
    upgraded: AtomicBool,
    write_buf: Mutex<VecDeque<Packet>>,
    inbox_tx: mpsc::UnboundedSender<(TransportId, TransportEvent)>,
    probe: Mutex<Option<ProbeState>>,
    timers: Mutex<Timers>,
    handler: Arc<dyn Handler>,
    server: Weak<crate::server::EngineInner>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("state", &self.state())
            .field("upgraded", &self.upgraded.load(Ordering::SeqCst))
            .finish()
    }
}

impl Socket {
    /// Create the connection and spawn its event loop
    pub(crate) fn new(
        id: String,
        protocol: ProtocolVersion,
        config: EngineConfig,
        remote: HandshakeSummary,
        handler: Arc<dyn Handler>,
        server: Weak<crate::server::EngineInner>,
    ) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let socket = Arc::new(Self {
            id,
            protocol,
            config,
            remote,
            state: RwLock::new(ReadyState::Opening),
            transport: RwLock::new(None),
            current_tid: AtomicU64::new(0),
            tid_seq: AtomicU64::new(0),
            upgrading: AtomicBool::new(false),
            upgraded: AtomicBool::new(false),
            write_buf: Mutex::new(VecDeque::new()),
            inbox_tx,
            probe: Mutex::new(None),
            timers: Mutex::new(Timers::default()),
            handler,
            server,
        });
        tokio::spawn(Socket::run(socket.clone(), inbox_rx));
        socket
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub fn remote(&self) -> &HandshakeSummary {
        &self.remote
    }

    pub fn state(&self) -> ReadyState {
        *self.state.read().unwrap()
    }

    pub fn upgraded(&self) -> bool {
        self.upgraded.load(Ordering::SeqCst)
    }

    pub fn transport_name(&self) -> Option<&'static str> {
        self.current_transport().map(|t| t.name())
    }

    pub fn current_transport(&self) -> Option<Arc<Transport>> {
        self.transport.read().unwrap().clone()
    }

    pub(crate) fn inbox_sender(&self) -> mpsc::UnboundedSender<(TransportId, TransportEvent)> {
        self.inbox_tx.clone()
    }

    pub(crate) fn next_tid(&self) -> TransportId {
        self.tid_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn attach_transport(&self, transport: Arc<Transport>, tid: TransportId) {
        *self.transport.write().unwrap() = Some(transport);
        self.current_tid.store(tid, Ordering::SeqCst);
    }

    /// Enter the open state: send the handshake packet and start heartbeats
    pub(crate) fn open(self: &Arc<Self>) -> Result<(), EngineError> {
        *self.state.write().unwrap() = ReadyState::Open;
        let open = OpenPacket {
            sid: self.id.clone(),
            upgrades: self.upgrade_names(),
            ping_interval: self.config.ping_interval.as_millis() as u64,
            ping_timeout: self.config.ping_timeout.as_millis() as u64,
            max_payload: self.config.max_payload as u64,
        };
        self.send(Packet::open(&open)?)?;
        match self.protocol {
            ProtocolVersion::V4 => self.schedule_ping(),
            ProtocolVersion::V3 => self.arm_v3_deadline(),
        }
        Ok(())
    }

    fn upgrade_names(&self) -> Vec<String> {
        if !self.config.allow_upgrades {
            return Vec::new();
        }
        let current = match self.current_transport() {
            Some(t) => t.kind(),
            None => return Vec::new(),
        };
        if current.handles_upgrades() {
            return Vec::new();
        }
        self.config
            .transports
            .iter()
            .filter(|kind| kind.handles_upgrades())
            .map(|kind| kind.as_str().to_string())
            .collect()
    }

    /// Queue a packet and flush if the active transport is writable
    pub fn send(self: &Arc<Self>, packet: Packet) -> Result<(), EngineError> {
        if matches!(self.state(), ReadyState::Closed) {
            return Err(EngineError::Closed);
        }
        self.write_buf.lock().unwrap().push_back(packet);
        self.flush();
        Ok(())
    }

    /// Best-effort send: dropped silently when the transport cannot take it
    pub fn send_volatile(self: &Arc<Self>, packet: Packet) {
        let writable = self
            .current_transport()
            .map(|t| t.writable())
            .unwrap_or(false);
        if writable && !self.upgrading.load(Ordering::SeqCst) {
            let _ = self.send(packet);
        } else {
            trace!("[{}] dropping volatile packet", self.id);
        }
    }

    /// Fast path for broadcast fan-out: hand pre-encoded frames straight to
    /// a binary-capable transport. Returns false when the caller must fall
    /// back to the buffered path.
    pub fn send_prepared(self: &Arc<Self>, frames: Vec<crate::packet::EncodedFrame>) -> bool {
        if self.upgrading.load(Ordering::SeqCst) {
            return false;
        }
        if !self.write_buf.lock().unwrap().is_empty() {
            return false;
        }
        let transport = match self.current_transport() {
            Some(t) => t,
            None => return false,
        };
        if !transport.kind().supports_binary() || !transport.writable() {
            return false;
        }
        transport.send_raw(frames).is_ok()
    }

    /// Drain the write buffer through the active transport, preserving order
    pub fn flush(self: &Arc<Self>) {
        if !matches!(self.state(), ReadyState::Open | ReadyState::Closing) {
            return;
        }
        // buffered packets wait for the new transport while upgrading
        if self.upgrading.load(Ordering::SeqCst) {
            return;
        }
        let transport = match self.current_transport() {
            Some(t) => t,
            None => return,
        };
        if !transport.writable() {
            return;
        }
        let packets: Vec<Packet> = {
            let mut buf = self.write_buf.lock().unwrap();
            if buf.is_empty() {
                return;
            }
            buf.drain(..).collect()
        };
        trace!("[{}] flushing {} packets", self.id, packets.len());
        if let Err(err) = transport.send(packets.clone()) {
            if matches!(err, EngineError::TransportNotWritable) {
                // lost the race for the poll cycle; keep the packets queued
                let mut buf = self.write_buf.lock().unwrap();
                for packet in packets.into_iter().rev() {
                    buf.push_front(packet);
                }
            } else {
                debug!("[{}] flush failed: {}", self.id, err);
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<(TransportId, TransportEvent)>,
    ) {
        while let Some((tid, event)) = inbox.recv().await {
            if matches!(self.state(), ReadyState::Closed) {
                break;
            }
            let probe_tid = self.probe.lock().unwrap().as_ref().map(|p| p.tid);
            if Some(tid) == probe_tid {
                self.on_probe_event(tid, event).await;
            } else if tid == self.current_tid.load(Ordering::SeqCst) {
                self.on_event(event).await;
            } else {
                trace!("[{}] ignoring event from stale transport {}", self.id, tid);
            }
        }
    }

    async fn on_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Packet(packet) => self.on_packet(packet).await,
            TransportEvent::Drain => self.flush(),
            TransportEvent::Error(err) => {
                debug!("[{}] transport error: {}", self.id, err);
                self.close_with(CloseReason::TransportError).await;
            }
            TransportEvent::Close => self.close_with(CloseReason::TransportClose).await,
        }
    }

    async fn on_packet(self: &Arc<Self>, packet: Packet) {
        match packet.packet_type {
            PacketType::Ping => {
                if self.protocol == ProtocolVersion::V3 {
                    // v3 peers drive the heartbeat: echo a pong and re-arm
                    let reply = Packet {
                        packet_type: PacketType::Pong,
                        data: packet.data.clone(),
                    };
                    let _ = self.send(reply);
                    self.arm_v3_deadline();
                } else {
                    debug!("[{}] unexpected ping on active transport", self.id);
                }
            }
            PacketType::Pong => {
                if self.protocol == ProtocolVersion::V4 {
                    self.on_pong();
                }
            }
            PacketType::Message => {
                let message = match packet.data {
                    PacketData::Text(text) => Message::Text(text),
                    PacketData::Binary(data) => Message::Binary(data),
                    PacketData::None => Message::Text(String::new()),
                };
                self.handler.on_message(self.clone(), message).await;
            }
            PacketType::Close => self.close_with(CloseReason::TransportClose).await,
            PacketType::Open | PacketType::Upgrade | PacketType::Noop => {}
        }
    }

    // v4 heartbeat: we ping, the peer pongs

    fn schedule_ping(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.ping_interval;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(socket) = weak.upgrade() {
                trace!("[{}] sending ping", socket.id);
                let _ = socket.send(Packet::ping());
                socket.arm_ping_timeout();
            }
        });
        let mut timers = self.timers.lock().unwrap();
        if let Some(old) = timers.ping.replace(handle) {
            old.abort();
        }
    }

    fn arm_ping_timeout(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let timeout = self.config.ping_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(socket) = weak.upgrade() {
                socket.close_with(CloseReason::PingTimeout).await;
            }
        });
        let mut timers = self.timers.lock().unwrap();
        if let Some(old) = timers.ping_timeout.replace(handle) {
            old.abort();
        }
    }

    fn on_pong(self: &Arc<Self>) {
        if let Some(timer) = self.timers.lock().unwrap().ping_timeout.take() {
            timer.abort();
        }
        self.schedule_ping();
    }

    // v3 heartbeat: the peer pings, one missed cycle is fatal

    fn arm_v3_deadline(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let deadline = self.config.ping_interval + self.config.ping_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(socket) = weak.upgrade() {
                socket.close_with(CloseReason::PingTimeout).await;
            }
        });
        let mut timers = self.timers.lock().unwrap();
        if let Some(old) = timers.ping_timeout.replace(handle) {
            old.abort();
        }
    }

    // upgrade probe

    /// Register a replacement transport and start the probe window
    pub(crate) fn maybe_upgrade(self: &Arc<Self>, transport: Arc<Transport>, tid: TransportId) {
        debug!("[{}] upgrade probe started on {}", self.id, transport.name());
        {
            let mut probe = self.probe.lock().unwrap();
            if let Some(old) = probe.take() {
                if let Some(keepalive) = old.keepalive {
                    keepalive.abort();
                }
                old.transport.discard();
                old.transport.shutdown();
            }
            *probe = Some(ProbeState {
                tid,
                transport,
                keepalive: None,
            });
        }

        let weak = Arc::downgrade(self);
        let timeout = self.config.upgrade_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(socket) = weak.upgrade() {
                socket.abort_probe("upgrade timeout");
            }
        });
        let mut timers = self.timers.lock().unwrap();
        if let Some(old) = timers.upgrade.replace(handle) {
            old.abort();
        }
    }

    async fn on_probe_event(self: &Arc<Self>, _tid: TransportId, event: TransportEvent) {
        match event {
            TransportEvent::Packet(packet) if packet.is_probe_ping() => {
                let transport = {
                    self.probe
                        .lock()
                        .unwrap()
                        .as_ref()
                        .map(|p| p.transport.clone())
                };
                let Some(transport) = transport else { return };
                let _ = transport.send(vec![Packet::pong_probe()]);
                self.upgrading.store(true, Ordering::SeqCst);

                // keep the old polling cycle alive with noops until the
                // peer commits to the new transport
                let weak = Arc::downgrade(self);
                let handle = tokio::spawn(async move {
                    let mut interval = tokio::time::interval(Duration::from_millis(100));
                    loop {
                        interval.tick().await;
                        let Some(socket) = weak.upgrade() else { break };
                        if !socket.upgrading.load(Ordering::SeqCst) {
                            break;
                        }
                        if let Some(current) = socket.current_transport() {
                            if current.writable() {
                                let _ = current.send(vec![Packet::noop()]);
                            }
                        }
                    }
                });
                if let Some(probe) = self.probe.lock().unwrap().as_mut() {
                    if let Some(old) = probe.keepalive.replace(handle) {
                        old.abort();
                    }
                }
            }
            TransportEvent::Packet(packet) if packet.packet_type == PacketType::Upgrade => {
                self.complete_upgrade();
            }
            TransportEvent::Packet(packet) => {
                debug!(
                    "[{}] unexpected {:?} packet during probe",
                    self.id, packet.packet_type
                );
                self.abort_probe("invalid probe packet");
            }
            TransportEvent::Drain => {}
            TransportEvent::Error(_) | TransportEvent::Close => {
                self.abort_probe("probe transport failed");
            }
        }
    }

    /// Swap the probe transport in as the active one and flush the queue
    fn complete_upgrade(self: &Arc<Self>) {
        let probe = self.probe.lock().unwrap().take();
        let Some(probe) = probe else { return };
        if let Some(keepalive) = probe.keepalive {
            keepalive.abort();
        }
        if let Some(timer) = self.timers.lock().unwrap().upgrade.take() {
            timer.abort();
        }

        let old = {
            let mut transport = self.transport.write().unwrap();
            transport.replace(probe.transport)
        };
        self.current_tid.store(probe.tid, Ordering::SeqCst);
        self.upgraded.store(true, Ordering::SeqCst);
        self.upgrading.store(false, Ordering::SeqCst);
        if let Some(old) = old {
            old.discard();
            old.shutdown();
        }
        debug!("[{}] transport upgraded", self.id);
        self.flush();
    }

    /// Drop the probe transport; the old transport stays authoritative
    fn abort_probe(self: &Arc<Self>, why: &str) {
        let probe = self.probe.lock().unwrap().take();
        if let Some(probe) = probe {
            debug!("[{}] upgrade aborted: {}", self.id, why);
            if let Some(keepalive) = probe.keepalive {
                keepalive.abort();
            }
            probe.transport.discard();
            probe.transport.shutdown();
        }
        if let Some(timer) = self.timers.lock().unwrap().upgrade.take() {
            timer.abort();
        }
        self.upgrading.store(false, Ordering::SeqCst);
        self.flush();
    }

    /// Close the connection and release every owned resource
    pub async fn close(self: &Arc<Self>, reason: CloseReason) {
        self.close_with(reason).await;
    }

    async fn close_with(self: &Arc<Self>, reason: CloseReason) {
        {
            let mut state = self.state.write().unwrap();
            if matches!(*state, ReadyState::Closing | ReadyState::Closed) {
                return;
            }
            *state = ReadyState::Closing;
        }
        debug!("[{}] connection closing: {}", self.id, reason.as_str());

        {
            let mut timers = self.timers.lock().unwrap();
            for timer in [
                timers.ping.take(),
                timers.ping_timeout.take(),
                timers.upgrade.take(),
            ]
            .into_iter()
            .flatten()
            {
                timer.abort();
            }
        }
        {
            let probe = self.probe.lock().unwrap().take();
            if let Some(probe) = probe {
                if let Some(keepalive) = probe.keepalive {
                    keepalive.abort();
                }
                probe.transport.discard();
                probe.transport.shutdown();
            }
        }
        if let Some(transport) = self.current_transport() {
            transport.shutdown();
        }
        *self.state.write().unwrap() = ReadyState::Closed;
        if let Some(server) = self.server.upgrade() {
            server.sockets.remove(&self.id);
        }
        self.handler.on_close(self.clone(), reason).await;
    }
}
