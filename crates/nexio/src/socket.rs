//! Application-facing socket
//!
//! One socket is the pairing of one client connection with one namespace.
//! It exposes emit with optional acknowledgements, room membership, and a
//! typed event channel toward the application.

use crate::adapter::AckStreamItem;
use crate::client::Client;
use crate::error::{AckError, EmitError};
use crate::namespace::Namespace;
use crate::operator::BroadcastOperator;
use crate::recovery::StoredSession;
use crate::{Room, Sid};
use nexio_engine::CloseReason;
use nexio_parser::{Data, EncodedPacket, Packet, PacketType, RESERVED_EVENTS};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Why a socket disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    TransportError,
    TransportClose,
    ForcedClose,
    PingTimeout,
    ServerShuttingDown,
    ForcedServerClose,
    ServerNamespaceDisconnect,
    ClientNamespaceDisconnect,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::TransportClose => "transport close",
            DisconnectReason::ForcedClose => "forced close",
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::ServerShuttingDown => "server shutting down",
            DisconnectReason::ForcedServerClose => "forced server close",
            DisconnectReason::ServerNamespaceDisconnect => "server namespace disconnect",
            DisconnectReason::ClientNamespaceDisconnect => "client namespace disconnect",
        }
    }

    /// Whether a session disconnected for this reason may be recovered
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            DisconnectReason::TransportError
                | DisconnectReason::TransportClose
                | DisconnectReason::ForcedClose
                | DisconnectReason::PingTimeout
                | DisconnectReason::ServerShuttingDown
                | DisconnectReason::ForcedServerClose
        )
    }
}

impl From<CloseReason> for DisconnectReason {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::TransportError => DisconnectReason::TransportError,
            CloseReason::TransportClose => DisconnectReason::TransportClose,
            CloseReason::ForcedClose => DisconnectReason::ForcedClose,
            CloseReason::PingTimeout => DisconnectReason::PingTimeout,
            CloseReason::ServerShuttingDown => DisconnectReason::ServerShuttingDown,
        }
    }
}

/// Events delivered to the application through `Socket::events`
#[derive(Debug)]
pub enum SocketEvent {
    /// An incoming application event, with a responder when the peer
    /// requested an acknowledgement
    Event {
        name: String,
        args: Vec<Data>,
        ack: Option<AckResponder>,
    },
    Disconnect { reason: DisconnectReason },
}

/// One-shot responder for an event that carried an ack id
pub struct AckResponder {
    socket: Weak<Socket>,
    id: u64,
}

impl AckResponder {
    /// Send the acknowledgement payload back to the emitter
    pub fn send(self, args: Vec<Data>) -> Result<(), EmitError> {
        let socket = self.socket.upgrade().ok_or(EmitError::Disconnected)?;
        socket.ack_reply(self.id, args)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for AckResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckResponder").field("id", &self.id).finish()
    }
}

/// Connection metadata captured when the socket was established
#[derive(Debug, Clone)]
pub struct Handshake {
    pub auth: Option<Data>,
    pub url: String,
    pub user_agent: Option<String>,
    pub secure: bool,
    pub issued_ms: u64,
}

enum PendingAck {
    Single(oneshot::Sender<Result<Vec<Data>, AckError>>),
    Broadcast(mpsc::UnboundedSender<AckStreamItem>),
}

/// A socket: one client bound to one namespace
pub struct Socket {
    id: Sid,
    nsp: Arc<Namespace>,
    client: Arc<Client>,
    connected: AtomicBool,
    handshake: Handshake,
    acks: Mutex<HashMap<u64, PendingAck>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<SocketEvent>>>,
    pid: Mutex<Option<String>>,
    recovered: AtomicBool,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("nsp", &self.nsp.name())
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

impl Socket {
    pub(crate) fn new(
        id: Sid,
        nsp: Arc<Namespace>,
        client: Arc<Client>,
        auth: Option<Data>,
    ) -> Arc<Self> {
        let remote = client.conn().remote().clone();
        Arc::new(Self {
            id,
            nsp,
            client,
            connected: AtomicBool::new(false),
            handshake: Handshake {
                auth,
                url: remote.url,
                user_agent: remote.user_agent,
                secure: remote.secure,
                issued_ms: remote.issued_ms,
            },
            acks: Mutex::new(HashMap::new()),
            events_tx: Mutex::new(None),
            pid: Mutex::new(None),
            recovered: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &Sid {
        &self.id
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.nsp
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether this socket resumed a recovered session
    pub fn recovered(&self) -> bool {
        self.recovered.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<String> {
        self.pid.lock().unwrap().clone()
    }

    /// Subscribe to this socket's events. A later call replaces the
    /// previous subscriber.
    pub fn events(&self) -> mpsc::UnboundedReceiver<SocketEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events_tx.lock().unwrap() = Some(tx);
        rx
    }

    /// Rooms this socket is currently in
    pub fn rooms(&self) -> HashSet<Room> {
        self.nsp
            .adapter()
            .socket_rooms(&self.id)
            .unwrap_or_default()
    }

    /// Join rooms; joining a room twice is a no-op
    pub fn join(&self, rooms: Vec<Room>) {
        self.nsp.adapter().add_all(&self.id, &rooms);
    }

    /// Leave one room
    pub fn leave(&self, room: &str) {
        self.nsp.adapter().del(&self.id, room);
    }

    /// Emit an event to this socket's peer
    pub fn emit(&self, event: &str, args: Vec<Data>) -> Result<(), EmitError> {
        self.emit_inner(event, args, None)
    }

    /// `message` event sugar
    pub fn send(&self, args: Vec<Data>) -> Result<(), EmitError> {
        self.emit("message", args)
    }

    /// Emit and wait for the peer's acknowledgement.
    ///
    /// On timeout the pending entry is dropped and `AckError::Timeout` is
    /// returned; the connection itself stays open.
    pub async fn emit_with_ack(
        &self,
        event: &str,
        args: Vec<Data>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Data>, AckError> {
        let id = self.nsp.next_ack_id();
        let (tx, rx) = oneshot::channel();
        self.acks.lock().unwrap().insert(id, PendingAck::Single(tx));

        if let Err(err) = self.emit_inner(event, args, Some(id)) {
            self.acks.lock().unwrap().remove(&id);
            return Err(err.into());
        }

        match timeout {
            Some(window) => match tokio::time::timeout(window, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(AckError::SocketClosed),
                Err(_) => {
                    self.acks.lock().unwrap().remove(&id);
                    Err(AckError::Timeout)
                }
            },
            None => match rx.await {
                Ok(result) => result,
                Err(_) => Err(AckError::SocketClosed),
            },
        }
    }

    fn emit_inner(&self, event: &str, args: Vec<Data>, id: Option<u64>) -> Result<(), EmitError> {
        if !self.connected() {
            return Err(EmitError::Disconnected);
        }
        if RESERVED_EVENTS.contains(&event) {
            return Err(EmitError::ReservedEvent(event.to_string()));
        }
        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(Data::Text(event.to_string()));
        data.extend(args);

        let mut packet = Packet::event(self.nsp.name().to_string(), Data::Array(data));
        packet.id = id;
        self.client.send_packet(&packet)
    }

    /// Broadcast to the namespace, excluding this socket
    pub fn broadcast(self: &Arc<Self>) -> BroadcastOperator {
        BroadcastOperator::new(self.nsp.clone()).except(self.id.clone())
    }

    /// Target a room, excluding this socket
    pub fn to(self: &Arc<Self>, room: impl Into<Room>) -> BroadcastOperator {
        self.broadcast().to(room)
    }

    /// Exclude a room, excluding this socket as well
    pub fn except(self: &Arc<Self>, room: impl Into<Room>) -> BroadcastOperator {
        self.broadcast().except(room)
    }

    /// Disconnect this socket. With `close` the whole connection goes down;
    /// otherwise only this namespace is left.
    pub async fn disconnect(self: &Arc<Self>, close: bool) -> Result<(), EmitError> {
        if !self.connected() {
            return Err(EmitError::Disconnected);
        }
        if close {
            self.on_close(DisconnectReason::ForcedServerClose).await;
            self.client.close_connection().await;
        } else {
            let _ = self
                .client
                .send_packet(&Packet::disconnect(self.nsp.name().to_string()));
            self.on_close(DisconnectReason::ServerNamespaceDisconnect)
                .await;
        }
        Ok(())
    }

    // internal plumbing

    pub(crate) fn activate(&self, pid: Option<String>, recovered: bool) {
        self.connected.store(true, Ordering::SeqCst);
        *self.pid.lock().unwrap() = pid;
        self.recovered.store(recovered, Ordering::SeqCst);
    }

    pub(crate) async fn on_packet(self: &Arc<Self>, packet: Packet) {
        match packet.packet_type {
            PacketType::Event => self.on_event(packet),
            PacketType::Ack => self.on_ack(packet),
            PacketType::Disconnect => {
                self.on_close(DisconnectReason::ClientNamespaceDisconnect)
                    .await;
            }
            _ => {
                debug!(
                    "[{}] unexpected {:?} packet for connected socket",
                    self.id, packet.packet_type
                );
            }
        }
    }

    fn on_event(self: &Arc<Self>, packet: Packet) {
        let Some(Data::Array(mut items)) = packet.data else {
            return;
        };
        if items.is_empty() {
            return;
        }
        let name = match items.remove(0) {
            Data::Text(name) => name,
            Data::Number(n) => n.to_string(),
            _ => return,
        };
        let ack = packet.id.map(|id| AckResponder {
            socket: Arc::downgrade(self),
            id,
        });

        trace!("[{}] event '{}' received", self.id, name);
        let tx = self.events_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(SocketEvent::Event {
                name,
                args: items,
                ack,
            });
        }
    }

    fn on_ack(&self, packet: Packet) {
        let Some(id) = packet.id else {
            debug!("[{}] ack packet without id dropped", self.id);
            return;
        };
        let args = match packet.data {
            Some(Data::Array(items)) => items,
            _ => Vec::new(),
        };
        match self.acks.lock().unwrap().remove(&id) {
            Some(PendingAck::Single(tx)) => {
                let _ = tx.send(Ok(args));
            }
            Some(PendingAck::Broadcast(tx)) => {
                let _ = tx.send(AckStreamItem::Reply(args));
            }
            None => {
                // a late ack after a timeout, or a peer inventing ids
                debug!("[{}] unknown ack id {} dropped", self.id, id);
            }
        }
    }

    /// Answer an event's acknowledgement request
    pub(crate) fn ack_reply(&self, id: u64, args: Vec<Data>) -> Result<(), EmitError> {
        if !self.connected() {
            return Err(EmitError::Disconnected);
        }
        let packet = Packet::ack(self.nsp.name().to_string(), id, Data::Array(args));
        self.client.send_packet(&packet)
    }

    /// Hand an already-encoded broadcast packet to this socket's connection
    pub(crate) fn deliver_broadcast(&self, encoded: &EncodedPacket, volatile: bool) {
        if !self.connected() {
            return;
        }
        if let Err(err) = self.client.send_encoded(encoded, volatile) {
            debug!("[{}] broadcast delivery failed: {}", self.id, err);
        }
    }

    pub(crate) fn register_broadcast_ack(
        &self,
        id: u64,
        tx: mpsc::UnboundedSender<AckStreamItem>,
    ) {
        self.acks
            .lock()
            .unwrap()
            .insert(id, PendingAck::Broadcast(tx));
    }

    /// Tear the socket down: fail pending acks, leave every room, persist
    /// the session when the reason allows recovery, and notify the app.
    pub(crate) async fn on_close(self: &Arc<Self>, reason: DisconnectReason) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("[{}] socket disconnected: {}", self.id, reason.as_str());

        let pending: Vec<PendingAck> = {
            let mut acks = self.acks.lock().unwrap();
            acks.drain().map(|(_, ack)| ack).collect()
        };
        for ack in pending {
            if let PendingAck::Single(tx) = ack {
                let _ = tx.send(Err(AckError::SocketClosed));
            }
        }

        let adapter = self.nsp.adapter();
        let rooms: Vec<Room> = adapter
            .socket_rooms(&self.id)
            .map(|rooms| rooms.into_iter().collect())
            .unwrap_or_default();
        adapter.del_all(&self.id);

        let pid = self.pid.lock().unwrap().clone();
        if let Some(pid) = pid {
            if reason.is_recoverable() {
                adapter.persist_session(StoredSession {
                    sid: self.id.clone(),
                    pid,
                    rooms,
                    data: self.handshake.auth.clone(),
                    disconnected_at: Instant::now(),
                });
            }
        }

        self.nsp.remove_socket(&self.id);
        self.client.remove_socket(&self.id, self.nsp.name());

        let tx = self.events_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(SocketEvent::Disconnect { reason });
        }
    }
}
