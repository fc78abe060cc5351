//! Namespaces
//!
//! A namespace is a named partition of the multiplexing layer. It owns its
//! socket map, a sequential middleware chain, an adapter instance, and the
//! monotonic ack id counter shared by its sockets.

use crate::adapter::{Adapter, AdapterFactory};
use crate::client::Client;
use crate::error::{BroadcastError, ConnectDenial};
use crate::operator::BroadcastOperator;
use crate::server::ServerInner;
use crate::socket::Socket;
use crate::{Room, Sid};
use futures_util::future::BoxFuture;
use nexio_parser::{Data, Packet};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Connect-phase middleware. A rejection aborts the connection with a
/// `CONNECT_ERROR` packet carrying the denial payload.
pub type Middleware = Arc<
    dyn Fn(Arc<Socket>, Option<Data>) -> BoxFuture<'static, Result<(), ConnectDenial>>
        + Send
        + Sync,
>;

/// A named group of sockets with its own middleware chain and adapter
pub struct Namespace {
    name: String,
    server: Weak<ServerInner>,
    sockets: RwLock<HashMap<Sid, Arc<Socket>>>,
    adapter: Arc<dyn Adapter>,
    middlewares: RwLock<Vec<Middleware>>,
    ack_seq: AtomicU64,
    connection_tx: Mutex<Option<mpsc::UnboundedSender<Arc<Socket>>>>,
    dynamic: bool,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("sockets", &self.sockets_count())
            .field("dynamic", &self.dynamic)
            .finish()
    }
}

impl Namespace {
    pub(crate) fn new(
        name: String,
        server: Weak<ServerInner>,
        factory: &AdapterFactory,
        dynamic: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Namespace>| Self {
            name,
            server,
            sockets: RwLock::new(HashMap::new()),
            adapter: factory(weak.clone()),
            middlewares: RwLock::new(Vec::new()),
            ack_seq: AtomicU64::new(0),
            connection_tx: Mutex::new(None),
            dynamic,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn adapter(&self) -> Arc<dyn Adapter> {
        self.adapter.clone()
    }

    /// Append a middleware to the connect chain
    pub fn use_middleware(&self, middleware: Middleware) {
        self.middlewares.write().unwrap().push(middleware);
    }

    /// Subscribe to newly connected sockets. A later call replaces the
    /// previous subscriber.
    pub fn connections(&self) -> mpsc::UnboundedReceiver<Arc<Socket>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.connection_tx.lock().unwrap() = Some(tx);
        rx
    }

    pub fn sockets_count(&self) -> usize {
        self.sockets.read().unwrap().len()
    }

    /// Snapshot of the currently connected sockets
    pub fn fetch_sockets(&self) -> Vec<Arc<Socket>> {
        self.sockets.read().unwrap().values().cloned().collect()
    }

    pub(crate) fn socket(&self, sid: &str) -> Option<Arc<Socket>> {
        self.sockets.read().unwrap().get(sid).cloned()
    }

    pub(crate) fn next_ack_id(&self) -> u64 {
        self.ack_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Broadcast to every socket in the namespace
    pub fn broadcast(self: &Arc<Self>) -> BroadcastOperator {
        BroadcastOperator::new(self.clone())
    }

    /// Target a room
    pub fn to(self: &Arc<Self>, room: impl Into<Room>) -> BroadcastOperator {
        self.broadcast().to(room)
    }

    /// Alias of `to`
    pub fn in_(self: &Arc<Self>, room: impl Into<Room>) -> BroadcastOperator {
        self.to(room)
    }

    /// Exclude a room
    pub fn except(self: &Arc<Self>, room: impl Into<Room>) -> BroadcastOperator {
        self.broadcast().except(room)
    }

    /// Emit to the whole namespace
    pub async fn emit(self: &Arc<Self>, event: &str, args: Vec<Data>) -> Result<(), BroadcastError> {
        self.broadcast().emit(event, args).await
    }

    /// Disconnect every socket in the namespace
    pub async fn disconnect_sockets(self: &Arc<Self>, close: bool) {
        for socket in self.fetch_sockets() {
            let _ = socket.disconnect(close).await;
        }
    }

    /// Run the connect flow for a client entering this namespace
    pub(crate) async fn add(self: &Arc<Self>, client: &Arc<Client>, auth: Option<Data>) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let socket = Socket::new(
            server.next_socket_id(),
            self.clone(),
            client.clone(),
            auth.clone(),
        );
        client.set_connecting(self.name.clone(), socket.clone());

        let middlewares: Vec<Middleware> = self.middlewares.read().unwrap().clone();
        for middleware in middlewares {
            if let Err(denial) = middleware(socket.clone(), auth.clone()).await {
                client.clear_connecting(&self.name);
                debug!(
                    "[{}] connection to {} denied: {}",
                    client.id(),
                    self.name,
                    denial.message
                );
                let _ = client.send_packet(&Packet::connect_error(
                    self.name.clone(),
                    denial.to_payload(),
                ));
                return;
            }
        }

        // the connection may have died while middleware ran
        if client.closed() {
            client.clear_connecting(&self.name);
            return;
        }

        // a returning peer may present its recovery token and last offset
        let mut recovered_rooms: Vec<Room> = Vec::new();
        let mut missed: Vec<Packet> = Vec::new();
        let mut recovered = false;
        if server.recovery_enabled() {
            if let Some((pid, offset)) = recovery_request(&auth) {
                if let Some(restored) = self.adapter.restore_session(&pid, offset) {
                    trace!("[{}] session {} recovered", client.id(), restored.session.sid);
                    recovered_rooms = restored.session.rooms;
                    missed = restored.missed;
                    recovered = true;
                }
            }
        }
        let pid = if server.recovery_enabled() {
            Some(server.generate_pid())
        } else {
            None
        };

        socket.activate(pid.clone(), recovered);
        self.sockets
            .write()
            .unwrap()
            .insert(socket.id().clone(), socket.clone());

        // every socket lives in a room named after itself, for unicast
        let mut rooms = vec![socket.id().clone()];
        rooms.extend(recovered_rooms);
        self.adapter.add_all(socket.id(), &rooms);

        client.promote(&self.name, socket.clone());

        let mut payload = vec![("sid".to_string(), Data::Text(socket.id().clone()))];
        if let Some(pid) = &pid {
            payload.push(("pid".to_string(), Data::Text(pid.clone())));
        }
        let _ = client.send_packet(&Packet::connect(
            self.name.clone(),
            Some(Data::Object(payload)),
        ));

        for packet in missed {
            if let Ok(encoded) = packet.encode() {
                let _ = client.send_encoded(&encoded, false);
            }
        }

        debug!(
            "[{}] socket {} connected to {}",
            client.id(),
            socket.id(),
            self.name
        );
        let tx = self.connection_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(socket);
        }
    }

    pub(crate) fn remove_socket(&self, sid: &str) {
        let empty = {
            let mut sockets = self.sockets.write().unwrap();
            sockets.remove(sid);
            sockets.is_empty()
        };
        if empty && self.dynamic {
            if let Some(server) = self.server.upgrade() {
                server.cleanup_namespace(&self.name);
            }
        }
    }
}

fn recovery_request(auth: &Option<Data>) -> Option<(String, Option<u64>)> {
    let auth = auth.as_ref()?;
    let pid = auth.get("pid")?.as_str()?.to_string();
    let offset = auth
        .get("offset")
        .and_then(|value| value.as_str())
        .and_then(|value| value.parse().ok());
    Some((pid, offset))
}
