//! Multiplexing server
//!
//! Owns the namespace registry and the dynamic-namespace predicate chain,
//! and bridges the engine's connection events into clients.

use crate::adapter::{AdapterFactory, MemoryAdapter};
use crate::client::Client;
use crate::namespace::Namespace;
use crate::recovery::RecoveryOptions;
use crate::Sid;
use async_trait::async_trait;
use dashmap::DashMap;
use nexio_engine::{
    sid, CloseReason, EngineConfig, EngineServer, Handler as EngineHandler,
    Message as EngineMessage, Socket as Connection,
};
use nexio_parser::Data;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tracing::debug;

/// Accepts or rejects the dynamic creation of an unknown namespace.
/// The first predicate to accept wins.
pub type NamespacePredicate = Arc<dyn Fn(&str, Option<&Data>) -> bool + Send + Sync>;

/// Server configuration
#[derive(Clone)]
pub struct ServerOptions {
    pub engine: EngineConfig,
    /// How long a connection may stay outside every namespace
    pub connect_timeout: Duration,
    /// Enables connection state recovery when set
    pub recovery: Option<RecoveryOptions>,
    /// Adapter factory; defaults to the in-memory adapter
    pub adapter: Option<AdapterFactory>,
    /// Drop dynamically created namespaces once they become empty
    pub cleanup_empty_child_namespaces: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            connect_timeout: Duration::from_secs(45),
            recovery: None,
            adapter: None,
            cleanup_empty_child_namespaces: false,
        }
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("engine", &self.engine)
            .field("connect_timeout", &self.connect_timeout)
            .field("recovery", &self.recovery)
            .field("adapter", &self.adapter.is_some())
            .field(
                "cleanup_empty_child_namespaces",
                &self.cleanup_empty_child_namespaces,
            )
            .finish()
    }
}

pub(crate) struct ServerInner {
    opts: ServerOptions,
    engine: EngineServer,
    nsps: DashMap<String, Arc<Namespace>>,
    predicates: RwLock<Vec<NamespacePredicate>>,
    clients: DashMap<String, Arc<Client>>,
    socket_seq: AtomicU64,
    pid_seq: AtomicU64,
    adapter_factory: AdapterFactory,
}

impl ServerInner {
    pub(crate) fn next_socket_id(&self) -> Sid {
        sid::generate(self.socket_seq.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn generate_pid(&self) -> String {
        sid::generate(self.pid_seq.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn recovery_enabled(&self) -> bool {
        self.opts.recovery.is_some()
    }

    /// Resolve a namespace: exact match first, then the predicate chain
    pub(crate) fn namespace_for(
        self: &Arc<Self>,
        name: &str,
        auth: Option<&Data>,
    ) -> Option<Arc<Namespace>> {
        if let Some(nsp) = self.nsps.get(name) {
            return Some(nsp.value().clone());
        }
        let accepted = self
            .predicates
            .read()
            .unwrap()
            .iter()
            .any(|predicate| predicate(name, auth));
        if accepted {
            debug!("dynamically creating namespace {}", name);
            Some(self.get_or_create(name.to_string(), true))
        } else {
            None
        }
    }

    fn get_or_create(self: &Arc<Self>, name: String, dynamic: bool) -> Arc<Namespace> {
        self.nsps
            .entry(name.clone())
            .or_insert_with(|| {
                Namespace::new(
                    name,
                    Arc::downgrade(self),
                    &self.adapter_factory,
                    dynamic,
                )
            })
            .value()
            .clone()
    }

    pub(crate) fn cleanup_namespace(&self, name: &str) {
        if self.opts.cleanup_empty_child_namespaces {
            debug!("removing empty dynamic namespace {}", name);
            self.nsps.remove(name);
        }
    }
}

struct EngineBridge {
    server: Weak<ServerInner>,
}

#[async_trait]
impl EngineHandler for EngineBridge {
    async fn on_connect(&self, socket: Arc<Connection>) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let client = Client::new(
            socket.clone(),
            self.server.clone(),
            server.opts.connect_timeout,
        );
        server.clients.insert(socket.id().to_string(), client);
    }

    async fn on_message(&self, socket: Arc<Connection>, message: EngineMessage) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let client = server
            .clients
            .get(socket.id())
            .map(|entry| entry.value().clone());
        if let Some(client) = client {
            client.on_data(message).await;
        }
    }

    async fn on_close(&self, socket: Arc<Connection>, reason: CloseReason) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        if let Some((_, client)) = server.clients.remove(socket.id()) {
            client.on_engine_close(reason).await;
        }
    }
}

/// The multiplexing server
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(opts: ServerOptions) -> Self {
        let adapter_factory = opts
            .adapter
            .clone()
            .unwrap_or_else(|| MemoryAdapter::factory(opts.recovery.clone()));
        let inner = Arc::new_cyclic(|weak: &Weak<ServerInner>| {
            let engine = EngineServer::new(
                opts.engine.clone(),
                Arc::new(EngineBridge {
                    server: weak.clone(),
                }),
            );
            ServerInner {
                opts,
                engine,
                nsps: DashMap::new(),
                predicates: RwLock::new(Vec::new()),
                clients: DashMap::new(),
                socket_seq: AtomicU64::new(0),
                pid_seq: AtomicU64::new(0),
                adapter_factory,
            }
        });
        let server = Self { inner };
        // the default namespace always exists
        server.of("/");
        server
    }

    /// The engine server, for wiring into the HTTP layer
    pub fn engine(&self) -> &EngineServer {
        &self.inner.engine
    }

    /// Get or create a namespace
    pub fn of(&self, name: &str) -> Arc<Namespace> {
        self.inner.get_or_create(normalize(name), false)
    }

    /// Register a dynamic-namespace predicate
    pub fn register_namespace_predicate(&self, predicate: NamespacePredicate) {
        self.inner.predicates.write().unwrap().push(predicate);
    }

    pub fn namespaces(&self) -> Vec<Arc<Namespace>> {
        self.inner
            .nsps
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of live clients
    pub fn clients_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Shut the server down, disconnecting every connection
    pub async fn close(&self) {
        self.inner.engine.close().await;
    }
}

fn normalize(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectDenial;
    use crate::socket::{DisconnectReason, SocketEvent};
    use bytes::Bytes;
    use http::{Request, StatusCode};
    use nexio_engine::OpenPacket;

    fn text_data(value: &str) -> Data {
        Data::Text(value.to_string())
    }

    async fn poll(server: &Server, sid: &str) -> String {
        let req = Request::builder()
            .method("GET")
            .uri(format!("/nexio/?EIO=4&transport=polling&sid={sid}"))
            .body(Bytes::new())
            .unwrap();
        let res = server.engine().handle_request(req).await;
        assert_eq!(res.status(), StatusCode::OK);
        String::from_utf8(res.body().to_vec()).unwrap()
    }

    async fn post(server: &Server, sid: &str, body: &str) {
        let req = Request::builder()
            .method("POST")
            .uri(format!("/nexio/?EIO=4&transport=polling&sid={sid}"))
            .body(Bytes::from(body.to_string()))
            .unwrap();
        let res = server.engine().handle_request(req).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    /// Engine handshake over polling; returns the session id
    async fn engine_handshake(server: &Server) -> String {
        let req = Request::builder()
            .method("GET")
            .uri("/nexio/?EIO=4&transport=polling")
            .body(Bytes::new())
            .unwrap();
        let res = server.engine().handle_request(req).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = String::from_utf8(res.body().to_vec()).unwrap();
        let open: OpenPacket = serde_json::from_str(&body[1..]).unwrap();
        open.sid
    }

    /// Full connect to a namespace; returns (engine sid, connect reply body)
    async fn connect(server: &Server, nsp: &str) -> (String, String) {
        let sid = engine_handshake(server).await;
        let connect_frame = if nsp == "/" {
            "40".to_string()
        } else {
            format!("40{nsp},")
        };
        post(server, &sid, &connect_frame).await;
        let reply = poll(server, &sid).await;
        (sid, reply)
    }

    #[tokio::test]
    async fn test_connect_to_default_namespace() {
        let server = Server::new(ServerOptions::default());
        let mut connections = server.of("/").connections();

        let (_sid, reply) = connect(&server, "/").await;
        assert!(reply.starts_with("40{\"sid\":\""), "unexpected reply: {reply}");

        let socket = connections.recv().await.unwrap();
        assert!(socket.connected());
        assert_eq!(socket.namespace().name(), "/");
        // every socket joins a room named after itself
        assert!(socket.rooms().contains(socket.id()));
    }

    #[tokio::test]
    async fn test_connect_to_unknown_namespace_is_rejected() {
        let server = Server::new(ServerOptions::default());
        let sid = engine_handshake(&server).await;
        post(&server, &sid, "40/nowhere,").await;
        let reply = poll(&server, &sid).await;
        assert!(
            reply.starts_with("44/nowhere,"),
            "unexpected reply: {reply}"
        );
        assert!(reply.contains("Invalid namespace"));
    }

    #[tokio::test]
    async fn test_dynamic_namespace_predicate() {
        let server = Server::new(ServerOptions::default());
        server.register_namespace_predicate(Arc::new(|name, _auth| name.starts_with("/room-")));

        let (_sid, reply) = connect(&server, "/room-42").await;
        assert!(reply.starts_with("40/room-42,"), "unexpected reply: {reply}");
        assert!(server
            .namespaces()
            .iter()
            .any(|nsp| nsp.name() == "/room-42"));

        // non-matching namespaces still fail
        let sid = engine_handshake(&server).await;
        post(&server, &sid, "40/other,").await;
        let reply = poll(&server, &sid).await;
        assert!(reply.starts_with("44/other,"));
    }

    #[tokio::test]
    async fn test_event_with_ack_scenario() {
        // client connects via polling, emits with ack id 0, server acks
        let server = Server::new(ServerOptions::default());
        let mut connections = server.of("/").connections();
        let (sid, _reply) = connect(&server, "/").await;
        let socket = connections.recv().await.unwrap();
        let mut events = socket.events();

        post(&server, &sid, r#"420["chat","hi"]"#).await;
        match events.recv().await.unwrap() {
            SocketEvent::Event { name, args, ack } => {
                assert_eq!(name, "chat");
                assert_eq!(args, vec![text_data("hi")]);
                ack.unwrap().send(vec![text_data("ok")]).unwrap();
            }
            other => panic!("expected event, got {other:?}"),
        }

        let reply = poll(&server, &sid).await;
        assert_eq!(reply, r#"430["ok"]"#);
    }

    #[tokio::test]
    async fn test_room_broadcast_reaches_members_only() {
        let server = Server::new(ServerOptions::default());
        let nsp = server.of("/");
        let mut connections = nsp.connections();

        let (sid_a, _) = connect(&server, "/").await;
        let socket_a = connections.recv().await.unwrap();
        let (sid_b, _) = connect(&server, "/").await;
        let socket_b = connections.recv().await.unwrap();
        let (sid_c, _) = connect(&server, "/").await;
        let _socket_c = connections.recv().await.unwrap();

        socket_a.join(vec!["r1".to_string()]);
        socket_b.join(vec!["r1".to_string()]);

        nsp.to("r1")
            .emit("news", vec![text_data("flash")])
            .await
            .unwrap();

        assert_eq!(poll(&server, &sid_a).await, r#"42["news","flash"]"#);
        assert_eq!(poll(&server, &sid_b).await, r#"42["news","flash"]"#);
        // the third socket gets nothing but the next heartbeat; verify by
        // sending it a directed event instead and seeing only that
        nsp.to(sid_of(&_socket_c))
            .emit("direct", vec![])
            .await
            .unwrap();
        assert_eq!(poll(&server, &sid_c).await, r#"42["direct"]"#);
    }

    fn sid_of(socket: &Arc<crate::socket::Socket>) -> String {
        socket.id().clone()
    }

    #[tokio::test]
    async fn test_broadcast_union_minus_except() {
        let server = Server::new(ServerOptions::default());
        let nsp = server.of("/");
        let mut connections = nsp.connections();

        let (sid_a, _) = connect(&server, "/").await;
        let socket_a = connections.recv().await.unwrap();
        let (_sid_b, _) = connect(&server, "/").await;
        let socket_b = connections.recv().await.unwrap();
        let (_sid_c, _) = connect(&server, "/").await;
        let socket_c = connections.recv().await.unwrap();

        // a in A; b in A and B; c in B
        socket_a.join(vec!["A".to_string()]);
        socket_b.join(vec!["A".to_string(), "B".to_string()]);
        socket_c.join(vec!["B".to_string()]);

        let operator = nsp.to("A").to("B").except("B");
        let targets = operator.sockets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id(), socket_a.id());

        operator.emit("only-a", vec![]).await.unwrap();
        assert_eq!(poll(&server, &sid_a).await, r#"42["only-a"]"#);
    }

    #[tokio::test]
    async fn test_duplicate_membership_delivers_once() {
        let server = Server::new(ServerOptions::default());
        let nsp = server.of("/");
        let mut connections = nsp.connections();

        let (sid_a, _) = connect(&server, "/").await;
        let socket_a = connections.recv().await.unwrap();
        socket_a.join(vec!["A".to_string(), "B".to_string()]);

        // present in both target rooms, still exactly one delivery
        nsp.to("A").to("B").emit("once", vec![]).await.unwrap();
        socket_a.emit("marker", vec![]).unwrap();
        let body = poll(&server, &sid_a).await;
        let frames: Vec<&str> = body.split('\u{1e}').collect();
        assert_eq!(frames[0], r#"42["once"]"#);
        assert_eq!(frames[1], r#"42["marker"]"#);
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let server = Server::new(ServerOptions::default());
        let nsp = server.of("/");
        let mut connections = nsp.connections();
        let (_sid, _) = connect(&server, "/").await;
        let socket = connections.recv().await.unwrap();

        socket.join(vec!["r1".to_string()]);
        let once = socket.rooms();
        socket.join(vec!["r1".to_string()]);
        assert_eq!(socket.rooms(), once);

        let members = nsp.adapter().sockets(&crate::BroadcastOptions {
            rooms: ["r1".to_string()].into_iter().collect(),
            ..Default::default()
        });
        assert_eq!(members.len(), 1);
    }

    #[tokio::test]
    async fn test_middleware_denial_sends_connect_error() {
        let server = Server::new(ServerOptions::default());
        let nsp = server.of("/guarded");
        nsp.use_middleware(Arc::new(|_socket, auth| {
            Box::pin(async move {
                match auth.as_ref().and_then(|a| a.get("token")) {
                    Some(_) => Ok(()),
                    None => Err(ConnectDenial::new("missing token")
                        .with_data(text_data("auth required"))),
                }
            })
        }));

        let sid = engine_handshake(&server).await;
        post(&server, &sid, "40/guarded,").await;
        let reply = poll(&server, &sid).await;
        assert!(reply.starts_with("44/guarded,"), "unexpected reply: {reply}");
        assert!(reply.contains("missing token"));
        assert!(reply.contains("auth required"));
        assert_eq!(nsp.sockets_count(), 0);

        // with auth it goes through
        post(&server, &sid, r#"40/guarded,{"token":"abc"}"#).await;
        let reply = poll(&server, &sid).await;
        assert!(reply.starts_with("40/guarded,"), "unexpected reply: {reply}");
    }

    #[tokio::test]
    async fn test_emit_with_ack_timeout_keeps_socket_open() {
        let server = Server::new(ServerOptions::default());
        let mut connections = server.of("/").connections();
        let (_sid, _) = connect(&server, "/").await;
        let socket = connections.recv().await.unwrap();

        let err = socket
            .emit_with_ack(
                "question",
                vec![],
                Some(Duration::from_millis(30)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::AckError::Timeout));
        assert!(socket.connected());
    }

    #[tokio::test]
    async fn test_emit_with_ack_resolves() {
        let server = Server::new(ServerOptions::default());
        let mut connections = server.of("/").connections();
        let (sid, _) = connect(&server, "/").await;
        let socket = connections.recv().await.unwrap();

        let server2 = server.clone();
        let sid2 = sid.clone();
        let responder = tokio::spawn(async move {
            // the emitted event shows up on the wire with ack id 0
            let body = poll(&server2, &sid2).await;
            assert_eq!(body, r#"420["question","?"]"#);
            post(&server2, &sid2, r#"430["answer"]"#).await;
        });

        let reply = socket
            .emit_with_ack(
                "question",
                vec![text_data("?")],
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert_eq!(reply, vec![text_data("answer")]);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_with_ack_collects_replies() {
        let server = Server::new(ServerOptions::default());
        let nsp = server.of("/");
        let mut connections = nsp.connections();

        let (sid_a, _) = connect(&server, "/").await;
        let _socket_a = connections.recv().await.unwrap();
        let (sid_b, _) = connect(&server, "/").await;
        let _socket_b = connections.recv().await.unwrap();

        let server2 = server.clone();
        let responder = tokio::spawn(async move {
            for sid in [sid_a, sid_b] {
                let body = poll(&server2, &sid).await;
                // frame looks like 42<id>["poll"]; echo the id back
                let id: String = body
                    .chars()
                    .skip(2)
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                post(&server2, &sid, &format!(r#"43{id}["pong"]"#)).await;
            }
        });

        let replies = nsp
            .broadcast()
            .timeout(Duration::from_secs(2))
            .emit_with_ack("poll", vec![])
            .await
            .unwrap();
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|r| r == &vec![text_data("pong")]));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_namespace_disconnect() {
        let server = Server::new(ServerOptions::default());
        let nsp = server.of("/");
        let mut connections = nsp.connections();
        let (sid, _) = connect(&server, "/").await;
        let socket = connections.recv().await.unwrap();
        let mut events = socket.events();

        post(&server, &sid, "41").await;
        match events.recv().await.unwrap() {
            SocketEvent::Disconnect { reason } => {
                assert_eq!(reason, DisconnectReason::ClientNamespaceDisconnect);
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
        assert!(!socket.connected());
        assert_eq!(nsp.sockets_count(), 0);
        // rooms are left before the socket is gone
        assert!(socket.rooms().is_empty());
    }

    #[tokio::test]
    async fn test_server_close_cascades() {
        let server = Server::new(ServerOptions::default());
        let nsp = server.of("/");
        let mut connections = nsp.connections();
        let (_sid, _) = connect(&server, "/").await;
        let socket = connections.recv().await.unwrap();
        let mut events = socket.events();

        server.close().await;
        match events.recv().await.unwrap() {
            SocketEvent::Disconnect { reason } => {
                assert_eq!(reason, DisconnectReason::ServerShuttingDown);
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_binary_event_roundtrip() {
        let server = Server::new(ServerOptions::default());
        let mut connections = server.of("/").connections();
        let (sid, _) = connect(&server, "/").await;
        let socket = connections.recv().await.unwrap();
        let mut events = socket.events();

        // binary event: header then one base64 attachment frame
        post(
            &server,
            &sid,
            "451-[\"upload\",{\"_placeholder\":true,\"num\":0}]\u{1e}bAQID",
        )
        .await;
        match events.recv().await.unwrap() {
            SocketEvent::Event { name, args, .. } => {
                assert_eq!(name, "upload");
                assert_eq!(args, vec![Data::Binary(Bytes::from_static(b"\x01\x02\x03"))]);
            }
            other => panic!("expected event, got {other:?}"),
        }

        // and back out
        socket
            .emit(
                "download",
                vec![Data::Binary(Bytes::from_static(b"\x04\x05"))],
            )
            .unwrap();
        let body = poll(&server, &sid).await;
        let frames: Vec<&str> = body.split('\u{1e}').collect();
        assert_eq!(
            frames[0],
            r#"451-["download",{"_placeholder":true,"num":0}]"#
        );
        assert_eq!(frames[1], "bBAU=");
    }

    #[tokio::test]
    async fn test_connection_state_recovery() {
        let mut opts = ServerOptions::default();
        opts.recovery = Some(RecoveryOptions::default());
        let server = Server::new(opts);
        let nsp = server.of("/");
        let mut connections = nsp.connections();

        let (sid, reply) = connect(&server, "/").await;
        assert!(reply.contains("\"pid\":\""), "no pid in reply: {reply}");
        let pid = extract_json_field(&reply, "pid");
        let socket = connections.recv().await.unwrap();
        socket.join(vec!["r1".to_string()]);

        // one broadcast observed before the drop, one missed after it
        nsp.to("r1").emit("seen", vec![]).await.unwrap();
        let body = poll(&server, &sid).await;
        // recovery appends the packet offset to the data array
        assert!(body.starts_with(r#"42["seen","#), "unexpected body: {body}");
        let offset = body
            .trim_end_matches(']')
            .rsplit('"')
            .nth(1)
            .unwrap()
            .to_string();

        // the connection dies recoverably
        socket.client().conn().close(CloseReason::TransportError).await;
        assert!(!socket.connected());

        nsp.to("r1").emit("missed", vec![]).await.unwrap();

        // reconnect presenting the recovery token and last seen offset
        let sid2 = engine_handshake(&server).await;
        post(
            &server,
            &sid2,
            &format!(r#"40{{"pid":"{pid}","offset":"{offset}"}}"#),
        )
        .await;
        let reply = poll(&server, &sid2).await;
        let frames: Vec<&str> = reply.split('\u{1e}').collect();
        assert!(frames[0].starts_with("40{\"sid\":\""));
        assert!(
            frames[1].starts_with(r#"42["missed","#),
            "missed packet not replayed: {frames:?}"
        );

        let restored = connections.recv().await.unwrap();
        assert!(restored.recovered());
        assert!(restored.rooms().contains("r1"));
    }

    fn extract_json_field(frame: &str, field: &str) -> String {
        let marker = format!("\"{field}\":\"");
        let start = frame.find(&marker).unwrap() + marker.len();
        frame[start..]
            .chars()
            .take_while(|c| *c != '"')
            .collect()
    }
}
