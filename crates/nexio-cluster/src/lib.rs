//! Cluster Adapter
//!
//! Extends the in-memory adapter with cross-process fan-out: broadcasts,
//! broadcast acknowledgements, and node counting are mirrored over a
//! pluggable inter-node message broker. Each node tags its messages with a
//! uid and drops echoes of its own publications.

pub mod messages;

pub use messages::{ClusterMessage, WireOptions, WirePacket};

use async_trait::async_trait;
use nexio::adapter::{MemoryAdapter, RecoveredSession};
use nexio::recovery::{RecoveryOptions, StoredSession};
use nexio::{
    Adapter, AdapterFactory, AckStreamItem, BroadcastError, BroadcastOptions, Namespace, Room, Sid,
};
use nexio_parser::Packet;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// How long a node waits for its peers when counting servers
const SERVER_COUNT_WINDOW: Duration = Duration::from_millis(200);

/// How long a pending remote ack request is kept before being dropped
const ACK_REQUEST_TTL: Duration = Duration::from_secs(30);

/// Broker failures
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("publish failed: {0}")]
    Publish(String),
}

/// The inter-node channel. Implementations deliver every published message
/// to every subscribed node, including the publisher.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, message: ClusterMessage) -> Result<(), BrokerError>;
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterMessage>;
}

/// In-process broker for tests and single-host multi-server setups
#[derive(Clone)]
pub struct LoopbackBroker {
    tx: broadcast::Sender<ClusterMessage>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for LoopbackBroker {
    async fn publish(&self, message: ClusterMessage) -> Result<(), BrokerError> {
        self.tx
            .send(message)
            .map(|_| ())
            .map_err(|err| BrokerError::Publish(err.to_string()))
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterMessage> {
        let mut source = self.tx.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("loopback broker dropped {} messages", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }
}

/// Adapter mirroring the in-memory room index with cross-node fan-out
pub struct ClusterAdapter {
    uid: String,
    nsp: Weak<Namespace>,
    local: MemoryAdapter,
    broker: Arc<dyn MessageBroker>,
    req_seq: AtomicU64,
    pending_acks: Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<AckStreamItem>>>>,
    pending_counts: Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<()>>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterAdapter {
    /// Factory wiring every namespace to the shared broker
    pub fn factory(
        broker: Arc<dyn MessageBroker>,
        recovery: Option<RecoveryOptions>,
    ) -> AdapterFactory {
        Arc::new(move |nsp: Weak<Namespace>| {
            let adapter = Arc::new(ClusterAdapter::new(
                nsp,
                broker.clone(),
                recovery.as_ref(),
            ));
            adapter.start();
            adapter
        })
    }

    pub fn new(
        nsp: Weak<Namespace>,
        broker: Arc<dyn MessageBroker>,
        recovery: Option<&RecoveryOptions>,
    ) -> Self {
        Self {
            uid: format!("{:016x}", rand::random::<u64>()),
            nsp: nsp.clone(),
            local: MemoryAdapter::new(nsp, recovery),
            broker,
            req_seq: AtomicU64::new(0),
            pending_acks: Arc::new(Mutex::new(HashMap::new())),
            pending_counts: Arc::new(Mutex::new(HashMap::new())),
            listener: Mutex::new(None),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    fn nsp_name(&self) -> Option<String> {
        self.nsp.upgrade().map(|nsp| nsp.name().to_string())
    }

    fn next_req_id(&self) -> u64 {
        self.req_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Start consuming the broker subscription
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut subscription = self.broker.subscribe();
        let handle = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                let Some(adapter) = weak.upgrade() else { break };
                adapter.on_message(message).await;
            }
        });
        *self.listener.lock().unwrap() = Some(handle);
    }

    async fn on_message(self: &Arc<Self>, message: ClusterMessage) {
        // never act on our own publications
        if message.origin() == self.uid {
            return;
        }
        let Some(nsp_name) = self.nsp_name() else {
            return;
        };
        if message.nsp() != nsp_name {
            return;
        }

        match message {
            ClusterMessage::Broadcast { packet, opts, origin, .. } => {
                trace!("[{}] remote broadcast from {}", self.uid, origin);
                match packet.decode() {
                    Ok(packet) => {
                        if let Err(err) = self.local.broadcast(packet, opts.into_options()).await {
                            debug!("[{}] remote broadcast failed: {}", self.uid, err);
                        }
                    }
                    Err(err) => debug!("[{}] undecodable remote packet: {}", self.uid, err),
                }
            }
            ClusterMessage::BroadcastWithAck {
                origin,
                req_id,
                packet,
                opts,
                ..
            } => {
                let packet = match packet.decode() {
                    Ok(packet) => packet,
                    Err(err) => {
                        debug!("[{}] undecodable remote packet: {}", self.uid, err);
                        return;
                    }
                };
                let stream = self
                    .local
                    .broadcast_with_ack(packet, opts.into_options())
                    .await;
                let mut stream = match stream {
                    Ok(stream) => stream,
                    Err(err) => {
                        debug!("[{}] remote ack broadcast failed: {}", self.uid, err);
                        return;
                    }
                };

                // stream our local results back to the requesting node
                let broker = self.broker.clone();
                let uid = self.uid.clone();
                let nsp = nsp_name.clone();
                tokio::spawn(async move {
                    while let Some(item) = stream.recv().await {
                        let message = match item {
                            AckStreamItem::ExpectedCount(count) => ClusterMessage::AckCount {
                                origin: uid.clone(),
                                nsp: nsp.clone(),
                                req_id,
                                requester: origin.clone(),
                                count,
                            },
                            AckStreamItem::Reply(reply) => ClusterMessage::AckReply {
                                origin: uid.clone(),
                                nsp: nsp.clone(),
                                req_id,
                                requester: origin.clone(),
                                reply,
                            },
                        };
                        if broker.publish(message).await.is_err() {
                            break;
                        }
                    }
                });
            }
            ClusterMessage::AckCount {
                req_id,
                requester,
                count,
                ..
            } => {
                if requester == self.uid {
                    if let Some(tx) = self.pending_acks.lock().unwrap().get(&req_id) {
                        let _ = tx.send(AckStreamItem::ExpectedCount(count));
                    }
                }
            }
            ClusterMessage::AckReply {
                req_id,
                requester,
                reply,
                ..
            } => {
                if requester == self.uid {
                    if let Some(tx) = self.pending_acks.lock().unwrap().get(&req_id) {
                        let _ = tx.send(AckStreamItem::Reply(reply));
                    }
                }
            }
            ClusterMessage::ServerCountRequest { origin, req_id, .. } => {
                let response = ClusterMessage::ServerCountResponse {
                    origin: self.uid.clone(),
                    nsp: nsp_name,
                    req_id,
                    requester: origin,
                };
                if let Err(err) = self.broker.publish(response).await {
                    debug!("[{}] server count response failed: {}", self.uid, err);
                }
            }
            ClusterMessage::ServerCountResponse { req_id, requester, .. } => {
                if requester == self.uid {
                    if let Some(tx) = self.pending_counts.lock().unwrap().get(&req_id) {
                        let _ = tx.send(());
                    }
                }
            }
        }
    }
}

impl Drop for ClusterAdapter {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().unwrap().take() {
            listener.abort();
        }
    }
}

#[async_trait]
impl Adapter for ClusterAdapter {
    fn add_all(&self, sid: &str, rooms: &[Room]) {
        self.local.add_all(sid, rooms);
    }

    fn del(&self, sid: &str, room: &str) {
        self.local.del(sid, room);
    }

    fn del_all(&self, sid: &str) {
        self.local.del_all(sid);
    }

    fn sockets(&self, opts: &BroadcastOptions) -> HashSet<Sid> {
        self.local.sockets(opts)
    }

    fn socket_rooms(&self, sid: &str) -> Option<HashSet<Room>> {
        self.local.socket_rooms(sid)
    }

    fn rooms(&self) -> Vec<Room> {
        self.local.rooms()
    }

    async fn broadcast(
        &self,
        packet: Packet,
        opts: BroadcastOptions,
    ) -> Result<(), BroadcastError> {
        if !opts.flags.local {
            let nsp = self.nsp_name().ok_or(BroadcastError::NamespaceGone)?;
            let encoded = packet.clone().encode()?;
            let message = ClusterMessage::Broadcast {
                origin: self.uid.clone(),
                nsp,
                packet: WirePacket::from_encoded(&encoded),
                opts: WireOptions::from_options(&opts),
            };
            self.broker
                .publish(message)
                .await
                .map_err(|err| BroadcastError::Broker(err.to_string()))?;
        }
        self.local.broadcast(packet, opts).await
    }

    async fn broadcast_with_ack(
        &self,
        packet: Packet,
        opts: BroadcastOptions,
    ) -> Result<mpsc::UnboundedReceiver<AckStreamItem>, BroadcastError> {
        let (tx, rx) = mpsc::unbounded_channel();

        if !opts.flags.local {
            let nsp = self.nsp_name().ok_or(BroadcastError::NamespaceGone)?;
            let req_id = self.next_req_id();
            self.pending_acks.lock().unwrap().insert(req_id, tx.clone());

            // drop the pending entry once nobody can still be waiting
            let pending = self.pending_acks.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ACK_REQUEST_TTL).await;
                pending.lock().unwrap().remove(&req_id);
            });

            let encoded = packet.clone().encode()?;
            let message = ClusterMessage::BroadcastWithAck {
                origin: self.uid.clone(),
                nsp,
                req_id,
                packet: WirePacket::from_encoded(&encoded),
                opts: WireOptions::from_options(&opts),
            };
            self.broker
                .publish(message)
                .await
                .map_err(|err| BroadcastError::Broker(err.to_string()))?;
        }

        let mut local_stream = self.local.broadcast_with_ack(packet, opts).await?;
        tokio::spawn(async move {
            while let Some(item) = local_stream.recv().await {
                if tx.send(item).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn server_count(&self) -> usize {
        let Some(nsp) = self.nsp_name() else { return 1 };
        let req_id = self.next_req_id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending_counts.lock().unwrap().insert(req_id, tx);

        let request = ClusterMessage::ServerCountRequest {
            origin: self.uid.clone(),
            nsp,
            req_id,
        };
        let mut count = 1;
        if self.broker.publish(request).await.is_ok() {
            let deadline = tokio::time::Instant::now() + SERVER_COUNT_WINDOW;
            while let Ok(Some(())) = tokio::time::timeout_at(deadline, rx.recv()).await {
                count += 1;
            }
        }
        self.pending_counts.lock().unwrap().remove(&req_id);
        count
    }

    fn persist_session(&self, session: StoredSession) {
        self.local.persist_session(session);
    }

    fn restore_session(&self, pid: &str, since: Option<u64>) -> Option<RecoveredSession> {
        self.local.restore_session(pid, since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{Request, StatusCode};
    use nexio::{Server, ServerOptions};
    use nexio_engine::OpenPacket;
    use nexio_parser::Data;

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

    async fn connect(server: &Server) -> String {
        let req = Request::builder()
            .method("GET")
            .uri("/nexio/?EIO=4&transport=polling")
            .body(Bytes::new())
            .unwrap();
        let res = server.engine().handle_request(req).await;
        let body = String::from_utf8(res.body().to_vec()).unwrap();
        let open: OpenPacket = serde_json::from_str(&body[1..]).unwrap();
        post(server, &open.sid, "40").await;
        let reply = poll(server, &open.sid).await;
        assert!(reply.starts_with("40{\"sid\":\""));
        open.sid
    }

    fn node(broker: &LoopbackBroker) -> Server {
        let mut opts = ServerOptions::default();
        opts.adapter = Some(ClusterAdapter::factory(Arc::new(broker.clone()), None));
        Server::new(opts)
    }

    #[tokio::test]
    async fn test_broadcast_crosses_nodes() {
        let broker = LoopbackBroker::new();
        let node_a = node(&broker);
        let node_b = node(&broker);

        let nsp_a = node_a.of("/");
        let nsp_b = node_b.of("/");
        let mut connections_a = nsp_a.connections();
        let mut connections_b = nsp_b.connections();

        let sid_a = connect(&node_a).await;
        let socket_a = connections_a.recv().await.unwrap();
        let sid_b = connect(&node_b).await;
        let socket_b = connections_b.recv().await.unwrap();

        socket_a.join(vec!["r1".to_string()]);
        socket_b.join(vec!["r1".to_string()]);

        nsp_a
            .to("r1")
            .emit("news", vec![Data::Text("flash".into())])
            .await
            .unwrap();

        // delivered on the emitting node and across the broker
        assert_eq!(poll(&node_a, &sid_a).await, r#"42["news","flash"]"#);
        assert_eq!(poll(&node_b, &sid_b).await, r#"42["news","flash"]"#);
    }

    #[tokio::test]
    async fn test_local_flag_stays_on_node() {
        let broker = LoopbackBroker::new();
        let node_a = node(&broker);
        let node_b = node(&broker);

        let nsp_a = node_a.of("/");
        let nsp_b = node_b.of("/");
        let mut connections_a = nsp_a.connections();
        let mut connections_b = nsp_b.connections();

        let sid_a = connect(&node_a).await;
        let socket_a = connections_a.recv().await.unwrap();
        let sid_b = connect(&node_b).await;
        let socket_b = connections_b.recv().await.unwrap();
        socket_a.join(vec!["r1".to_string()]);
        socket_b.join(vec!["r1".to_string()]);

        nsp_a
            .to("r1")
            .local()
            .emit("private", vec![])
            .await
            .unwrap();
        assert_eq!(poll(&node_a, &sid_a).await, r#"42["private"]"#);

        // the remote node saw nothing; a directed marker arrives first
        nsp_b.to("r1").local().emit("marker", vec![]).await.unwrap();
        assert_eq!(poll(&node_b, &sid_b).await, r#"42["marker"]"#);
    }

    #[tokio::test]
    async fn test_broadcast_with_ack_collects_across_nodes() {
        let broker = LoopbackBroker::new();
        let node_a = node(&broker);
        let node_b = node(&broker);

        let nsp_a = node_a.of("/");
        let mut connections_a = nsp_a.connections();
        let mut connections_b = node_b.of("/").connections();

        let sid_a = connect(&node_a).await;
        let _socket_a = connections_a.recv().await.unwrap();
        let sid_b = connect(&node_b).await;
        let _socket_b = connections_b.recv().await.unwrap();

        let node_a2 = node_a.clone();
        let node_b2 = node_b.clone();
        let responder = tokio::spawn(async move {
            for (server, sid) in [(node_a2, sid_a), (node_b2, sid_b)] {
                let body = poll(&server, &sid).await;
                let id: String = body
                    .chars()
                    .skip(2)
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                post(&server, &sid, &format!(r#"43{id}["pong"]"#)).await;
            }
        });

        let replies = nsp_a
            .broadcast()
            .timeout(Duration::from_secs(2))
            .emit_with_ack("poll", vec![])
            .await
            .unwrap();
        assert_eq!(replies.len(), 2);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_count_sees_peers() {
        let broker = LoopbackBroker::new();
        let node_a = node(&broker);
        let node_b = node(&broker);
        let _nsp_b = node_b.of("/");

        assert_eq!(node_a.of("/").adapter().server_count().await, 2);
    }

    #[tokio::test]
    async fn test_own_echo_is_ignored() {
        let broker = LoopbackBroker::new();
        let node_a = node(&broker);
        let nsp_a = node_a.of("/");
        let mut connections_a = nsp_a.connections();

        let sid_a = connect(&node_a).await;
        let socket_a = connections_a.recv().await.unwrap();
        socket_a.join(vec!["r1".to_string()]);

        nsp_a.to("r1").emit("once", vec![]).await.unwrap();
        socket_a.emit("marker", vec![]).unwrap();

        // exactly one delivery of the broadcast despite the loopback echo
        let body = poll(&node_a, &sid_a).await;
        let frames: Vec<&str> = body.split('\u{1e}').collect();
        assert_eq!(frames, vec![r#"42["once"]"#, r#"42["marker"]"#]);
    }
}
