//! Per-connection client
//!
//! Wraps one engine connection, decodes its multiplexing packets, and routes
//! them to the socket bound to each namespace. A connection that never joins
//! a namespace within the connect timeout is dropped.

use crate::server::ServerInner;
use crate::socket::{DisconnectReason, Socket};
use crate::Sid;
use crate::error::EmitError;
use nexio_engine::packet::EncodedFrame;
use nexio_engine::{
    CloseReason, Message as EngineMessage, Packet as EnginePacket, ProtocolVersion, ReadyState,
    Socket as Connection,
};
use nexio_parser::{Data, Decoder, EncodedPacket, Packet, PacketType};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// One engine connection on the multiplexing layer
pub struct Client {
    conn: Arc<Connection>,
    server: Weak<ServerInner>,
    decoder: Mutex<Decoder>,
    /// Connected sockets by socket id
    sockets: RwLock<HashMap<Sid, Arc<Socket>>>,
    /// Connected sockets by namespace name
    nsp_sockets: RwLock<HashMap<String, Arc<Socket>>>,
    /// Sockets still in the connect-middleware phase
    connecting: RwLock<HashMap<String, Arc<Socket>>>,
    connect_timer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.conn.id())
            .finish()
    }
}

impl Client {
    pub(crate) fn new(
        conn: Arc<Connection>,
        server: Weak<ServerInner>,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            conn,
            server,
            decoder: Mutex::new(Decoder::new()),
            sockets: RwLock::new(HashMap::new()),
            nsp_sockets: RwLock::new(HashMap::new()),
            connecting: RwLock::new(HashMap::new()),
            connect_timer: Mutex::new(None),
        });

        // peers must enter a namespace within the window or be dropped
        let weak = Arc::downgrade(&client);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(connect_timeout).await;
            if let Some(client) = weak.upgrade() {
                let idle = client.sockets.read().unwrap().is_empty()
                    && client.connecting.read().unwrap().is_empty();
                if idle {
                    debug!("[{}] no namespace joined in time, closing", client.id());
                    client.conn.close(CloseReason::ForcedClose).await;
                }
            }
        });
        *client.connect_timer.lock().unwrap() = Some(handle);
        client
    }

    pub fn id(&self) -> &str {
        self.conn.id()
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub(crate) fn closed(&self) -> bool {
        matches!(self.conn.state(), ReadyState::Closing | ReadyState::Closed)
    }

    /// Force the underlying connection down
    pub(crate) async fn close_connection(&self) {
        self.conn.close(CloseReason::ForcedClose).await;
    }

    /// Feed one engine message through the decoder
    pub(crate) async fn on_data(self: &Arc<Self>, message: EngineMessage) {
        let result = {
            let mut decoder = self.decoder.lock().unwrap();
            match message {
                EngineMessage::Text(text) => decoder.decode_text(&text),
                EngineMessage::Binary(data) => decoder.decode_binary(data),
            }
        };
        match result {
            Ok(Some(packet)) => self.on_packet(packet).await,
            Ok(None) => {} // awaiting binary attachments
            Err(err) => {
                debug!("[{}] decode error: {}", self.id(), err);
                self.conn.close(CloseReason::ForcedClose).await;
            }
        }
    }

    async fn on_packet(self: &Arc<Self>, packet: Packet) {
        if packet.packet_type == PacketType::Connect {
            self.connect(packet.nsp, packet.data).await;
            return;
        }
        let socket = self.nsp_sockets.read().unwrap().get(&packet.nsp).cloned();
        match socket {
            Some(socket) => socket.on_packet(packet).await,
            None => {
                trace!(
                    "[{}] packet for unjoined namespace {} dropped",
                    self.id(),
                    packet.nsp
                );
            }
        }
    }

    async fn connect(self: &Arc<Self>, name: String, auth: Option<Data>) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        // v3 peers pass auth as a query string appended to the namespace
        let (name, auth) = if self.conn.protocol() == ProtocolVersion::V3 {
            split_v3_namespace(name, auth)
        } else {
            (name, auth)
        };

        match server.namespace_for(&name, auth.as_ref()) {
            Some(nsp) => nsp.add(self, auth).await,
            None => {
                debug!("[{}] connect to unknown namespace {}", self.id(), name);
                let _ = self.send_packet(&Packet::connect_error(
                    name,
                    Data::Object(vec![(
                        "message".to_string(),
                        Data::Text("Invalid namespace".to_string()),
                    )]),
                ));
            }
        }
    }

    /// Encode and send one packet over the connection
    pub(crate) fn send_packet(&self, packet: &Packet) -> Result<(), EmitError> {
        let encoded = packet.clone().encode()?;
        self.send_encoded(&encoded, false)
    }

    /// Send a packet that was encoded once for fan-out
    pub(crate) fn send_encoded(
        &self,
        encoded: &EncodedPacket,
        volatile: bool,
    ) -> Result<(), EmitError> {
        if volatile {
            self.conn
                .send_volatile(EnginePacket::message(encoded.head.clone()));
            for attachment in &encoded.attachments {
                self.conn
                    .send_volatile(EnginePacket::binary(attachment.clone()));
            }
            return Ok(());
        }

        // fast path: pre-encoded frames straight to a binary-capable transport
        let mut frames = Vec::with_capacity(1 + encoded.attachments.len());
        frames.push(EncodedFrame::Text(
            EnginePacket::message(encoded.head.clone()).encode_text(),
        ));
        for attachment in &encoded.attachments {
            frames.push(EncodedFrame::Binary(attachment.clone()));
        }
        if self.conn.send_prepared(frames) {
            return Ok(());
        }

        self.conn.send(EnginePacket::message(encoded.head.clone()))?;
        for attachment in &encoded.attachments {
            self.conn.send(EnginePacket::binary(attachment.clone()))?;
        }
        Ok(())
    }

    pub(crate) fn set_connecting(&self, nsp: String, socket: Arc<Socket>) {
        self.connecting.write().unwrap().insert(nsp, socket);
    }

    pub(crate) fn clear_connecting(&self, nsp: &str) {
        self.connecting.write().unwrap().remove(nsp);
    }

    /// Move a socket out of the middleware phase into the active maps
    pub(crate) fn promote(&self, nsp: &str, socket: Arc<Socket>) {
        self.connecting.write().unwrap().remove(nsp);
        self.sockets
            .write()
            .unwrap()
            .insert(socket.id().clone(), socket.clone());
        self.nsp_sockets
            .write()
            .unwrap()
            .insert(nsp.to_string(), socket);
        if let Some(timer) = self.connect_timer.lock().unwrap().take() {
            timer.abort();
        }
    }

    pub(crate) fn remove_socket(&self, sid: &str, nsp: &str) {
        self.sockets.write().unwrap().remove(sid);
        self.nsp_sockets.write().unwrap().remove(nsp);
    }

    /// The engine connection closed: cascade to every owned socket
    pub(crate) async fn on_engine_close(self: &Arc<Self>, reason: CloseReason) {
        if let Some(timer) = self.connect_timer.lock().unwrap().take() {
            timer.abort();
        }
        self.decoder.lock().unwrap().reset();

        let sockets: Vec<Arc<Socket>> = self.sockets.read().unwrap().values().cloned().collect();
        let reason = DisconnectReason::from(reason);
        for socket in sockets {
            socket.on_close(reason).await;
        }
        self.connecting.write().unwrap().clear();
    }
}

/// Split a v3-style `"/nsp?token=abc"` namespace into path and auth object
fn split_v3_namespace(name: String, auth: Option<Data>) -> (String, Option<Data>) {
    match name.split_once('?') {
        Some((path, query)) => {
            let entries: Vec<(String, Data)> = query
                .split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| {
                    let mut kv = pair.splitn(2, '=');
                    (
                        kv.next().unwrap_or("").to_string(),
                        Data::Text(kv.next().unwrap_or("").to_string()),
                    )
                })
                .collect();
            let auth = if entries.is_empty() {
                auth
            } else {
                Some(Data::Object(entries))
            };
            (path.to_string(), auth)
        }
        None => (name, auth),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_v3_namespace() {
        let (name, auth) = split_v3_namespace("/chat?token=abc&role=admin".to_string(), None);
        assert_eq!(name, "/chat");
        let auth = auth.unwrap();
        assert_eq!(auth.get("token"), Some(&Data::Text("abc".into())));
        assert_eq!(auth.get("role"), Some(&Data::Text("admin".into())));
    }

    #[test]
    fn test_split_v3_namespace_without_query() {
        let (name, auth) = split_v3_namespace("/chat".to_string(), None);
        assert_eq!(name, "/chat");
        assert!(auth.is_none());
    }
}
