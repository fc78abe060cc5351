//! Connection server
//!
//! Validates every inbound request or upgrade before dispatch, performs the
//! handshake, and routes follow-up requests to the right connection by
//! session id. HTTP framework glue stays outside: polling exchanges arrive
//! as `http::Request<Bytes>` values and WebSocket/WebTransport sessions
//! arrive already accepted.

use crate::config::EngineConfig;
use crate::error::{EngineError, HandshakeError};
use crate::sid;
use crate::socket::{CloseReason, HandshakeSummary, Handler, Socket};
use crate::transport::{
    negotiate_encoding, PollingTransport, Transport, TransportKind, WebSocketTransport,
    WebTransportSession,
};
use crate::ProtocolVersion;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::SinkExt;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

/// Parsed query parameters of an inbound engine request
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// `EIO` protocol revision
    pub protocol: Option<u8>,
    /// `transport` name
    pub transport: Option<String>,
    /// `sid` referencing an existing connection
    pub sid: Option<String>,
    /// `j` JSONP index; parsed but unsupported
    pub jsonp: Option<String>,
    /// `b64` flag forcing base64 binary framing
    pub b64: bool,
    /// `Accept-Encoding` header, for the compression hint
    pub accept_encoding: Option<String>,
}

impl RequestContext {
    pub fn parse(query: &str) -> Self {
        let mut ctx = Self::default();
        for pair in query.split('&') {
            let mut kv = pair.splitn(2, '=');
            let key = kv.next().unwrap_or("");
            let value = kv.next().unwrap_or("");
            match key {
                "EIO" => ctx.protocol = value.parse().ok(),
                "transport" => ctx.transport = Some(value.to_string()),
                "sid" => ctx.sid = Some(value.to_string()),
                "j" => ctx.jsonp = Some(value.to_string()),
                "b64" => ctx.b64 = value == "1" || value == "true",
                _ => {}
            }
        }
        ctx
    }

    pub fn from_request(req: &Request<Bytes>) -> Self {
        let mut ctx = Self::parse(req.uri().query().unwrap_or(""));
        ctx.accept_encoding = req
            .headers()
            .get(http::header::ACCEPT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        ctx
    }
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) sockets: DashMap<String, Arc<Socket>>,
    sid_seq: AtomicU64,
    closed: AtomicBool,
}

struct Verified {
    protocol: ProtocolVersion,
    socket: Option<Arc<Socket>>,
}

/// The engine server: handshake, verification, and the live-connection index
#[derive(Clone)]
pub struct EngineServer {
    inner: Arc<EngineInner>,
    handler: Arc<dyn Handler>,
}

impl EngineServer {
    pub fn new(config: EngineConfig, handler: Arc<dyn Handler>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                sockets: DashMap::new(),
                sid_seq: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
            handler,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Number of live connections
    pub fn connections_count(&self) -> usize {
        self.inner.sockets.len()
    }

    /// Look up a live connection by session id
    pub fn connection(&self, sid: &str) -> Option<Arc<Socket>> {
        self.inner.sockets.get(sid).map(|entry| entry.value().clone())
    }

    /// Handle a polling HTTP exchange (handshake GET, poll GET, or data POST)
    pub async fn handle_request(&self, req: Request<Bytes>) -> Response<Bytes> {
        let ctx = RequestContext::from_request(&req);
        match self.dispatch(req, &ctx).await {
            Ok(response) => response,
            Err(err) => error_response(&err),
        }
    }

    async fn dispatch(
        &self,
        req: Request<Bytes>,
        ctx: &RequestContext,
    ) -> Result<Response<Bytes>, HandshakeError> {
        let method = req.method().as_str().to_string();
        let verified = self.verify(&method, ctx, false)?;

        match (method.as_str(), verified.socket) {
            ("GET", Some(socket)) => self.poll(socket, ctx).await,
            ("GET", None) => self.handshake_polling(verified.protocol, ctx, &req).await,
            ("POST", Some(socket)) => self.data(socket, req.body()).await,
            // verify rejects a sid-less POST, so this is an exotic method
            _ => Err(HandshakeError::BadRequest("unsupported method")),
        }
    }

    /// Run the fixed validation pipeline over a request
    fn verify(
        &self,
        method: &str,
        ctx: &RequestContext,
        upgrade: bool,
    ) -> Result<Verified, HandshakeError> {
        let protocol = match ctx.protocol {
            Some(version) => ProtocolVersion::try_from(version)?,
            None => return Err(HandshakeError::UnsupportedProtocolVersion),
        };

        let kind = ctx
            .transport
            .as_deref()
            .and_then(TransportKind::parse)
            .ok_or(HandshakeError::UnknownTransport)?;
        if !self.inner.config.transports.contains(&kind) {
            return Err(HandshakeError::UnknownTransport);
        }
        if ctx.jsonp.is_some() {
            return Err(HandshakeError::BadRequest("jsonp polling is not supported"));
        }
        if upgrade && !kind.handles_upgrades() {
            return Err(HandshakeError::BadRequest("bad upgrade"));
        }

        let socket = match &ctx.sid {
            Some(sid) => {
                let socket = self
                    .inner
                    .sockets
                    .get(sid)
                    .map(|entry| entry.value().clone())
                    .ok_or(HandshakeError::UnknownSid)?;
                let current = socket.transport_name().unwrap_or("");
                if !upgrade && current != kind.as_str() {
                    debug!(
                        "[{}] transport mismatch: bound to {}, requested {}",
                        sid,
                        current,
                        kind.as_str()
                    );
                    return Err(HandshakeError::BadRequest("transport mismatch"));
                }
                if upgrade && current == kind.as_str() {
                    return Err(HandshakeError::BadRequest("bad upgrade"));
                }
                Some(socket)
            }
            None => {
                if self.inner.closed.load(Ordering::SeqCst) {
                    return Err(HandshakeError::BadRequest("server is closing"));
                }
                if method != "GET" {
                    return Err(HandshakeError::BadHandshakeMethod);
                }
                // a persistent transport handshake must arrive as an upgrade
                if !upgrade && kind != TransportKind::Polling {
                    return Err(HandshakeError::BadRequest("bad upgrade"));
                }
                if let Some(allow) = &self.inner.config.allow_request {
                    allow(ctx).map_err(|message| HandshakeError::Forbidden(Some(message)))?;
                }
                None
            }
        };

        Ok(Verified { protocol, socket })
    }

    async fn handshake_polling(
        &self,
        protocol: ProtocolVersion,
        ctx: &RequestContext,
        req: &Request<Bytes>,
    ) -> Result<Response<Bytes>, HandshakeError> {
        let socket = self.create_socket(protocol, summarize(req))?;
        let tid = socket.next_tid();
        let transport = Arc::new(Transport::Polling(PollingTransport::new(
            protocol,
            self.inner.config.max_payload,
            socket.inbox_sender(),
            tid,
        )));
        socket.attach_transport(transport.clone(), tid);
        socket
            .open()
            .map_err(|_| HandshakeError::BadRequest("handshake failed"))?;
        self.handler.on_connect(socket.clone()).await;

        // the handshake GET doubles as the first poll cycle
        let payload = match transport.as_polling() {
            Some(polling) => polling
                .on_poll()
                .await
                .map_err(|_| HandshakeError::BadRequest("handshake failed"))?,
            None => return Err(HandshakeError::BadRequest("handshake failed")),
        };
        Ok(self.text_response(payload, ctx))
    }

    async fn poll(
        &self,
        socket: Arc<Socket>,
        ctx: &RequestContext,
    ) -> Result<Response<Bytes>, HandshakeError> {
        let transport = socket
            .current_transport()
            .ok_or(HandshakeError::BadRequest("transport mismatch"))?;
        let polling = transport
            .as_polling()
            .ok_or(HandshakeError::BadRequest("transport mismatch"))?;

        match polling.on_poll().await {
            Ok(payload) => Ok(self.text_response(payload, ctx)),
            Err(EngineError::PollOverlap) => {
                trace!("[{}] overlapping poll rejected", socket.id());
                Err(HandshakeError::BadRequest("overlap"))
            }
            Err(err) => {
                debug!("[{}] poll failed: {}", socket.id(), err);
                socket.close(CloseReason::TransportError).await;
                Err(HandshakeError::BadRequest("poll failed"))
            }
        }
    }

    async fn data(
        &self,
        socket: Arc<Socket>,
        body: &Bytes,
    ) -> Result<Response<Bytes>, HandshakeError> {
        let transport = socket
            .current_transport()
            .ok_or(HandshakeError::BadRequest("transport mismatch"))?;
        let polling = transport
            .as_polling()
            .ok_or(HandshakeError::BadRequest("transport mismatch"))?;

        match polling.on_data(body) {
            Ok(()) => {
                let mut res = Response::new(Bytes::from_static(b"ok"));
                res.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=UTF-8"),
                );
                Ok(res)
            }
            Err(EngineError::PollOverlap) => Err(HandshakeError::BadRequest("overlap")),
            Err(err) => {
                // malformed payloads are fatal to the connection
                debug!("[{}] data request failed: {}", socket.id(), err);
                socket.close(CloseReason::TransportError).await;
                Err(HandshakeError::BadRequest("invalid payload"))
            }
        }
    }

    /// Handle an accepted WebSocket: either an upgrade of an existing
    /// connection (sid present) or a direct websocket handshake.
    pub async fn handle_upgrade<S>(
        &self,
        query: &str,
        summary: HandshakeSummary,
        ws: WebSocketStream<S>,
    ) -> Result<(), EngineError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ctx = RequestContext::parse(query);
        let verified = match self.verify("GET", &ctx, true) {
            Ok(verified) => verified,
            Err(err) => {
                let mut ws = ws;
                let _ = ws.send(WsMessage::Text(err.to_json())).await;
                let _ = ws.close(None).await;
                return Err(EngineError::WebSocket(err.message().to_string()));
            }
        };

        match verified.socket {
            Some(socket) => {
                let tid = socket.next_tid();
                let transport = Arc::new(Transport::WebSocket(WebSocketTransport::new(
                    ws,
                    socket.inbox_sender(),
                    tid,
                )));
                socket.maybe_upgrade(transport, tid);
                Ok(())
            }
            None => {
                let socket = self
                    .create_socket(verified.protocol, summary)
                    .map_err(|err| EngineError::WebSocket(err.message().to_string()))?;
                let tid = socket.next_tid();
                let transport = Arc::new(Transport::WebSocket(WebSocketTransport::new(
                    ws,
                    socket.inbox_sender(),
                    tid,
                )));
                socket.attach_transport(transport, tid);
                socket.open()?;
                self.handler.on_connect(socket).await;
                Ok(())
            }
        }
    }

    /// Handle an established WebTransport-style session stream
    pub async fn handle_session<S>(
        &self,
        query: &str,
        summary: HandshakeSummary,
        stream: S,
    ) -> Result<(), EngineError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ctx = RequestContext::parse(query);
        let verified = self
            .verify("GET", &ctx, true)
            .map_err(|err| EngineError::WebSocket(err.message().to_string()))?;

        match verified.socket {
            Some(socket) => {
                let tid = socket.next_tid();
                let transport = Arc::new(Transport::WebTransport(WebTransportSession::new(
                    stream,
                    self.inner.config.max_payload,
                    socket.inbox_sender(),
                    tid,
                )));
                socket.maybe_upgrade(transport, tid);
                Ok(())
            }
            None => {
                let socket = self
                    .create_socket(verified.protocol, summary)
                    .map_err(|err| EngineError::WebSocket(err.message().to_string()))?;
                let tid = socket.next_tid();
                let transport = Arc::new(Transport::WebTransport(WebTransportSession::new(
                    stream,
                    self.inner.config.max_payload,
                    socket.inbox_sender(),
                    tid,
                )));
                socket.attach_transport(transport, tid);
                socket.open()?;
                self.handler.on_connect(socket).await;
                Ok(())
            }
        }
    }

    /// Shut down every live connection
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let sockets: Vec<Arc<Socket>> = self
            .inner
            .sockets
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for socket in sockets {
            socket.close(CloseReason::ServerShuttingDown).await;
        }
    }

    fn create_socket(
        &self,
        protocol: ProtocolVersion,
        remote: HandshakeSummary,
    ) -> Result<Arc<Socket>, HandshakeError> {
        let sid = self.generate_sid()?;
        let socket = Socket::new(
            sid.clone(),
            protocol,
            self.inner.config.clone(),
            remote,
            self.handler.clone(),
            Arc::downgrade(&self.inner),
        );
        debug!("[{}] connection established", sid);
        self.inner.sockets.insert(sid, socket.clone());
        Ok(socket)
    }

    fn generate_sid(&self) -> Result<String, HandshakeError> {
        for _ in 0..3 {
            let seq = self.inner.sid_seq.fetch_add(1, Ordering::SeqCst);
            let sid = match &self.inner.config.sid_generator {
                Some(generator) => generator(seq),
                None => sid::generate(seq),
            };
            if !self.inner.sockets.contains_key(&sid) {
                return Ok(sid);
            }
        }
        Err(HandshakeError::BadRequest("session id unavailable"))
    }

    fn text_response(&self, body: String, ctx: &RequestContext) -> Response<Bytes> {
        // above the threshold, record the negotiated encoding as a response
        // extension; applying it is the HTTP layer's job
        let hint = if body.len() >= self.inner.config.compression_threshold {
            ctx.accept_encoding.as_deref().and_then(negotiate_encoding)
        } else {
            None
        };
        let mut res = Response::new(Bytes::from(body));
        res.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=UTF-8"),
        );
        if let Some(encoding) = hint {
            res.extensions_mut().insert(encoding);
        }
        res
    }
}

fn error_response(err: &HandshakeError) -> Response<Bytes> {
    let mut res = Response::new(Bytes::from(err.to_json()));
    *res.status_mut() =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::BAD_REQUEST);
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    res
}

fn summarize(req: &Request<Bytes>) -> HandshakeSummary {
    let header = |name: http::header::HeaderName| {
        req.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
    };
    HandshakeSummary {
        url: req.uri().to_string(),
        user_agent: header(http::header::USER_AGENT),
        origin: header(http::header::ORIGIN),
        secure: req.uri().scheme_str() == Some("https"),
        issued_ms: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0),
    }
}
