//! WebSocket transport
//!
//! Full duplex: one wire frame per packet. Split sink and stream are driven
//! by dedicated writer and reader tasks bridged with channels, so sends
//! never block the connection's event loop.

use crate::error::EngineError;
use crate::packet::{EncodedFrame, Packet};
use crate::transport::{TransportEvent, TransportId};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

/// WebSocket transport state
pub struct WebSocketTransport {
    out_tx: mpsc::UnboundedSender<WsMessage>,
    tid: TransportId,
    closed: Arc<AtomicBool>,
    discarded: Arc<AtomicBool>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("tid", &self.tid)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl WebSocketTransport {
    /// Spawn reader and writer tasks over an accepted WebSocket stream
    pub fn new<S>(
        stream: WebSocketStream<S>,
        inbox: mpsc::UnboundedSender<(TransportId, TransportEvent)>,
        tid: TransportId,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let discarded = Arc::new(AtomicBool::new(false));

        tokio::spawn(writer_task(sink, out_rx, closed.clone(), tid));
        tokio::spawn(reader_task(
            source,
            inbox,
            tid,
            closed.clone(),
            discarded.clone(),
        ));

        Self {
            out_tx,
            tid,
            closed,
            discarded,
        }
    }

    pub fn writable(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub fn send(&self, packets: Vec<Packet>) -> Result<(), EngineError> {
        for packet in packets {
            let message = match packet.encode(true) {
                EncodedFrame::Text(text) => WsMessage::Text(text),
                EncodedFrame::Binary(data) => WsMessage::Binary(data.to_vec()),
            };
            self.out_tx
                .send(message)
                .map_err(|_| EngineError::Closed)?;
        }
        Ok(())
    }

    /// Send frames already encoded by a broadcast fan-out
    pub fn send_raw(&self, frames: Vec<EncodedFrame>) -> Result<(), EngineError> {
        for frame in frames {
            let message = match frame {
                EncodedFrame::Text(text) => WsMessage::Text(text),
                EncodedFrame::Binary(data) => WsMessage::Binary(data.to_vec()),
            };
            self.out_tx
                .send(message)
                .map_err(|_| EngineError::Closed)?;
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("[{}] websocket transport shut down", self.tid);
        let _ = self.out_tx.send(WsMessage::Close(None));
    }

    pub fn discard(&self) {
        self.discarded.store(true, Ordering::SeqCst);
    }
}

async fn writer_task<S>(
    mut sink: futures_util::stream::SplitSink<WebSocketStream<S>, WsMessage>,
    mut out_rx: mpsc::UnboundedReceiver<WsMessage>,
    closed: Arc<AtomicBool>,
    tid: TransportId,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(message) = out_rx.recv().await {
        let is_close = matches!(message, WsMessage::Close(_));
        if sink.send(message).await.is_err() {
            break;
        }
        if is_close {
            break;
        }
    }
    trace!("[{}] websocket writer task ended", tid);
    closed.store(true, Ordering::SeqCst);
    let _ = sink.close().await;
}

async fn reader_task<S>(
    mut source: futures_util::stream::SplitStream<WebSocketStream<S>>,
    inbox: mpsc::UnboundedSender<(TransportId, TransportEvent)>,
    tid: TransportId,
    closed: Arc<AtomicBool>,
    discarded: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(result) = source.next().await {
        if discarded.load(Ordering::SeqCst) {
            break;
        }
        match result {
            Ok(WsMessage::Text(text)) => match Packet::decode_text(&text) {
                Ok(packet) => {
                    let _ = inbox.send((tid, TransportEvent::Packet(packet)));
                }
                Err(err) => {
                    let _ = inbox.send((tid, TransportEvent::Error(err.to_string())));
                    break;
                }
            },
            Ok(WsMessage::Binary(data)) => {
                let packet = Packet::decode_binary(data.into());
                let _ = inbox.send((tid, TransportEvent::Packet(packet)));
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {
                // control frames are handled by tungstenite
            }
            Ok(WsMessage::Close(_)) => {
                let _ = inbox.send((tid, TransportEvent::Close));
                break;
            }
            Ok(_) => {}
            Err(err) => {
                if !discarded.load(Ordering::SeqCst) {
                    let _ = inbox.send((tid, TransportEvent::Error(err.to_string())));
                }
                break;
            }
        }
    }
    trace!("[{}] websocket reader task ended", tid);
    closed.store(true, Ordering::SeqCst);
}
