//! WebTransport-style session transport
//!
//! Runs over any bidirectional byte stream. Each packet is length-prefixed
//! with a 1/3/9-byte header: lengths below 126 fit the first byte, larger
//! ones spill into a big-endian u16 or u64. The MSB of the first header
//! byte flags a binary payload.

use crate::error::EngineError;
use crate::packet::{EncodedFrame, Packet};
use crate::transport::{TransportEvent, TransportId};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

const BINARY_FLAG: u8 = 0x80;
const LEN_U16: u8 = 126;
const LEN_U64: u8 = 127;

/// Frame a payload with the 1/3/9-byte length header
pub fn encode_frame_header(len: usize, binary: bool) -> Bytes {
    let flag = if binary { BINARY_FLAG } else { 0 };
    let mut head = BytesMut::with_capacity(9);
    if len < LEN_U16 as usize {
        head.put_u8(flag | len as u8);
    } else if len < 65_536 {
        head.put_u8(flag | LEN_U16);
        head.put_u16(len as u16);
    } else {
        head.put_u8(flag | LEN_U64);
        head.put_u64(len as u64);
    }
    head.freeze()
}

/// WebTransport session state
pub struct WebTransportSession {
    out_tx: mpsc::UnboundedSender<EncodedFrame>,
    tid: TransportId,
    closed: Arc<AtomicBool>,
    discarded: Arc<AtomicBool>,
}

impl std::fmt::Debug for WebTransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebTransportSession")
            .field("tid", &self.tid)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl WebTransportSession {
    /// Spawn reader and writer tasks over an established session stream
    pub fn new<S>(
        stream: S,
        max_payload: usize,
        inbox: mpsc::UnboundedSender<(TransportId, TransportEvent)>,
        tid: TransportId,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let discarded = Arc::new(AtomicBool::new(false));

        tokio::spawn(writer_task(write_half, out_rx, closed.clone(), tid));
        tokio::spawn(reader_task(
            read_half,
            max_payload,
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
            self.out_tx
                .send(packet.encode(true))
                .map_err(|_| EngineError::Closed)?;
        }
        Ok(())
    }

    pub fn send_raw(&self, frames: Vec<EncodedFrame>) -> Result<(), EngineError> {
        for frame in frames {
            self.out_tx.send(frame).map_err(|_| EngineError::Closed)?;
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("[{}] webtransport session shut down", self.tid);
    }

    pub fn discard(&self) {
        self.discarded.store(true, Ordering::SeqCst);
    }
}

async fn writer_task<W>(
    mut writer: W,
    mut out_rx: mpsc::UnboundedReceiver<EncodedFrame>,
    closed: Arc<AtomicBool>,
    tid: TransportId,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(frame) = out_rx.recv().await {
        let (payload, binary): (&[u8], bool) = match &frame {
            EncodedFrame::Text(text) => (text.as_bytes(), false),
            EncodedFrame::Binary(data) => (data.as_ref(), true),
        };
        let head = encode_frame_header(payload.len(), binary);
        if writer.write_all(&head).await.is_err() || writer.write_all(payload).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    trace!("[{}] webtransport writer task ended", tid);
    closed.store(true, Ordering::SeqCst);
    let _ = writer.shutdown().await;
}

async fn reader_task<R>(
    mut reader: R,
    max_payload: usize,
    inbox: mpsc::UnboundedSender<(TransportId, TransportEvent)>,
    tid: TransportId,
    closed: Arc<AtomicBool>,
    discarded: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    loop {
        if discarded.load(Ordering::SeqCst) {
            break;
        }
        match read_frame(&mut reader, max_payload).await {
            Ok(Some((binary, payload))) => {
                let event = if binary {
                    TransportEvent::Packet(Packet::decode_binary(payload))
                } else {
                    match std::str::from_utf8(&payload)
                        .map_err(|_| EngineError::InvalidPacket("frame is not utf-8"))
                        .and_then(Packet::decode_text)
                    {
                        Ok(packet) => TransportEvent::Packet(packet),
                        Err(err) => {
                            let _ = inbox.send((tid, TransportEvent::Error(err.to_string())));
                            break;
                        }
                    }
                };
                let _ = inbox.send((tid, event));
            }
            Ok(None) => {
                let _ = inbox.send((tid, TransportEvent::Close));
                break;
            }
            Err(err) => {
                if !discarded.load(Ordering::SeqCst) {
                    let _ = inbox.send((tid, TransportEvent::Error(err.to_string())));
                }
                break;
            }
        }
    }
    trace!("[{}] webtransport reader task ended", tid);
    closed.store(true, Ordering::SeqCst);
}

/// Read one length-prefixed frame; `None` on a clean end of stream
async fn read_frame<R>(
    reader: &mut R,
    max_payload: usize,
) -> Result<Option<(bool, Bytes)>, EngineError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 1];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let binary = head[0] & BINARY_FLAG != 0;
    let len = match head[0] & !BINARY_FLAG {
        LEN_U16 => {
            let mut buf = [0u8; 2];
            reader.read_exact(&mut buf).await?;
            u16::from_be_bytes(buf) as u64
        }
        LEN_U64 => {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf).await?;
            u64::from_be_bytes(buf)
        }
        small => small as u64,
    };

    if len > max_payload as u64 {
        return Err(EngineError::PayloadTooLarge(len as usize));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some((binary, Bytes::from(payload))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;

    #[test]
    fn test_header_sizes() {
        assert_eq!(encode_frame_header(5, false).as_ref(), &[5]);
        assert_eq!(encode_frame_header(125, false).len(), 1);
        assert_eq!(encode_frame_header(126, false).len(), 3);
        assert_eq!(encode_frame_header(65_535, false).len(), 3);
        assert_eq!(encode_frame_header(65_536, false).len(), 9);
    }

    #[test]
    fn test_header_binary_flag() {
        let head = encode_frame_header(5, true);
        assert_eq!(head[0], 0x85);
        let head = encode_frame_header(300, true);
        assert_eq!(head[0], 0x80 | 126);
        assert_eq!(u16::from_be_bytes([head[1], head[2]]), 300);
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel();
        let session = WebTransportSession::new(server, 1_000_000, inbox_tx, 7);

        // peer side writes a text frame by hand
        let (mut peer_read, mut peer_write) = tokio::io::split(client);
        let frame = b"4hello";
        peer_write
            .write_all(&encode_frame_header(frame.len(), false))
            .await
            .unwrap();
        peer_write.write_all(frame).await.unwrap();

        let (tid, event) = inbox_rx.recv().await.unwrap();
        assert_eq!(tid, 7);
        match event {
            TransportEvent::Packet(p) => {
                assert_eq!(p.packet_type, PacketType::Message);
            }
            other => panic!("expected packet, got {other:?}"),
        }

        // server side sends a binary packet back
        session
            .send(vec![Packet::binary(Bytes::from_static(b"\x01\x02"))])
            .unwrap();
        let mut head = [0u8; 1];
        peer_read.read_exact(&mut head).await.unwrap();
        assert_eq!(head[0], BINARY_FLAG | 2);
        let mut payload = [0u8; 2];
        peer_read.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"\x01\x02");
    }

    #[tokio::test]
    async fn test_peer_close_emits_close_event() {
        let (client, server) = tokio::io::duplex(64);
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel();
        let _session = WebTransportSession::new(server, 1_000_000, inbox_tx, 1);

        drop(client);
        let (_, event) = inbox_rx.recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Close));
    }
}
