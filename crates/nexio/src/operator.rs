//! Broadcast operator
//!
//! An immutable builder describing a target room set, excluded rooms, and
//! flags before handing the broadcast to the namespace's adapter.

use crate::adapter::{AckStreamItem, BroadcastFlags, BroadcastOptions};
use crate::error::BroadcastError;
use crate::namespace::Namespace;
use crate::socket::Socket;
use crate::Room;
use nexio_parser::{Data, Packet, RESERVED_EVENTS};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fallback acknowledgement window when no timeout flag is set
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Describes one broadcast before it reaches the adapter
#[derive(Clone)]
pub struct BroadcastOperator {
    nsp: Arc<Namespace>,
    rooms: HashSet<Room>,
    except: HashSet<Room>,
    flags: BroadcastFlags,
}

impl BroadcastOperator {
    pub(crate) fn new(nsp: Arc<Namespace>) -> Self {
        Self {
            nsp,
            rooms: HashSet::new(),
            except: HashSet::new(),
            flags: BroadcastFlags::default(),
        }
    }

    /// Add a target room
    pub fn to(mut self, room: impl Into<Room>) -> Self {
        self.rooms.insert(room.into());
        self
    }

    /// Alias of `to`
    pub fn in_(self, room: impl Into<Room>) -> Self {
        self.to(room)
    }

    /// Exclude a room's members
    pub fn except(mut self, room: impl Into<Room>) -> Self {
        self.except.insert(room.into());
        self
    }

    /// Drop instead of buffering for peers that are not writable
    pub fn volatile(mut self) -> Self {
        self.flags.volatile = true;
        self
    }

    /// Stay on this node even under a cluster adapter
    pub fn local(mut self) -> Self {
        self.flags.local = true;
        self
    }

    /// Acknowledgement collection window
    pub fn timeout(mut self, window: Duration) -> Self {
        self.flags.timeout = Some(window);
        self
    }

    fn options(&self) -> BroadcastOptions {
        BroadcastOptions {
            rooms: self.rooms.clone(),
            except: self.except.clone(),
            flags: self.flags.clone(),
        }
    }

    fn event_packet(&self, event: &str, args: Vec<Data>) -> Result<Packet, BroadcastError> {
        if RESERVED_EVENTS.contains(&event) {
            return Err(BroadcastError::ReservedEvent(event.to_string()));
        }
        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(Data::Text(event.to_string()));
        data.extend(args);
        Ok(Packet::event(self.nsp.name().to_string(), Data::Array(data)))
    }

    /// Emit to every matching socket
    pub async fn emit(&self, event: &str, args: Vec<Data>) -> Result<(), BroadcastError> {
        let packet = self.event_packet(event, args)?;
        self.nsp.adapter().broadcast(packet, self.options()).await
    }

    /// Emit and collect one acknowledgement per matching socket.
    ///
    /// Resolves once every expected local and remote responder has replied
    /// or the timeout elapses, whichever comes first; a timeout still
    /// delivers the partial list.
    pub async fn emit_with_ack(
        &self,
        event: &str,
        args: Vec<Data>,
    ) -> Result<Vec<Vec<Data>>, BroadcastError> {
        let packet = self.event_packet(event, args)?;
        let window = self.flags.timeout.unwrap_or(DEFAULT_ACK_TIMEOUT);
        let mut stream = self
            .nsp
            .adapter()
            .broadcast_with_ack(packet, self.options())
            .await?;

        let deadline = Instant::now() + window;
        let mut expected: Option<usize> = None;
        let mut replies: Vec<Vec<Data>> = Vec::new();

        loop {
            if let Some(expected) = expected {
                if replies.len() >= expected {
                    break;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, stream.recv()).await {
                Ok(Some(AckStreamItem::ExpectedCount(count))) => {
                    expected = Some(expected.unwrap_or(0) + count);
                }
                Ok(Some(AckStreamItem::Reply(reply))) => replies.push(reply),
                Ok(None) => break,
                Err(_) => break,
            }
        }
        Ok(replies)
    }

    /// Matching sockets connected to this node
    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        self.nsp
            .adapter()
            .sockets(&self.options())
            .into_iter()
            .filter_map(|sid| self.nsp.socket(&sid))
            .collect()
    }

    /// Join every matching socket to the given rooms
    pub fn sockets_join(&self, rooms: Vec<Room>) {
        let adapter = self.nsp.adapter();
        for sid in adapter.sockets(&self.options()) {
            adapter.add_all(&sid, &rooms);
        }
    }

    /// Make every matching socket leave the given rooms
    pub fn sockets_leave(&self, rooms: Vec<Room>) {
        let adapter = self.nsp.adapter();
        for sid in adapter.sockets(&self.options()) {
            for room in &rooms {
                adapter.del(&sid, room);
            }
        }
    }

    /// Disconnect every matching socket
    pub async fn disconnect_sockets(&self, close: bool) {
        for socket in self.sockets() {
            let _ = socket.disconnect(close).await;
        }
    }
}
