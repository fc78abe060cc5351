//! Adapters
//!
//! An adapter owns the room membership index for one namespace and
//! implements broadcast, broadcast-with-ack, and optionally cross-process
//! fan-out. The in-memory adapter is the default; cluster deployments swap
//! in an adapter that mirrors the same protocol over an inter-node channel.

pub mod memory;

pub use memory::MemoryAdapter;

use crate::error::BroadcastError;
use crate::namespace::Namespace;
use crate::recovery::StoredSession;
use crate::{Room, Sid};
use async_trait::async_trait;
use nexio_parser::{Data, Packet};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Flags refining a broadcast
#[derive(Debug, Clone, Default)]
pub struct BroadcastFlags {
    /// Best effort: drop instead of buffering when a peer is not writable
    pub volatile: bool,
    /// Stay on this node even when a cluster adapter is installed
    pub local: bool,
    /// Acknowledgement collection window
    pub timeout: Option<Duration>,
}

/// Broadcast target description
#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    /// Target rooms; empty means the whole namespace
    pub rooms: HashSet<Room>,
    /// Rooms whose members are excluded
    pub except: HashSet<Room>,
    pub flags: BroadcastFlags,
}

/// Items streamed back while collecting broadcast acknowledgements.
///
/// The expected responder count arrives first once known; a cluster adapter
/// sends one count per node as they report in.
#[derive(Debug)]
pub enum AckStreamItem {
    ExpectedCount(usize),
    Reply(Vec<Data>),
}

/// A session restored by the adapter, with the packets missed while away
pub struct RecoveredSession {
    pub session: StoredSession,
    pub missed: Vec<Packet>,
}

/// Room index and broadcast implementation for one namespace
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Join rooms. Joining an already-joined room is a no-op.
    fn add_all(&self, sid: &str, rooms: &[Room]);

    /// Leave one room
    fn del(&self, sid: &str, room: &str);

    /// Leave every room (socket teardown)
    fn del_all(&self, sid: &str);

    /// Resolve the broadcast target set: the union of the target rooms'
    /// members (or the whole namespace when no rooms are given) minus every
    /// member of an excluded room, each id counted once.
    fn sockets(&self, opts: &BroadcastOptions) -> HashSet<Sid>;

    /// Rooms a socket is in
    fn socket_rooms(&self, sid: &str) -> Option<HashSet<Room>>;

    /// All known rooms
    fn rooms(&self) -> Vec<Room>;

    /// Deliver a packet to every matching socket, encoding it once
    async fn broadcast(&self, packet: Packet, opts: BroadcastOptions)
        -> Result<(), BroadcastError>;

    /// Broadcast expecting one acknowledgement per matching socket. The
    /// stream first reports the expected responder count, then forwards each
    /// responder's payload as it arrives; the caller applies the timeout.
    async fn broadcast_with_ack(
        &self,
        packet: Packet,
        opts: BroadcastOptions,
    ) -> Result<mpsc::UnboundedReceiver<AckStreamItem>, BroadcastError>;

    /// Number of nodes serving this namespace
    async fn server_count(&self) -> usize;

    /// Persist a session for connection state recovery
    fn persist_session(&self, session: StoredSession);

    /// Restore a previously persisted session
    fn restore_session(&self, pid: &str, since: Option<u64>) -> Option<RecoveredSession>;
}

/// Builds one adapter per namespace
pub type AdapterFactory = Arc<dyn Fn(Weak<Namespace>) -> Arc<dyn Adapter> + Send + Sync>;
