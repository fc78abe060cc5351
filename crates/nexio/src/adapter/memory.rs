//! In-memory adapter
//!
//! Bidirectional room index (`room -> sids`, `sid -> rooms`) kept consistent
//! on every join, leave, and disconnect; a room with no members is deleted.

use crate::adapter::{
    Adapter, AckStreamItem, AdapterFactory, BroadcastOptions, RecoveredSession,
};
use crate::error::BroadcastError;
use crate::namespace::Namespace;
use crate::recovery::{RecoveryOptions, RecoveryStore, StoredSession};
use crate::{Room, Sid};
use async_trait::async_trait;
use nexio_parser::Packet;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Default single-process adapter
pub struct MemoryAdapter {
    nsp: Weak<Namespace>,
    rooms: RwLock<HashMap<Room, HashSet<Sid>>>,
    sids: RwLock<HashMap<Sid, HashSet<Room>>>,
    recovery: Option<Arc<RecoveryStore>>,
    sweeper: Option<tokio::task::JoinHandle<()>>,
}

impl MemoryAdapter {
    pub fn new(nsp: Weak<Namespace>, recovery: Option<&RecoveryOptions>) -> Self {
        let recovery = recovery.map(|opts| Arc::new(RecoveryStore::new(opts)));
        let sweeper = recovery.as_ref().map(|store| {
            let period = store.sweep_period();
            let store = Arc::downgrade(store);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    match store.upgrade() {
                        Some(store) => store.sweep(),
                        None => break,
                    }
                }
            })
        });
        Self {
            nsp,
            rooms: RwLock::new(HashMap::new()),
            sids: RwLock::new(HashMap::new()),
            recovery,
            sweeper,
        }
    }

    /// Factory installing this adapter on every namespace
    pub fn factory(recovery: Option<RecoveryOptions>) -> AdapterFactory {
        Arc::new(move |nsp| Arc::new(MemoryAdapter::new(nsp, recovery.as_ref())))
    }

    fn resolve(&self, opts: &BroadcastOptions) -> HashSet<Sid> {
        let rooms = self.rooms.read().unwrap();

        let mut excluded: HashSet<Sid> = HashSet::new();
        for room in &opts.except {
            if let Some(members) = rooms.get(room) {
                excluded.extend(members.iter().cloned());
            }
        }

        if opts.rooms.is_empty() {
            let sids = self.sids.read().unwrap();
            return sids
                .keys()
                .filter(|sid| !excluded.contains(*sid))
                .cloned()
                .collect();
        }

        let mut out = HashSet::new();
        for room in &opts.rooms {
            if let Some(members) = rooms.get(room) {
                for sid in members {
                    if !excluded.contains(sid) {
                        out.insert(sid.clone());
                    }
                }
            }
        }
        out
    }
}

impl Drop for MemoryAdapter {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn add_all(&self, sid: &str, rooms: &[Room]) {
        let mut room_index = self.rooms.write().unwrap();
        let mut sid_index = self.sids.write().unwrap();
        let joined = sid_index.entry(sid.to_string()).or_default();
        for room in rooms {
            if joined.insert(room.clone()) {
                trace!("[{}] joined room {}", sid, room);
            }
            room_index
                .entry(room.clone())
                .or_default()
                .insert(sid.to_string());
        }
    }

    fn del(&self, sid: &str, room: &str) {
        let mut room_index = self.rooms.write().unwrap();
        let mut sid_index = self.sids.write().unwrap();
        if let Some(joined) = sid_index.get_mut(sid) {
            joined.remove(room);
        }
        if let Some(members) = room_index.get_mut(room) {
            members.remove(sid);
            if members.is_empty() {
                room_index.remove(room);
            }
        }
    }

    fn del_all(&self, sid: &str) {
        let mut room_index = self.rooms.write().unwrap();
        let mut sid_index = self.sids.write().unwrap();
        if let Some(joined) = sid_index.remove(sid) {
            for room in joined {
                if let Some(members) = room_index.get_mut(&room) {
                    members.remove(sid);
                    if members.is_empty() {
                        room_index.remove(&room);
                    }
                }
            }
        }
    }

    fn sockets(&self, opts: &BroadcastOptions) -> HashSet<Sid> {
        self.resolve(opts)
    }

    fn socket_rooms(&self, sid: &str) -> Option<HashSet<Room>> {
        self.sids.read().unwrap().get(sid).cloned()
    }

    fn rooms(&self) -> Vec<Room> {
        self.rooms.read().unwrap().keys().cloned().collect()
    }

    async fn broadcast(
        &self,
        mut packet: Packet,
        opts: BroadcastOptions,
    ) -> Result<(), BroadcastError> {
        let nsp = self.nsp.upgrade().ok_or(BroadcastError::NamespaceGone)?;
        if let Some(store) = &self.recovery {
            if !opts.flags.volatile {
                store.record(&mut packet);
            }
        }

        let targets = self.resolve(&opts);
        let encoded = packet.encode()?;
        debug!(
            "[{}] broadcasting to {} sockets",
            nsp.name(),
            targets.len()
        );
        for sid in targets {
            if let Some(socket) = nsp.socket(&sid) {
                socket.deliver_broadcast(&encoded, opts.flags.volatile);
            }
        }
        Ok(())
    }

    async fn broadcast_with_ack(
        &self,
        packet: Packet,
        opts: BroadcastOptions,
    ) -> Result<mpsc::UnboundedReceiver<AckStreamItem>, BroadcastError> {
        let nsp = self.nsp.upgrade().ok_or(BroadcastError::NamespaceGone)?;
        let id = nsp.next_ack_id();
        let packet = packet.with_id(id);

        let targets: Vec<_> = self
            .resolve(&opts)
            .into_iter()
            .filter_map(|sid| nsp.socket(&sid))
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(AckStreamItem::ExpectedCount(targets.len()));

        let encoded = packet.encode()?;
        for socket in targets {
            socket.register_broadcast_ack(id, tx.clone());
            socket.deliver_broadcast(&encoded, false);
        }
        Ok(rx)
    }

    async fn server_count(&self) -> usize {
        1
    }

    fn persist_session(&self, session: StoredSession) {
        if let Some(store) = &self.recovery {
            store.persist(session);
        }
    }

    fn restore_session(&self, pid: &str, since: Option<u64>) -> Option<RecoveredSession> {
        let store = self.recovery.as_ref()?;
        let (session, missed) = store.restore(pid, since)?;
        Some(RecoveredSession { session, missed })
    }
}
