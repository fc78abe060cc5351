//! Connection state recovery
//!
//! When enabled, every broadcast packet is tagged with a monotonically
//! increasing offset and kept in a bounded ring; sessions of recoverably
//! disconnected sockets are persisted for a configured window. A peer
//! reconnecting with its recovery token and last seen offset gets its rooms
//! back plus the packets it missed.

use crate::{Room, Sid};
use nexio_engine::sid;
use nexio_parser::{Data, Packet};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Recovery configuration
#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// How long a disconnected session stays recoverable
    pub max_disconnection_duration: Duration,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            max_disconnection_duration: Duration::from_secs(120),
        }
    }
}

/// A persisted session awaiting possible recovery
#[derive(Debug, Clone)]
pub struct StoredSession {
    pub sid: Sid,
    pub pid: String,
    pub rooms: Vec<Room>,
    pub data: Option<Data>,
    pub disconnected_at: Instant,
}

struct PersistedPacket {
    offset: u64,
    emitted_at: Instant,
    packet: Packet,
}

/// Per-namespace recovery state
pub struct RecoveryStore {
    max_disconnection_duration: Duration,
    offset_seq: AtomicU64,
    pid_seq: AtomicU64,
    packets: Mutex<VecDeque<PersistedPacket>>,
    sessions: Mutex<HashMap<String, StoredSession>>,
}

impl RecoveryStore {
    pub fn new(opts: &RecoveryOptions) -> Self {
        Self {
            max_disconnection_duration: opts.max_disconnection_duration,
            offset_seq: AtomicU64::new(0),
            pid_seq: AtomicU64::new(0),
            packets: Mutex::new(VecDeque::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a private recovery token for a new socket
    pub fn generate_pid(&self) -> String {
        sid::generate(self.pid_seq.fetch_add(1, Ordering::SeqCst))
    }

    /// How often expired sessions should be swept
    pub fn sweep_period(&self) -> Duration {
        (self.max_disconnection_duration / 2).max(Duration::from_secs(1))
    }

    /// Tag a broadcast packet with the next offset and keep a copy for replay
    pub fn record(&self, packet: &mut Packet) {
        let offset = self.offset_seq.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(Data::Array(items)) = packet.data.as_mut() {
            items.push(Data::Text(offset.to_string()));
        }
        let mut packets = self.packets.lock().unwrap();
        let horizon = Instant::now().checked_sub(self.max_disconnection_duration);
        while packets
            .front()
            .zip(horizon)
            .map(|(entry, horizon)| entry.emitted_at < horizon)
            .unwrap_or(false)
        {
            packets.pop_front();
        }
        packets.push_back(PersistedPacket {
            offset,
            emitted_at: Instant::now(),
            packet: packet.clone(),
        });
    }

    /// Persist the session of a recoverably disconnected socket
    pub fn persist(&self, session: StoredSession) {
        debug!("[{}] session persisted for recovery", session.sid);
        self.sessions
            .lock()
            .unwrap()
            .insert(session.pid.clone(), session);
    }

    /// Take a persisted session back out, with the packets broadcast since
    /// the given offset. Expired sessions are gone for good.
    pub fn restore(&self, pid: &str, since: Option<u64>) -> Option<(StoredSession, Vec<Packet>)> {
        let session = self.sessions.lock().unwrap().remove(pid)?;
        if session.disconnected_at.elapsed() > self.max_disconnection_duration {
            return None;
        }
        let floor = since.unwrap_or(0);
        let missed = self
            .packets
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.offset > floor)
            .map(|entry| entry.packet.clone())
            .collect();
        Some((session, missed))
    }

    /// Drop sessions past the recovery window
    pub fn sweep(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions
            .retain(|_, session| session.disconnected_at.elapsed() <= self.max_disconnection_duration);
        let dropped = before - sessions.len();
        if dropped > 0 {
            debug!("swept {} expired recovery sessions", dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str) -> Packet {
        Packet::event("/", Data::Array(vec![Data::Text(name.into())]))
    }

    #[test]
    fn test_record_appends_offset() {
        let store = RecoveryStore::new(&RecoveryOptions::default());
        let mut packet = event("news");
        store.record(&mut packet);

        let items = packet.data.as_ref().unwrap().as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], Data::Text("1".into()));
    }

    #[test]
    fn test_restore_returns_missed_packets() {
        let store = RecoveryStore::new(&RecoveryOptions::default());
        for name in ["a", "b", "c"] {
            let mut packet = event(name);
            store.record(&mut packet);
        }

        let pid = store.generate_pid();
        store.persist(StoredSession {
            sid: "s1".into(),
            pid: pid.clone(),
            rooms: vec!["r1".into()],
            data: None,
            disconnected_at: Instant::now(),
        });

        let (session, missed) = store.restore(&pid, Some(1)).unwrap();
        assert_eq!(session.sid, "s1");
        assert_eq!(missed.len(), 2);
    }

    #[test]
    fn test_restore_is_one_shot() {
        let store = RecoveryStore::new(&RecoveryOptions::default());
        let pid = store.generate_pid();
        store.persist(StoredSession {
            sid: "s1".into(),
            pid: pid.clone(),
            rooms: vec![],
            data: None,
            disconnected_at: Instant::now(),
        });

        assert!(store.restore(&pid, None).is_some());
        assert!(store.restore(&pid, None).is_none());
    }

    #[test]
    fn test_expired_session_is_not_restored() {
        let store = RecoveryStore::new(&RecoveryOptions {
            max_disconnection_duration: Duration::from_millis(0),
        });
        let pid = store.generate_pid();
        store.persist(StoredSession {
            sid: "s1".into(),
            pid: pid.clone(),
            rooms: vec![],
            data: None,
            disconnected_at: Instant::now() - Duration::from_millis(5),
        });

        assert!(store.restore(&pid, None).is_none());
    }

    #[test]
    fn test_sweep_drops_expired() {
        let store = RecoveryStore::new(&RecoveryOptions {
            max_disconnection_duration: Duration::from_millis(0),
        });
        store.persist(StoredSession {
            sid: "s1".into(),
            pid: "p1".into(),
            rooms: vec![],
            data: None,
            disconnected_at: Instant::now() - Duration::from_millis(5),
        });
        store.sweep();
        assert!(store.restore("p1", None).is_none());
    }
}
