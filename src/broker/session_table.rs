//! Broker-side session registry.
//!
//! One [`Session`] per accepted connection, tagged with its protocol variant
//! and subscription filter set. The table is guarded by a single lock for
//! add/remove/snapshot; fan-out always iterates a snapshot taken under the
//! lock and performs network I/O after releasing it, so a slow subscriber
//! cannot stall new connections or unrelated publishes.

use super::topics::topic_matches;
use crate::net::crypto::SessionCipher;
use crate::protocol::{ApplicationMessage, ProtocolKind};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Sends queue depth per connection. Sends beyond this bound fail fast
/// instead of letting one dead subscriber pin fan-out memory.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// One live connection's record.
pub struct Session {
    id: u64,
    pub client_id: String,
    pub username: Option<String>,
    pub kind: ProtocolKind,
    pub peer: SocketAddr,
    keep_alive: u16,
    /// Established during the handshake, before the session exists;
    /// read-only for the connection's lifetime.
    cipher: Option<SessionCipher>,
    outbound: mpsc::Sender<Vec<u8>>,
    filters: Mutex<BTreeSet<String>>,
    last_active: Mutex<Instant>,
    /// QoS2 publishes parked between receipt and release.
    awaiting_release: Mutex<HashMap<u16, ApplicationMessage>>,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cipher(&self) -> Option<&SessionCipher> {
        self.cipher.as_ref()
    }

    pub fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    /// Enqueue a pre-encoded frame on this connection's serialized writer.
    /// Failure means the connection is gone or hopelessly backed up; callers
    /// treat it as a per-session delivery failure, never a fan-out abort.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), SessionSendError> {
        self.outbound
            .try_send(frame)
            .map_err(|_| SessionSendError(self.id))
    }

    /// Ask the writer task to shut the socket down. An empty frame is the
    /// agreed close sentinel; if the queue is full or closed the writer is
    /// already on its way out.
    pub fn request_close(&self) {
        let _ = self.outbound.try_send(Vec::new());
    }

    /// Record inbound activity for the keep-alive sweep.
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    /// Whether the negotiated keep-alive window has been exceeded. The sweep
    /// allows a half-interval of grace so a client pinging exactly on the
    /// interval never gets evicted by scheduling jitter.
    pub fn keep_alive_expired(&self) -> bool {
        if self.keep_alive == 0 {
            return false;
        }
        let window = Duration::from_millis(u64::from(self.keep_alive) * 1500);
        self.idle_for() > window
    }

    pub fn add_filters(&self, filters: &[String]) {
        let mut set = self.filters.lock();
        for filter in filters {
            set.insert(filter.clone());
        }
    }

    pub fn remove_filters(&self, filters: &[String]) {
        let mut set = self.filters.lock();
        for filter in filters {
            set.remove(filter);
        }
    }

    pub fn filters(&self) -> Vec<String> {
        self.filters.lock().iter().cloned().collect()
    }

    /// Whether any of this session's filters matches the topic.
    pub fn subscribed_to(&self, topic: &str, wildcards_enabled: bool) -> bool {
        let set = self.filters.lock();
        set.iter().any(|filter| {
            if wildcards_enabled {
                topic_matches(filter, topic)
            } else {
                filter == topic
            }
        })
    }

    pub fn park_release(&self, msg: ApplicationMessage) {
        self.awaiting_release.lock().insert(msg.message_id, msg);
    }

    pub fn take_release(&self, message_id: u16) -> Option<ApplicationMessage> {
        self.awaiting_release.lock().remove(&message_id)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("kind", &self.kind)
            .field("peer", &self.peer)
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("session {0} outbound queue closed or full")]
pub struct SessionSendError(pub u64);

/// Lifecycle notifications for collaborators. One well-defined call per
/// event; handler panics are the handler's problem, not swallowed multicast.
pub trait SessionHooks: Send + Sync {
    fn client_connected(&self, _session: &Session) {}
    fn client_disconnected(&self, _session: &Session) {}
}

/// Default no-op hooks.
pub struct NoopHooks;

impl SessionHooks for NoopHooks {}

/// Everything needed to admit a session into the table.
pub struct SessionSeed {
    pub client_id: String,
    pub username: Option<String>,
    pub kind: ProtocolKind,
    pub peer: SocketAddr,
    pub keep_alive: u16,
    pub cipher: Option<SessionCipher>,
    pub outbound: mpsc::Sender<Vec<u8>>,
}

/// Registry of live sessions.
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, seed: SessionSeed) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(Session {
            id,
            client_id: seed.client_id,
            username: seed.username,
            kind: seed.kind,
            peer: seed.peer,
            keep_alive: seed.keep_alive,
            cipher: seed.cipher,
            outbound: seed.outbound,
            filters: Mutex::new(BTreeSet::new()),
            last_active: Mutex::new(Instant::now()),
            awaiting_release: Mutex::new(HashMap::new()),
        });
        self.sessions.lock().insert(id, session.clone());
        session
    }

    /// Remove a session. Idempotent: the second removal of the same id
    /// returns `None` rather than erroring, so racing socket-close and
    /// read-failure paths cannot double-fire teardown.
    pub fn remove(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.lock().remove(&id)
    }

    /// Snapshot the live sessions for fan-out. Taken under the table lock;
    /// callers do their I/O after this returns.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn seed(table: &SessionTable) -> Arc<Session> {
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        table.insert(SessionSeed {
            client_id: "c1".into(),
            username: None,
            kind: ProtocolKind::PubSub,
            peer: "127.0.0.1:1".parse().unwrap(),
            keep_alive: 10,
            cipher: None,
            outbound: tx,
        })
    }

    #[test]
    fn removal_is_idempotent() {
        let table = SessionTable::new();
        let session = seed(&table);
        assert_eq!(table.len(), 1);
        assert!(table.remove(session.id()).is_some());
        assert!(table.remove(session.id()).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn disconnect_hook_fires_once_under_racing_removal() {
        struct Counting(AtomicUsize);
        impl SessionHooks for Counting {
            fn client_disconnected(&self, _session: &Session) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let table = SessionTable::new();
        let session = seed(&table);
        let hooks = Counting(AtomicUsize::new(0));

        // Both teardown paths race; only the one that actually removed the
        // session fires the hook.
        for _ in 0..2 {
            if let Some(removed) = table.remove(session.id()) {
                hooks.client_disconnected(&removed);
            }
        }
        assert_eq!(hooks.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscription_matching_respects_wildcard_flag() {
        let table = SessionTable::new();
        let session = seed(&table);
        session.add_filters(&["a/+".to_string(), "exact".to_string()]);
        assert!(session.subscribed_to("a/b", true));
        assert!(!session.subscribed_to("a/b", false));
        assert!(session.subscribed_to("exact", false));
        session.remove_filters(&["a/+".to_string()]);
        assert!(!session.subscribed_to("a/b", true));
    }

    #[test]
    fn keep_alive_zero_never_expires() {
        let (tx, _rx) = mpsc::channel(1);
        let table = SessionTable::new();
        let session = table.insert(SessionSeed {
            client_id: "c".into(),
            username: None,
            kind: ProtocolKind::PubSub,
            peer: "127.0.0.1:1".parse().unwrap(),
            keep_alive: 0,
            cipher: None,
            outbound: tx,
        });
        assert!(!session.keep_alive_expired());
    }

    #[test]
    fn parked_release_is_taken_once() {
        let table = SessionTable::new();
        let session = seed(&table);
        let msg = ApplicationMessage {
            topic: "t".into(),
            payload: b"x".to_vec(),
            qos: crate::protocol::Qos::ExactlyOnce,
            retain: false,
            message_id: 9,
        };
        session.park_release(msg.clone());
        assert_eq!(session.take_release(9), Some(msg));
        assert_eq!(session.take_release(9), None);
    }
}
