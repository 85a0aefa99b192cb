//! Session registry.
//!
//! Every relayed flow is one session: created on the accept path, run as a
//! single task on the worker pool, removed when its close path completes.
//! The registry keeps sessions in insertion order so the oldest can be told
//! to terminate when the configured limit is exceeded; termination is a
//! cancellation flag each session polls at the top of its loop.

pub mod tcp;
pub mod udp;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, warn};

pub use tcp::TcpSession;
pub use udp::UdpSession;

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowProto {
    Tcp,
    Udp,
}

/// 5-tuple key (protocol + source + destination) identifying one flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub proto: FlowProto,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.proto {
            FlowProto::Tcp => "tcp",
            FlowProto::Udp => "udp",
        };
        write!(f, "{} {} -> {}", proto, self.src, self.dst)
    }
}

struct SessionEntry {
    key: FlowKey,
    cancel: Arc<AtomicBool>,
    created_at: Instant,
}

#[derive(Default)]
struct RegistryInner {
    flows: HashMap<FlowKey, SessionId>,
    /// Insertion-ordered: BTreeMap over the monotonically increasing id.
    sessions: BTreeMap<SessionId, SessionEntry>,
    next_id: SessionId,
}

pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    /// 0 disables the limit.
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            max_sessions,
        }
    }

    /// Register a new session for `key`. When the configured maximum is
    /// exceeded the session is still created, but the oldest live session is
    /// marked for termination.
    pub fn insert(&self, key: FlowKey) -> (SessionId, Arc<AtomicBool>) {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let id = inner.next_id;
        inner.next_id += 1;
        inner.flows.insert(key, id);
        inner.sessions.insert(
            id,
            SessionEntry {
                key,
                cancel: Arc::clone(&cancel),
                created_at: Instant::now(),
            },
        );

        if self.max_sessions > 0 && inner.sessions.len() > self.max_sessions {
            // Oldest first: the BTreeMap's first entry has the lowest id.
            if let Some((&oldest_id, entry)) = inner.sessions.iter().next() {
                warn!(
                    session = oldest_id,
                    flow = %entry.key,
                    age_ms = entry.created_at.elapsed().as_millis() as u64,
                    limit = self.max_sessions,
                    "session limit exceeded, terminating oldest session"
                );
                entry.cancel.store(true, Ordering::Release);
            }
        }

        debug!(session = id, flow = %key, total = inner.sessions.len(), "session registered");
        (id, cancel)
    }

    pub fn remove(&self, id: SessionId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.sessions.remove(&id) {
            // Only clear the flow mapping if it still points at us; a new
            // session may have reclaimed the key after our cancellation.
            if inner.flows.get(&entry.key) == Some(&id) {
                inner.flows.remove(&entry.key);
            }
            debug!(session = id, flow = %entry.key, total = inner.sessions.len(), "session removed");
        }
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .flows
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sessions
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tell every live session to terminate (shutdown path).
    pub fn cancel_all(&self) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for entry in inner.sessions.values() {
            entry.cancel.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(port: u16) -> FlowKey {
        FlowKey {
            proto: FlowProto::Tcp,
            src: format!("10.0.0.2:{}", port).parse().unwrap(),
            dst: "1.1.1.1:443".parse().unwrap(),
        }
    }

    #[test]
    fn insert_and_remove_track_count() {
        let registry = SessionRegistry::new(0);
        let (id1, _c1) = registry.insert(key(1000));
        let (id2, _c2) = registry.insert(key(1001));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(&key(1000)));

        registry.remove(id1);
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(&key(1000)));
        registry.remove(id2);
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = SessionRegistry::new(0);
        let (id, _cancel) = registry.insert(key(1));
        registry.remove(id);
        registry.remove(id);
        assert!(registry.is_empty());
    }

    #[test]
    fn limit_marks_oldest_for_termination() {
        let registry = SessionRegistry::new(2);
        let (_id1, cancel1) = registry.insert(key(1));
        let (_id2, cancel2) = registry.insert(key(2));
        assert!(!cancel1.load(Ordering::Acquire));

        // Third session exceeds the limit: still created, oldest flagged.
        let (_id3, cancel3) = registry.insert(key(3));
        assert_eq!(registry.len(), 3);
        assert!(cancel1.load(Ordering::Acquire));
        assert!(!cancel2.load(Ordering::Acquire));
        assert!(!cancel3.load(Ordering::Acquire));
    }

    #[test]
    fn cancel_all_flags_every_session() {
        let registry = SessionRegistry::new(0);
        let (_i1, c1) = registry.insert(key(1));
        let (_i2, c2) = registry.insert(key(2));
        registry.cancel_all();
        assert!(c1.load(Ordering::Acquire));
        assert!(c2.load(Ordering::Acquire));
    }
}
