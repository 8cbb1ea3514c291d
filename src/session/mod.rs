//! Session management
//!
//! A session records what must outlive a socket: the connection parameters
//! captured at CONNECT, the client's subscription filters, the pending
//! queue for offline delivery, and the qos bookkeeping for both directions.
//! Sessions for clean-start=false clients survive disconnects and are
//! consumed on the next CONNECT of the same client id.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::broker::PipeId;
use crate::protocol::{ProtocolVersion, Publish, QoS, Will};

/// Session expiry sentinel: never expires (v3.1.1 persistent sessions)
pub const EXPIRY_NEVER: u32 = u32::MAX;

/// Per-connection identity captured at CONNECT time.
///
/// Held as `Arc<ConnParam>` because delivery paths outlive the socket: the
/// will publish and the connect notification consult these fields after the
/// pipe is gone, and cached sessions keep them until the client returns.
#[derive(Debug, Clone)]
pub struct ConnParam {
    pub client_id: Arc<str>,
    pub protocol_version: ProtocolVersion,
    pub clean_start: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    pub will: Option<Will>,
}

/// Outbound qos 2 handshake phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2Phase {
    /// PUBLISH sent, waiting for PUBREC
    AwaitingPubRec,
    /// PUBREL sent, waiting for PUBCOMP
    AwaitingPubComp,
}

/// An outbound qos>0 message awaiting acknowledgement
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub publish: Publish,
    /// None for qos 1
    pub phase: Option<Qos2Phase>,
    pub sent_at: Instant,
    pub retries: u32,
}

/// Per-client session state
#[derive(Debug)]
pub struct Session {
    pub client_id: Arc<str>,
    pub cparam: Arc<ConnParam>,
    /// Pipe id at the most recent connect
    pub pipe: PipeId,
    pub connected: bool,
    /// Seconds after disconnect until the session may be dropped;
    /// `EXPIRY_NEVER` keeps it for the life of the process.
    pub session_expiry: u32,
    pub disconnected_at: Option<Instant>,
    /// filter -> granted qos
    pub subscriptions: AHashMap<String, QoS>,
    /// Messages queued while the client is away, oldest first
    pub pending: VecDeque<Publish>,
    max_pending: usize,
    /// Outbound qos 1/2 awaiting PUBACK/PUBREC/PUBCOMP
    pub inflight_out: AHashMap<u16, InflightMessage>,
    /// Inbound qos 2 held until PUBREL
    pub inflight_in: AHashMap<u16, Publish>,
    next_packet_id: u16,
}

impl Session {
    pub fn new(cparam: Arc<ConnParam>, pipe: PipeId, session_expiry: u32, max_pending: usize) -> Self {
        Self {
            client_id: cparam.client_id.clone(),
            cparam,
            pipe,
            connected: true,
            session_expiry,
            disconnected_at: None,
            subscriptions: AHashMap::new(),
            pending: VecDeque::new(),
            max_pending,
            inflight_out: AHashMap::with_capacity(8),
            inflight_in: AHashMap::with_capacity(8),
            next_packet_id: 1,
        }
    }

    /// Allocate the next free packet identifier (non-zero, skips ids that
    /// are still in flight in either direction)
    pub fn next_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }
            if !self.inflight_out.contains_key(&id) && !self.inflight_in.contains_key(&id) {
                return id;
            }
        }
    }

    /// Queue a message for delivery after reconnect. The queue is bounded
    /// by `msq_len`; returns true when an older message was dropped.
    pub fn queue_pending(&mut self, publish: Publish) -> bool {
        let dropped = if self.max_pending > 0 && self.pending.len() >= self.max_pending {
            self.pending.pop_front();
            true
        } else {
            false
        };
        self.pending.push_back(publish);
        dropped
    }

    /// Take the pending queue, oldest first
    pub fn drain_pending(&mut self) -> VecDeque<Publish> {
        std::mem::take(&mut self.pending)
    }

    pub fn add_subscription(&mut self, filter: String, qos: QoS) {
        self.subscriptions.insert(filter, qos);
    }

    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }

    pub fn is_expired(&self) -> bool {
        if self.connected || self.session_expiry == EXPIRY_NEVER {
            return false;
        }
        if self.session_expiry == 0 {
            return true;
        }
        match self.disconnected_at {
            Some(at) => at.elapsed().as_secs() >= self.session_expiry as u64,
            None => false,
        }
    }
}

/// Store of all sessions, keyed by client id; at most one per client
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Activate a session for a fresh CONNECT. Returns the session and
    /// whether cached state was resumed. Clean-start discards any cached
    /// session; otherwise a live, unexpired cache is consumed in place.
    pub fn activate(
        &self,
        cparam: Arc<ConnParam>,
        pipe: PipeId,
        session_expiry: u32,
        max_pending: usize,
    ) -> (Arc<RwLock<Session>>, bool) {
        let client_id = cparam.client_id.clone();

        if !cparam.clean_start {
            if let Some(existing) = self.sessions.get(&client_id) {
                let session = existing.clone();
                drop(existing);
                let mut s = session.write();
                if !s.is_expired() {
                    s.connected = true;
                    s.pipe = pipe;
                    s.cparam = cparam;
                    s.session_expiry = session_expiry;
                    s.disconnected_at = None;
                    drop(s);
                    return (session, true);
                }
            }
        }

        let session = Arc::new(RwLock::new(Session::new(
            cparam,
            pipe,
            session_expiry,
            max_pending,
        )));
        self.sessions.insert(client_id, session.clone());
        (session, false)
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    pub fn remove(&self, client_id: &str) {
        self.sessions.remove(client_id);
    }

    /// Mark the session behind `pipe` disconnected. A stale teardown (the
    /// client already reconnected on a newer pipe) is a no-op.
    pub fn disconnect(&self, client_id: &str, pipe: PipeId) {
        let drop_now = match self.sessions.get(client_id) {
            Some(session) => {
                let mut s = session.write();
                if s.pipe != pipe {
                    return;
                }
                s.connected = false;
                s.disconnected_at = Some(Instant::now());
                s.session_expiry == 0
            }
            None => false,
        };

        if drop_now {
            self.sessions.remove(client_id);
        }
    }

    /// Remove sessions whose expiry has elapsed, returning each dropped
    /// session's client id and filters so the caller can clear the
    /// detached topic-index entries. Driven by the qos timer.
    pub fn take_expired(&self) -> Vec<(Arc<str>, Vec<String>)> {
        let mut expired = Vec::new();
        self.sessions.retain(|client_id, session| {
            let s = session.read();
            if s.is_expired() {
                expired.push((client_id.clone(), s.subscriptions.keys().cloned().collect()));
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn cparam(client_id: &str, clean_start: bool) -> Arc<ConnParam> {
        Arc::new(ConnParam {
            client_id: client_id.into(),
            protocol_version: ProtocolVersion::V311,
            clean_start,
            keep_alive: 60,
            username: None,
            will: None,
        })
    }

    fn publish(payload: &str) -> Publish {
        Publish {
            topic: "t".into(),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
            ..Default::default()
        }
    }

    #[test]
    fn packet_ids_skip_inflight_and_zero() {
        let mut session = Session::new(cparam("c", true), 1, 0, 16);
        session.next_packet_id = u16::MAX;

        let id = session.next_packet_id();
        assert_eq!(id, u16::MAX);
        // wraps past 0
        assert_eq!(session.next_packet_id(), 1);

        session.inflight_out.insert(
            2,
            InflightMessage {
                publish: publish("x"),
                phase: None,
                sent_at: Instant::now(),
                retries: 0,
            },
        );
        assert_eq!(session.next_packet_id(), 3);
    }

    #[test]
    fn pending_queue_drops_oldest_at_capacity() {
        let mut session = Session::new(cparam("c", false), 1, EXPIRY_NEVER, 2);
        assert!(!session.queue_pending(publish("a")));
        assert!(!session.queue_pending(publish("b")));
        assert!(session.queue_pending(publish("c")));

        let drained: Vec<_> = session
            .drain_pending()
            .into_iter()
            .map(|p| p.payload)
            .collect();
        assert_eq!(drained, vec![Bytes::from("b"), Bytes::from("c")]);
        assert!(session.pending.is_empty());
    }

    #[test]
    fn clean_start_discards_cached_session() {
        let store = SessionStore::new();
        let (session, resumed) = store.activate(cparam("x1", false), 1, EXPIRY_NEVER, 16);
        assert!(!resumed);
        session.write().add_subscription("alerts/#".into(), QoS::AtLeastOnce);
        store.disconnect("x1", 1);

        let (_, resumed) = store.activate(cparam("x1", true), 2, 0, 16);
        assert!(!resumed);
        let fresh = store.get("x1").unwrap();
        assert!(fresh.read().subscriptions.is_empty());
    }

    #[test]
    fn persistent_session_resumes_with_new_pipe() {
        let store = SessionStore::new();
        let (session, _) = store.activate(cparam("x1", false), 1, EXPIRY_NEVER, 16);
        session.write().queue_pending(publish("kept"));
        store.disconnect("x1", 1);

        let (session, resumed) = store.activate(cparam("x1", false), 9, EXPIRY_NEVER, 16);
        assert!(resumed);
        let mut s = session.write();
        assert_eq!(s.pipe, 9);
        assert!(s.connected);
        assert_eq!(s.drain_pending().len(), 1);
    }

    #[test]
    fn stale_disconnect_does_not_touch_resumed_session() {
        let store = SessionStore::new();
        store.activate(cparam("x1", false), 1, EXPIRY_NEVER, 16);
        // client reconnected on pipe 2 before the old task tore down
        store.activate(cparam("x1", false), 2, EXPIRY_NEVER, 16);
        store.disconnect("x1", 1);

        assert!(store.get("x1").unwrap().read().connected);
    }

    #[test]
    fn zero_expiry_drops_session_at_disconnect() {
        let store = SessionStore::new();
        store.activate(cparam("gone", true), 4, 0, 16);
        store.disconnect("gone", 4);
        assert!(store.get("gone").is_none());
    }

    #[test]
    fn sweep_returns_elapsed_v5_sessions_with_their_filters() {
        let store = SessionStore::new();
        let (session, _) = store.activate(cparam("v5", false), 1, 1, 16);
        {
            let mut s = session.write();
            s.add_subscription("alerts/#".into(), QoS::AtLeastOnce);
            s.connected = false;
            s.disconnected_at = Some(Instant::now() - Duration::from_secs(5));
        }
        let expired = store.take_expired();
        assert!(store.is_empty());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0.as_ref(), "v5");
        assert_eq!(expired[0].1, vec!["alerts/#".to_string()]);
    }
}
