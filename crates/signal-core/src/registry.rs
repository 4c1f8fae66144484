use std::collections::{BTreeSet, HashMap};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::envelope::{Envelope, PeerId, PeerRole, SessionId};
use crate::error::{SignalError, SignalResult};
use crate::negotiation::{NegotiationRecord, NegotiationState, PairKey};

pub const LEAVE_DISCONNECTED: &str = "disconnected";
pub const LEAVE_REQUESTED: &str = "left";
pub const LEAVE_IDLE_TIMEOUT: &str = "idle-timeout";

/// Returned by [`SessionRegistry::register`]. The outbound receiver must be
/// drained by exactly one writer task so per-peer ordering holds.
#[derive(Debug)]
pub struct PeerHandle {
    pub peer_id: PeerId,
    pub session_id: SessionId,
    pub outbound: mpsc::UnboundedReceiver<Envelope>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub peer_id: PeerId,
    pub session_id: SessionId,
    pub remaining: usize,
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub members: Vec<PeerSnapshot>,
    pub negotiations: usize,
    pub idle_millis: u64,
}

#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub role: PeerRole,
    pub joined_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: DashMap<SessionId, Arc<Session>>,
    peers: DashMap<PeerId, SessionId>,
    config: RelayConfig,
}

impl SessionRegistry {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                peers: DashMap::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn register(&self, session_id: &str, peer_id: &str) -> SignalResult<PeerHandle> {
        if peer_id.is_empty() {
            return Err(SignalError::InvalidPeerId(session_id.to_string()));
        }
        // Reserve the peer id first so concurrent registrations cannot both win.
        match self.inner.peers.entry(peer_id.to_string()) {
            Entry::Occupied(_) => return Err(SignalError::DuplicatePeer(peer_id.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(session_id.to_string());
            }
        }

        let cap = self.inner.config.member_cap;
        loop {
            let session = match self.inner.sessions.entry(session_id.to_string()) {
                Entry::Occupied(entry) => Arc::clone(entry.get()),
                Entry::Vacant(entry) => {
                    let session = Arc::new(Session::new(session_id.to_string()));
                    entry.insert(Arc::clone(&session));
                    session
                }
            };

            let mut members = session.members.lock();
            if members.closed {
                // Lost a race with garbage collection; pick up a fresh session.
                drop(members);
                self.inner
                    .sessions
                    .remove_if(session_id, |_, current| Arc::ptr_eq(current, &session));
                continue;
            }

            if members.peers.len() >= cap {
                let emptied = members.peers.is_empty();
                if emptied {
                    members.closed = true;
                }
                drop(members);
                if emptied {
                    self.inner
                        .sessions
                        .remove_if(session_id, |_, current| Arc::ptr_eq(current, &session));
                }
                self.inner.peers.remove(peer_id);
                warn!(session_id = %session_id, peer_id = %peer_id, cap, "session full");
                return Err(SignalError::SessionFull {
                    session_id: session_id.to_string(),
                    cap,
                });
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let existing = members.sorted_ids();
            let join = Envelope::join(session_id, peer_id, &existing);
            for entry in members.peers.values() {
                let _ = entry.tx.send(join.clone());
            }
            let _ = tx.send(join);
            members.peers.insert(
                peer_id.to_string(),
                PeerEntry {
                    role: PeerRole::Unassigned,
                    tx,
                    joined_at: Utc::now(),
                },
            );
            let size = members.peers.len();
            drop(members);

            session.touch();
            self.publish_gauges();
            info!(
                session_id = %session_id,
                peer_id = %peer_id,
                members = size,
                "peer registered"
            );

            return Ok(PeerHandle {
                peer_id: peer_id.to_string(),
                session_id: session_id.to_string(),
                outbound: rx,
            });
        }
    }

    /// Removes a peer after its transport closed. Unknown peers are ignored.
    pub fn unregister(&self, peer_id: &str) -> Option<Departure> {
        self.unregister_with_reason(peer_id, LEAVE_DISCONNECTED)
    }

    pub fn unregister_with_reason(&self, peer_id: &str, reason: &str) -> Option<Departure> {
        let (_, session_id) = self.inner.peers.remove(peer_id)?;
        let Some(session) = self.session(&session_id) else {
            warn!(session_id = %session_id, peer_id = %peer_id, "peer indexed without session");
            return None;
        };

        let (remaining, emptied) = {
            let mut members = session.members.lock();
            members.peers.remove(peer_id);
            let leave = Envelope::leave(&session_id, peer_id, reason);
            for entry in members.peers.values() {
                let _ = entry.tx.send(leave.clone());
            }
            let remaining = members.peers.len();
            if remaining == 0 {
                members.closed = true;
            }
            (remaining, remaining == 0)
        };

        let dropped = session.fail_negotiations_with(peer_id);

        if emptied {
            self.inner
                .sessions
                .remove_if(&session_id, |_, current| Arc::ptr_eq(current, &session));
            debug!(session_id = %session_id, "session emptied");
        }
        self.publish_gauges();
        info!(
            session_id = %session_id,
            peer_id = %peer_id,
            reason,
            remaining,
            dropped_candidates = dropped,
            "peer unregistered"
        );

        Some(Departure {
            peer_id: peer_id.to_string(),
            session_id,
            remaining,
        })
    }

    pub fn members_of(&self, session_id: &str) -> BTreeSet<PeerId> {
        self.session(session_id)
            .map(|session| session.members.lock().peers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn session_of(&self, peer_id: &str) -> Option<SessionId> {
        self.inner.peers.get(peer_id).map(|entry| entry.value().clone())
    }

    pub fn role_of(&self, peer_id: &str) -> Option<PeerRole> {
        let session = self.session_for_peer(peer_id)?;
        let members = session.members.lock();
        members.peers.get(peer_id).map(|entry| entry.role)
    }

    pub fn negotiation_state(&self, a: &str, b: &str) -> Option<NegotiationState> {
        let session = self.session_for_peer(a)?;
        let record = session
            .negotiations
            .get(&PairKey::new(a, b))
            .map(|entry| Arc::clone(entry.value()))?;
        let state = record.lock().state();
        Some(state)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let now = now_millis();

        let mut snapshots: Vec<SessionSnapshot> = sessions
            .into_iter()
            .map(|session| {
                let mut members: Vec<PeerSnapshot> = session
                    .members
                    .lock()
                    .peers
                    .iter()
                    .map(|(peer_id, entry)| PeerSnapshot {
                        peer_id: peer_id.clone(),
                        role: entry.role,
                        joined_at: entry.joined_at,
                    })
                    .collect();
                members.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
                SessionSnapshot {
                    session_id: session.id.clone(),
                    members,
                    negotiations: session.negotiations.len(),
                    idle_millis: now.saturating_sub(session.last_activity()),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        snapshots
    }

    /// Evicts every member of sessions idle for longer than the configured
    /// expiry. Returns the number of peers removed.
    pub fn expire_idle(&self, now: u64) -> usize {
        let expiry = self.inner.config.idle_session_expiry.as_millis() as u64;
        let idle: Vec<Arc<Session>> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| now.saturating_sub(entry.value().last_activity()) > expiry)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut evicted = 0usize;
        for session in idle {
            let peers = session.members.lock().sorted_ids();
            for peer_id in peers {
                if self
                    .unregister_with_reason(&peer_id, LEAVE_IDLE_TIMEOUT)
                    .is_some()
                {
                    evicted += 1;
                }
            }
            counter!("signal_sessions_expired_total", 1);
            info!(session_id = %session.id, "idle session expired");
        }
        evicted
    }

    pub fn spawn_recycler(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.recycle_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let _ = registry.expire_idle(now_millis());
            }
        })
    }

    pub(crate) fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn session_for_peer(&self, peer_id: &str) -> Option<Arc<Session>> {
        let session_id = self.session_of(peer_id)?;
        self.session(&session_id)
    }

    fn publish_gauges(&self) {
        gauge!("signal_sessions_active", self.inner.sessions.len() as f64);
        gauge!("signal_peers_active", self.inner.peers.len() as f64);
    }
}

/// Membership and negotiation state of one session. Membership and each
/// negotiation record sit behind their own locks; a record lock may be held
/// while taking the membership lock, never the other way round.
pub(crate) struct Session {
    id: SessionId,
    members: Mutex<Members>,
    negotiations: DashMap<PairKey, Arc<Mutex<NegotiationRecord>>>,
    last_activity: AtomicU64,
}

struct Members {
    peers: HashMap<PeerId, PeerEntry>,
    closed: bool,
}

impl Members {
    fn sorted_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

struct PeerEntry {
    role: PeerRole,
    tx: mpsc::UnboundedSender<Envelope>,
    joined_at: DateTime<Utc>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            members: Mutex::new(Members {
                peers: HashMap::new(),
                closed: false,
            }),
            negotiations: DashMap::new(),
            last_activity: AtomicU64::new(now_millis()),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub(crate) fn contains(&self, peer_id: &str) -> bool {
        self.members.lock().peers.contains_key(peer_id)
    }

    /// Other members, sorted so broadcast fan-out is deterministic.
    pub(crate) fn members_except(&self, peer_id: &str) -> Vec<PeerId> {
        let members = self.members.lock();
        members
            .sorted_ids()
            .into_iter()
            .filter(|id| id != peer_id)
            .collect()
    }

    /// Enqueues without waiting for the writer.
    pub(crate) fn deliver(&self, peer_id: &str, envelope: Envelope) -> SignalResult<()> {
        let members = self.members.lock();
        let entry = members
            .peers
            .get(peer_id)
            .ok_or_else(|| SignalError::UnknownPeer(peer_id.to_string()))?;
        entry
            .tx
            .send(envelope)
            .map_err(|_| SignalError::TransportClosed(peer_id.to_string()))
    }

    pub(crate) fn set_role(&self, peer_id: &str, role: PeerRole) {
        if let Some(entry) = self.members.lock().peers.get_mut(peer_id) {
            entry.role = role;
        }
    }

    pub(crate) fn record(&self, key: &PairKey) -> Arc<Mutex<NegotiationRecord>> {
        let entry = self
            .negotiations
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(NegotiationRecord::new(key.clone()))));
        Arc::clone(entry.value())
    }

    pub(crate) fn discard_record(&self, key: &PairKey, record: &Arc<Mutex<NegotiationRecord>>) {
        self.negotiations
            .remove_if(key, |_, current| Arc::ptr_eq(current, record));
    }

    fn fail_negotiations_with(&self, peer_id: &str) -> usize {
        let keys: Vec<PairKey> = self
            .negotiations
            .iter()
            .filter(|entry| entry.key().contains(peer_id))
            .map(|entry| entry.key().clone())
            .collect();

        let mut dropped = 0usize;
        for key in keys {
            if let Some((_, record)) = self.negotiations.remove(&key) {
                dropped += record.lock().fail();
            }
        }
        dropped
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
