use crate::id_types::PeerId;
use crate::peer_session::PeerSession;
use crate::types::{ArrivalSender, PeerMap};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

const ARRIVAL_BUFFER: usize = 64;

/// Represents a connected remote peer
#[derive(Clone)]
pub struct Peer {
    pub peer_id: PeerId,
    pub description: String,
    pub session: Arc<PeerSession>,
    /// True when we sent the offer
    pub is_initiator: bool,
}

impl Peer {
    pub fn new(
        peer_id: PeerId,
        description: impl Into<String>,
        session: Arc<PeerSession>,
        is_initiator: bool,
    ) -> Self {
        Peer {
            peer_id,
            description: description.into(),
            session,
            is_initiator,
        }
    }
}

/// Peers whose negotiation completed. Entries only ever appear here on
/// success, and removal is keyed on the session so a stale callback can
/// never evict a newer session for the same id.
pub struct PeerRegistry {
    peers: PeerMap,
    arrivals: ArrivalSender,
}

impl PeerRegistry {
    pub fn new() -> Self {
        let (arrivals, _) = broadcast::channel(ARRIVAL_BUFFER);
        PeerRegistry {
            peers: Arc::new(DashMap::new()),
            arrivals,
        }
    }

    /// Registers `peer`, returning the entry it replaced, if any.
    pub fn insert(&self, peer: Peer) -> Option<Peer> {
        let peer_id = peer.peer_id.clone();
        let replaced = self.peers.insert(peer_id.clone(), peer);
        let _ = self.arrivals.send(peer_id);
        replaced
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<Peer> {
        self.peers.get(peer_id).map(|p| p.value().clone())
    }

    pub fn session(&self, peer_id: &PeerId) -> Option<Arc<PeerSession>> {
        self.peers.get(peer_id).map(|p| p.session.clone())
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Removes `peer_id` only if it still maps to `session`.
    pub fn remove_if_session(&self, peer_id: &PeerId, session: &Arc<PeerSession>) -> Option<Peer> {
        self.peers
            .remove_if(peer_id, |_, p| Arc::ptr_eq(&p.session, session))
            .map(|(_, p)| p)
    }

    /// Removes and returns every peer.
    pub fn drain(&self) -> Vec<Peer> {
        let ids: Vec<PeerId> = self.peers.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter_map(|id| self.peers.remove(id).map(|(_, p)| p))
            .collect()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.peers.iter().map(|e| e.session.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Waits up to `timeout` for `peer_id` to be registered.
    pub async fn wait_for(&self, peer_id: &PeerId, timeout: Duration) -> Option<Arc<PeerSession>> {
        // Subscribe before looking so an insert in between is not missed.
        let mut arrivals = self.arrivals.subscribe();
        if let Some(session) = self.session(peer_id) {
            return Some(session);
        }

        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, arrivals.recv()).await {
                Ok(Ok(arrived)) if &arrived != peer_id => continue,
                Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => {
                    if let Some(session) = self.session(peer_id) {
                        return Some(session);
                    }
                }
                Ok(Err(RecvError::Closed)) | Err(_) => return None,
            }
        }
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
