use crate::connection::PeerId;
use crate::peer::Peer;
use std::collections::HashMap;
use tracing::debug;

/// In-memory pool of active peers, owned by the peer group.
#[derive(Default)]
pub struct PeerManager {
    peers: HashMap<PeerId, Peer>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, peer: Peer) {
        debug!("Added peer {} ({} total)", peer.id(), self.peers.len() + 1);
        self.peers.insert(peer.id(), peer);
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<Peer> {
        self.peers.remove(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn total_count(&self) -> usize {
        self.peers.len()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn connected(&self) -> Vec<&Peer> {
        self.peers.values().filter(|p| p.is_connected()).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_connected()).count()
    }

    /// Connected peers by ascending connection latency; the slowest is last
    pub fn sorted_by_latency(&self) -> Vec<&Peer> {
        let mut peers = self.connected();
        peers.sort_by_key(|p| p.connection_latency());
        peers
    }

    pub fn slowest(&self) -> Option<PeerId> {
        self.sorted_by_latency().last().map(|p| p.id())
    }

    /// Connected peers with an empty task queue
    pub fn ready(&self) -> Vec<&Peer> {
        self.peers.values().filter(|p| p.is_ready()).collect()
    }
}
