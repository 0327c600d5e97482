//! Initial block download: elects one sync peer at a time and drives the
//! hash discovery / merkle block fetch loop on it.
//!
//! The scheduler consumes [`PeerGroupEvent`]s on its own task and issues
//! work through the [`PeerGroupHandle`]. A sync peer's "ready" event is the
//! scheduling tick: every time its task queue drains, the next batch is
//! requested.

use crate::block_syncer::BlockSyncer;
use crate::config::SpeedThresholds;
use crate::connection::PeerId;
use crate::error::PeerError;
use crate::events::PeerGroupEvent;
use crate::message::Inventory;
use crate::peer::PeerInfo;
use crate::peer_group::PeerGroupHandle;
use crate::task::{GetBlockHashesTask, GetMerkleBlocksTask, TaskOutcome};
use spv_core::{MerkleBlock, MerkleBlockValidator};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A new peer this much faster than the sync peer replaces it
const PEER_SWITCH_FACTOR: f64 = 1.5;

/// Too-slow disconnects before the thresholds are relaxed
const SLOW_DISCONNECTS_BEFORE_RELAXING: u32 = 3;

const THRESHOLD_RELAX_FACTOR: f64 = 3.0;

/// Outbound sync progress notifications
pub trait SyncListener: Send + Sync {
    fn on_progress(&self, _current_height: u32, _peer_height: u32) {}
    fn on_peer_synced(&self, _peer: PeerId) {}
    fn on_peer_not_synced(&self, _peer: PeerId) {}
    fn on_all_peers_synced(&self) {}
}

#[derive(Debug, Clone)]
struct PeerView {
    latency: Duration,
    announced_height: u32,
    ready: bool,
    blocks_synced: bool,
    hashes_synced: bool,
}

impl PeerView {
    fn new(info: &PeerInfo) -> Self {
        Self {
            latency: info.connection_latency,
            announced_height: info.announced_height,
            ready: false,
            blocks_synced: false,
            hashes_synced: false,
        }
    }
}

pub struct InitialBlockDownload {
    syncer: BlockSyncer,
    group: PeerGroupHandle,
    validator: MerkleBlockValidator,
    thresholds: SpeedThresholds,
    slow_disconnects: u32,
    peers: HashMap<PeerId, PeerView>,
    sync_peer: Option<PeerId>,
    select_new_peer: bool,
    listener: Option<Arc<dyn SyncListener>>,
}

impl InitialBlockDownload {
    pub fn new(
        syncer: BlockSyncer,
        group: PeerGroupHandle,
        validator: MerkleBlockValidator,
        thresholds: SpeedThresholds,
    ) -> Self {
        Self {
            syncer,
            group,
            validator,
            thresholds,
            slow_disconnects: 0,
            peers: HashMap::new(),
            sync_peer: None,
            select_new_peer: false,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn SyncListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn sync_peer(&self) -> Option<PeerId> {
        self.sync_peer
    }

    pub fn thresholds(&self) -> SpeedThresholds {
        self.thresholds
    }

    /// A faster peer arrived and replaces the sync peer on its next tick
    pub fn peer_switch_pending(&self) -> bool {
        self.select_new_peer
    }

    pub fn is_peer_synced(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).is_some_and(|v| v.blocks_synced)
    }

    pub fn syncer(&self) -> &BlockSyncer {
        &self.syncer
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<PeerGroupEvent>) {
        info!(
            "Starting initial block download from height {}",
            self.syncer.local_downloaded_best_height()
        );
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("Initial block download stopped");
    }

    pub fn handle_event(&mut self, event: PeerGroupEvent) {
        match event {
            PeerGroupEvent::Connected(info) => self.on_peer_connected(info),
            PeerGroupEvent::Disconnected { peer, error } => self.on_peer_disconnected(peer, error),
            PeerGroupEvent::Ready(peer) => self.on_peer_ready(peer),
            PeerGroupEvent::Busy(peer) => {
                if let Some(view) = self.peers.get_mut(&peer) {
                    view.ready = false;
                }
            }
            PeerGroupEvent::Inventory { peer, items } => self.on_inventory(peer, &items),
            PeerGroupEvent::MerkleBlock { peer, block } => self.on_merkle_block(peer, &block),
            PeerGroupEvent::TaskCompleted { peer, outcome } => self.on_task_completed(peer, outcome),
        }
    }

    fn on_peer_connected(&mut self, info: PeerInfo) {
        if let Some(current) = self.sync_peer.and_then(|id| self.peers.get(&id)) {
            if current.latency.as_secs_f64()
                > info.connection_latency.as_secs_f64() * PEER_SWITCH_FACTOR
            {
                info!(
                    "Peer {} ({:?}) is faster than sync peer ({:?}), switching",
                    info.id, info.connection_latency, current.latency
                );
                self.select_new_peer = true;
            }
        }
        self.peers.insert(info.id, PeerView::new(&info));
    }

    fn on_peer_ready(&mut self, peer: PeerId) {
        let Some(view) = self.peers.get_mut(&peer) else {
            return;
        };
        view.ready = true;

        match self.sync_peer {
            Some(sync_peer) if sync_peer == peer => self.download_blockchain(),
            Some(_) => {}
            None => self.assign_next_sync_peer(),
        }
    }

    fn on_peer_disconnected(&mut self, peer: PeerId, error: Option<PeerError>) {
        self.peers.remove(&peer);

        if error.as_ref().is_some_and(PeerError::is_too_slow) {
            self.slow_disconnects += 1;
            if self.slow_disconnects >= SLOW_DISCONNECTS_BEFORE_RELAXING {
                self.thresholds = self.thresholds.relaxed(THRESHOLD_RELAX_FACTOR);
                self.slow_disconnects = 0;
                info!("Relaxed merkle block speed thresholds to {:?}", self.thresholds);
            }
        }

        if self.sync_peer == Some(peer) {
            warn!("Sync peer {} disconnected, electing a new one", peer);
            self.sync_peer = None;
            self.select_new_peer = false;
            self.syncer.download_failed();
            self.assign_next_sync_peer();
        }
    }

    fn on_inventory(&mut self, peer: PeerId, items: &[Inventory]) {
        if !items.iter().any(Inventory::is_block) {
            return;
        }
        let Some(view) = self.peers.get_mut(&peer) else {
            return;
        };
        if view.blocks_synced {
            debug!("Synced peer {} announced new blocks", peer);
            view.blocks_synced = false;
            view.hashes_synced = false;
            if let Some(listener) = &self.listener {
                listener.on_peer_not_synced(peer);
            }
            self.assign_next_sync_peer();
        }
    }

    fn on_merkle_block(&mut self, peer: PeerId, block: &MerkleBlock) {
        match self.syncer.handle_merkle_block(block) {
            Ok(stored) => {
                if let Some(listener) = &self.listener {
                    let peer_height = self.peers.get(&peer).map_or(0, |v| v.announced_height);
                    listener.on_progress(stored.height, peer_height);
                }
            }
            Err(e) => {
                warn!("Failed to apply block {} from {}: {}", block.header_hash, peer, e);
                self.group.disconnect(peer, Some(PeerError::Chain(e)));
            }
        }
    }

    fn on_task_completed(&mut self, peer: PeerId, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::BlockHashes(hashes) => {
                if hashes.is_empty() {
                    if let Some(view) = self.peers.get_mut(&peer) {
                        view.hashes_synced = true;
                    }
                } else {
                    self.syncer.add_block_hashes(hashes);
                }
            }
            TaskOutcome::MerkleBlocks => {
                if self.syncer.download_iteration_completed() {
                    self.syncer.prepare_for_download();
                    // Unanchored hashes were dropped; rediscover them
                    if let Some(view) = self.peers.get_mut(&peer) {
                        view.hashes_synced = false;
                    }
                }
            }
            TaskOutcome::Transactions { .. } | TaskOutcome::TransactionSent { .. } => {}
        }
    }

    /// Elect the fastest ready, not yet synced peer if none is active.
    fn assign_next_sync_peer(&mut self) {
        if self.sync_peer.is_some() {
            return;
        }

        let mut candidates: Vec<(&PeerId, &PeerView)> = self
            .peers
            .iter()
            .filter(|(_, v)| !v.blocks_synced)
            .collect();
        if candidates.is_empty() {
            if !self.peers.is_empty() {
                info!("All {} peers synced", self.peers.len());
                if let Some(listener) = &self.listener {
                    listener.on_all_peers_synced();
                }
            }
            return;
        }

        candidates.sort_by_key(|(_, v)| v.latency);
        let Some(next) = candidates.iter().find(|(_, v)| v.ready).map(|(id, _)| **id) else {
            return;
        };

        info!("Selected sync peer {}", next);
        // Resets the hash queue to what the new peer will confirm
        self.syncer.download_started();
        self.sync_peer = Some(next);
        self.download_blockchain();
    }

    /// One scheduling tick on the sync peer.
    fn download_blockchain(&mut self) {
        let Some(peer) = self.sync_peer else {
            return;
        };
        if !self.peers.get(&peer).is_some_and(|v| v.ready) {
            return;
        }

        if self.select_new_peer {
            self.select_new_peer = false;
            self.sync_peer = None;
            self.assign_next_sync_peer();
            return;
        }

        let block_hashes = self.syncer.block_hashes();
        let local_known = self.syncer.local_known_best_height();
        let Some(view) = self.peers.get_mut(&peer) else {
            return;
        };

        if block_hashes.is_empty() {
            view.blocks_synced = view.hashes_synced;
        } else {
            debug!("Requesting {} merkle blocks from {}", block_hashes.len(), peer);
            view.ready = false;
            self.group.add_task(
                peer,
                GetMerkleBlocksTask::new(block_hashes, self.validator.clone(), self.thresholds),
            );
        }

        if !view.hashes_synced {
            let expected = view.announced_height.saturating_sub(local_known) as usize;
            let locator = self.syncer.block_locator_hashes(view.announced_height);
            view.ready = false;
            self.group
                .add_task(peer, GetBlockHashesTask::new(locator, expected));
        }

        if view.blocks_synced {
            info!("Sync peer {} fully synced", peer);
            self.syncer.download_completed();
            if let Some(listener) = &self.listener {
                listener.on_peer_synced(peer);
            }
            self.group.send_mempool(peer);
            self.sync_peer = None;
            self.assign_next_sync_peer();
        }
    }
}
