//! Fetches unconfirmed transactions announced by peers.

use crate::block_syncer::TransactionProcessor;
use crate::connection::PeerId;
use crate::events::PeerGroupEvent;
use crate::message::Inventory;
use crate::peer_group::PeerGroupHandle;
use crate::task::{RequestTransactionsTask, TaskOutcome};
use bitcoin::{Transaction, Txid};
use spv_core::ChainStorage;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Transaction relay statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MempoolStats {
    /// Transaction announcements received
    pub announcements_received: usize,
    /// Transactions requested from peers
    pub requests_sent: usize,
    /// Transactions received and processed
    pub transactions_received: usize,
    /// Announcements skipped as known or in flight
    pub duplicate_announcements: usize,
}

pub struct MempoolTransactions {
    storage: Arc<dyn ChainStorage>,
    processor: Arc<dyn TransactionProcessor>,
    group: PeerGroupHandle,
    /// Outstanding request batches per peer
    requests: HashMap<PeerId, Vec<Vec<Txid>>>,
    /// Relayed and not yet seen in a block
    relayed: HashSet<Txid>,
    stats: MempoolStats,
}

impl MempoolTransactions {
    pub fn new(
        storage: Arc<dyn ChainStorage>,
        processor: Arc<dyn TransactionProcessor>,
        group: PeerGroupHandle,
    ) -> Self {
        Self {
            storage,
            processor,
            group,
            requests: HashMap::new(),
            relayed: HashSet::new(),
            stats: MempoolStats::default(),
        }
    }

    pub fn stats(&self) -> &MempoolStats {
        &self.stats
    }

    pub fn in_flight(&self, txid: &Txid) -> bool {
        self.requests
            .values()
            .flatten()
            .any(|batch| batch.contains(txid))
    }

    pub fn relayed_count(&self) -> usize {
        self.relayed.len()
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<PeerGroupEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        info!("Mempool relay stopped: {:?}", self.stats);
    }

    pub fn handle_event(&mut self, event: PeerGroupEvent) {
        match event {
            PeerGroupEvent::Inventory { peer, items } => self.on_inventory(peer, &items),
            PeerGroupEvent::TaskCompleted {
                peer,
                outcome:
                    TaskOutcome::Transactions {
                        requested,
                        received,
                    },
            } => self.on_transactions(peer, &requested, received),
            PeerGroupEvent::MerkleBlock { block, .. } => {
                for txid in &block.transaction_hashes {
                    self.relayed.remove(txid);
                }
            }
            PeerGroupEvent::Disconnected { peer, .. } => {
                if let Some(batches) = self.requests.remove(&peer) {
                    debug!("Dropping {} request batches for {}", batches.len(), peer);
                }
            }
            _ => {}
        }
    }

    fn on_inventory(&mut self, peer: PeerId, items: &[Inventory]) {
        let mut wanted = Vec::new();
        for txid in items.iter().filter(|i| i.is_transaction()).map(Inventory::txid) {
            self.stats.announcements_received += 1;
            if wanted.contains(&txid)
                || self.relayed.contains(&txid)
                || self.storage.transaction_exists(&txid)
                || self.in_flight(&txid)
            {
                self.stats.duplicate_announcements += 1;
                continue;
            }
            wanted.push(txid);
        }

        if wanted.is_empty() {
            return;
        }

        debug!("Requesting {} transactions from {}", wanted.len(), peer);
        self.stats.requests_sent += wanted.len();
        self.requests
            .entry(peer)
            .or_default()
            .push(wanted.clone());
        self.group
            .add_task(peer, RequestTransactionsTask::new(wanted));
    }

    fn on_transactions(
        &mut self,
        peer: PeerId,
        requested: &[Txid],
        transactions: Vec<Transaction>,
    ) {
        if let Some(batches) = self.requests.get_mut(&peer) {
            if let Some(index) = batches.iter().position(|b| b.as_slice() == requested) {
                batches.remove(index);
            }
            if batches.is_empty() {
                self.requests.remove(&peer);
            }
        }

        let fresh: Vec<Transaction> = transactions
            .into_iter()
            .filter(|tx| self.relayed.insert(tx.compute_txid()))
            .collect();
        if fresh.is_empty() {
            return;
        }

        self.stats.transactions_received += fresh.len();
        self.processor.process_received(&fresh, None, false);
        for tx in &fresh {
            self.storage.add_transaction(tx.compute_txid(), None);
        }
        debug!("Processed {} relayed transactions from {}", fresh.len(), peer);
    }
}
