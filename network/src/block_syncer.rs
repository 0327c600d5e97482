//! Applies downloaded merkle blocks and block hash batches to the chain.

use crate::bloom_filter::BloomFilterManager;
use crate::task::MAX_BLOCK_HASHES_PER_REQUEST;
use bitcoin::{BlockHash, Transaction};
use spv_core::{Block, BlockHashEntry, Blockchain, ChainError, ChainStorage, Checkpoint, MerkleBlock};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Stored blocks offered as locator when nothing is queued
const LOCATOR_BLOCKS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed,
    /// A matched transaction revealed keys the loaded filter does not cover
    BloomFilterExpired,
}

/// Wallet side of transaction handling
pub trait TransactionProcessor: Send + Sync {
    fn process_received(
        &self,
        transactions: &[Transaction],
        block: Option<&Block>,
        skip_check: bool,
    ) -> ProcessOutcome;
}

pub trait PublicKeyManager: Send + Sync {
    /// Derive keys until the unused gap is restored
    fn fill_gap(&self) -> anyhow::Result<()>;
}

pub struct BlockSyncer {
    storage: Arc<dyn ChainStorage>,
    blockchain: Arc<Blockchain>,
    checkpoint: Checkpoint,
    processor: Arc<dyn TransactionProcessor>,
    key_manager: Arc<dyn PublicKeyManager>,
    bloom: Arc<BloomFilterManager>,
    /// The running iteration hit an expired filter
    partial: bool,
    best_height: watch::Sender<u32>,
}

impl BlockSyncer {
    pub fn new(
        storage: Arc<dyn ChainStorage>,
        blockchain: Arc<Blockchain>,
        checkpoint: Checkpoint,
        processor: Arc<dyn TransactionProcessor>,
        key_manager: Arc<dyn PublicKeyManager>,
        bloom: Arc<BloomFilterManager>,
    ) -> Self {
        let (best_height, _) = watch::channel(0);
        let syncer = Self {
            storage,
            blockchain,
            checkpoint,
            processor,
            key_manager,
            bloom,
            partial: false,
            best_height,
        };
        syncer.seed_checkpoint();
        syncer
            .best_height
            .send_replace(syncer.local_downloaded_best_height());
        syncer
    }

    /// Seed an empty chain, or one that ends below the checkpoint.
    fn seed_checkpoint(&self) {
        match self.storage.last_block() {
            Some(last) if last.height >= self.checkpoint.block.height => return,
            Some(last) => {
                warn!(
                    "Stored chain ends at {} below checkpoint {}, resetting",
                    last.height, self.checkpoint.block.height
                );
                let mut blocks = self.storage.blocks_from(0, false);
                blocks.extend(self.storage.blocks_from(0, true));
                self.blockchain.delete_blocks(&blocks);
            }
            None => {}
        }

        info!(
            "Seeding chain with checkpoint {} at height {}",
            self.checkpoint.block.header_hash, self.checkpoint.block.height
        );
        for block in self.checkpoint.blocks() {
            self.blockchain.force_add_block(block.clone());
        }
    }

    pub fn subscribe_best_height(&self) -> watch::Receiver<u32> {
        self.best_height.subscribe()
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Height of the last stored block
    pub fn local_downloaded_best_height(&self) -> u32 {
        self.storage.last_block().map(|b| b.height).unwrap_or(0)
    }

    /// Downloaded height plus discovered hashes still waiting for their block
    pub fn local_known_best_height(&self) -> u32 {
        let waiting = self
            .storage
            .block_hashes(usize::MAX)
            .into_iter()
            .filter(|e| e.height == 0 && self.storage.block(&e.header_hash).is_none())
            .count();
        self.local_downloaded_best_height() + waiting as u32
    }

    /// Next batch of queued hashes to fetch
    pub fn block_hashes(&self) -> Vec<BlockHashEntry> {
        self.storage.block_hashes(MAX_BLOCK_HASHES_PER_REQUEST)
    }

    /// Queue hashes that are neither queued nor stored
    pub fn add_block_hashes(&self, hashes: Vec<BlockHash>) {
        let mut sequence = self
            .storage
            .last_block_hash()
            .map(|e| e.sequence + 1)
            .unwrap_or(0);
        let mut seen = HashSet::new();

        let entries: Vec<BlockHashEntry> = hashes
            .into_iter()
            .filter(|h| seen.insert(*h))
            .filter(|h| !self.storage.block_hash_exists(h) && self.storage.block(h).is_none())
            .map(|h| {
                let entry = BlockHashEntry::new(h, 0, sequence);
                sequence += 1;
                entry
            })
            .collect();

        if !entries.is_empty() {
            debug!("Queued {} new block hashes", entries.len());
            self.storage.add_block_hashes(entries);
        }
    }

    /// Locator for `getblocks`, newest first.
    pub fn block_locator_hashes(&self, peer_last_block_height: u32) -> Vec<BlockHash> {
        let mut locator: Vec<BlockHash> = match self.storage.last_block_hash() {
            Some(entry) => vec![entry.header_hash],
            None => self
                .storage
                .latest_blocks(LOCATOR_BLOCKS)
                .into_iter()
                .map(|b| b.header_hash)
                .collect(),
        };

        let anchor = self
            .storage
            .block_at_height(peer_last_block_height)
            .map(|b| b.header_hash)
            .unwrap_or(self.checkpoint.block.header_hash);
        if !locator.contains(&anchor) {
            locator.push(anchor);
        }
        locator
    }

    /// Store a downloaded block and hand its transactions to the wallet.
    pub fn handle_merkle_block(&mut self, merkle_block: &MerkleBlock) -> Result<Block, ChainError> {
        let block = match merkle_block.height {
            Some(height) => self.blockchain.force_add(merkle_block, height),
            None => self.blockchain.connect(merkle_block)?,
        };

        let outcome =
            self.processor
                .process_received(&merkle_block.transactions, Some(&block), self.partial);
        if outcome == ProcessOutcome::BloomFilterExpired && !self.partial {
            info!(
                "Filter expired at block {} ({}), iteration is partial",
                block.height, block.header_hash
            );
            self.partial = true;
        }

        for tx in &merkle_block.transactions {
            self.storage
                .add_transaction(tx.compute_txid(), Some(block.header_hash));
        }

        if !self.partial {
            self.storage.delete_block_hash(&block.header_hash);
        }
        self.best_height
            .send_replace(self.local_downloaded_best_height());
        Ok(block)
    }

    /// Called when a merkle block batch finishes; `true` if it was partial
    pub fn download_iteration_completed(&self) -> bool {
        self.partial
    }

    /// Runs on every sync peer change. Queued hashes came from the previous
    /// peer's view of the chain and may sit on a fork the new peer does not
    /// have, so unanchored ones are dropped and rediscovered with `getblocks`.
    pub fn download_started(&mut self) {
        self.prepare_for_download();
    }

    pub fn download_completed(&self) {
        self.blockchain.handle_fork();
    }

    pub fn download_failed(&mut self) {
        self.prepare_for_download();
    }

    /// Roll back a partial iteration and reconcile forks before fetching more.
    pub fn prepare_for_download(&mut self) {
        if self.partial {
            if let Err(e) = self.key_manager.fill_gap() {
                warn!("Failed to fill key gap: {:#}", e);
            }
            self.bloom.regenerate();
            self.partial = false;
        }

        self.clear_partial_blocks();
        self.storage.delete_unanchored_block_hashes();
        self.blockchain.handle_fork();
        self.best_height
            .send_replace(self.local_downloaded_best_height());
    }

    fn clear_partial_blocks(&self) {
        let blocks: Vec<Block> = self
            .storage
            .block_hashes(usize::MAX)
            .into_iter()
            .filter(|e| !self.checkpoint.contains(&e.header_hash))
            .filter_map(|e| self.storage.block(&e.header_hash))
            .collect();

        if !blocks.is_empty() {
            info!("Deleting {} blocks from the partial iteration", blocks.len());
            self.blockchain.delete_blocks(&blocks);
        }
        for block in &blocks {
            self.storage.delete_block_hash(&block.header_hash);
        }
    }
}
