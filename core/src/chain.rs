//! Chain mutation: connecting blocks, fork resolution and pruning.

use crate::block::{Block, MerkleBlock};
use crate::error::ChainError;
use crate::pow_validation::{BlockValidator, RETARGET_INTERVAL};
use crate::storage::ChainStorage;
use bitcoin::{BlockHash, Txid};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives chain mutations
pub trait BlockchainListener: Send + Sync {
    fn on_block_inserted(&self, block: &Block);
    /// Called with every wallet transaction of blocks about to be deleted
    fn on_transactions_deleted(&self, hashes: &[Txid]);
}

pub struct Blockchain {
    storage: Arc<dyn ChainStorage>,
    validator: Arc<dyn BlockValidator>,
    listener: Option<Arc<dyn BlockchainListener>>,
}

impl Blockchain {
    pub fn new(storage: Arc<dyn ChainStorage>, validator: Arc<dyn BlockValidator>) -> Self {
        Self {
            storage,
            validator,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn BlockchainListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Connect a block to its stored predecessor.
    ///
    /// New blocks are stored as stale until [`Blockchain::handle_fork`]
    /// reconciles them with the rest of the chain.
    pub fn connect(&self, merkle_block: &MerkleBlock) -> Result<Block, ChainError> {
        if let Some(existing) = self.storage.block(&merkle_block.header_hash) {
            return Ok(existing);
        }

        let previous_hash = merkle_block.header.prev_blockhash;
        let previous = self
            .storage
            .block(&previous_hash)
            .ok_or(ChainError::NoPreviousBlock {
                hash: merkle_block.header_hash,
                previous: previous_hash,
            })?;

        let height = previous.height + 1;
        self.validator
            .validate(&merkle_block.header, height, &previous)?;

        let mut block = Block::new(merkle_block.header, height);
        block.stale = true;
        block.has_transactions = !merkle_block.transaction_hashes.is_empty();

        self.insert(block.clone());
        if height % RETARGET_INTERVAL == 0 {
            self.prune(height);
        }

        Ok(block)
    }

    /// Store a block at a known height without any checks.
    pub fn force_add(&self, merkle_block: &MerkleBlock, height: u32) -> Block {
        let mut block = Block::new(merkle_block.header, height);
        block.has_transactions = !merkle_block.transaction_hashes.is_empty();
        self.force_add_block(block)
    }

    pub fn force_add_block(&self, block: Block) -> Block {
        if let Some(existing) = self.storage.block(&block.header_hash) {
            return existing;
        }
        self.insert(block.clone());
        block
    }

    fn insert(&self, block: Block) {
        debug!("Inserting block {} at height {}", block.header_hash, block.height);
        self.storage.add_block(block.clone());
        if let Some(listener) = &self.listener {
            listener.on_block_inserted(&block);
        }
    }

    /// Reconcile the stale branch with the non-stale chain.
    pub fn handle_fork(&self) {
        let Some(first_stale) = self.storage.first_stale_block() else {
            self.storage.unstale_all();
            return;
        };

        let Some(last_not_stale) = self.storage.last_not_stale_block() else {
            self.storage.unstale_all();
            return;
        };

        if first_stale.height > last_not_stale.height {
            self.storage.unstale_all();
            return;
        }

        let last_stale_height = self
            .storage
            .last_stale_block()
            .map(|b| b.height)
            .unwrap_or(first_stale.height);

        if last_stale_height > last_not_stale.height {
            let replaced = self.storage.blocks_from(first_stale.height, false);
            info!(
                "Fork at height {}: replacing {} blocks with stale branch ending at {}",
                first_stale.height,
                replaced.len(),
                last_stale_height
            );
            self.delete_blocks(&replaced);
            self.storage.unstale_all();
        } else {
            let rejected = self.storage.blocks_from(first_stale.height, true);
            warn!(
                "Fork at height {}: dropping {} stale blocks ending at {}",
                first_stale.height,
                rejected.len(),
                last_stale_height
            );
            self.delete_blocks(&rejected);
        }
    }

    /// Delete blocks, notifying the listener of their transactions first.
    pub fn delete_blocks(&self, blocks: &[Block]) {
        if blocks.is_empty() {
            return;
        }

        let hashes: Vec<BlockHash> = blocks.iter().map(|b| b.header_hash).collect();
        let transactions = self.storage.transaction_hashes_in_blocks(&hashes);
        if !transactions.is_empty() {
            if let Some(listener) = &self.listener {
                listener.on_transactions_deleted(&transactions);
            }
        }

        self.storage.delete_blocks(&hashes);
    }

    fn prune(&self, height: u32) {
        let Some(limit) = height.checked_sub(RETARGET_INTERVAL) else {
            return;
        };
        let prunable = self.storage.prunable_blocks(limit);
        if !prunable.is_empty() {
            debug!("Pruning {} blocks below height {}", prunable.len(), limit);
            self.storage.delete_blocks(
                &prunable.iter().map(|b| b.header_hash).collect::<Vec<_>>(),
            );
        }
    }
}
