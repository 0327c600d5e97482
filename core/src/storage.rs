//! Storage contract consumed by the sync engine, plus an in-memory backend.

use crate::block::{Block, BlockHashEntry};
use bitcoin::{BlockHash, Txid};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Block, block-hash queue and transaction index storage.
///
/// Calls are synchronous and expected to be cheap; callers never hold
/// them across an await point.
pub trait ChainStorage: Send + Sync {
    fn block(&self, hash: &BlockHash) -> Option<Block>;
    fn block_at_height(&self, height: u32) -> Option<Block>;
    /// Highest stored block, stale or not
    fn last_block(&self) -> Option<Block>;
    fn blocks_count(&self) -> usize;
    fn add_block(&self, block: Block);
    fn delete_blocks(&self, hashes: &[BlockHash]);

    /// Lowest stale block
    fn first_stale_block(&self) -> Option<Block>;
    /// Highest stale block
    fn last_stale_block(&self) -> Option<Block>;
    /// Highest non-stale block
    fn last_not_stale_block(&self) -> Option<Block>;
    /// Blocks at or above `height` with the given stale flag, ascending
    fn blocks_from(&self, height: u32, stale: bool) -> Vec<Block>;
    fn unstale_all(&self);
    /// Non-stale blocks without wallet transactions below `height`
    fn prunable_blocks(&self, height: u32) -> Vec<Block>;
    /// Up to `limit` blocks ordered by descending height
    fn latest_blocks(&self, limit: usize) -> Vec<Block>;

    /// Queued hashes ordered by sequence then height
    fn block_hashes(&self, limit: usize) -> Vec<BlockHashEntry>;
    /// Queued entry with the highest sequence
    fn last_block_hash(&self) -> Option<BlockHashEntry>;
    fn block_hash_exists(&self, hash: &BlockHash) -> bool;
    fn add_block_hashes(&self, entries: Vec<BlockHashEntry>);
    fn delete_block_hash(&self, hash: &BlockHash);
    /// Drop queued entries whose height is still unresolved
    fn delete_unanchored_block_hashes(&self);
    fn block_hashes_count(&self) -> usize;

    fn add_transaction(&self, txid: Txid, block: Option<BlockHash>);
    fn transaction_exists(&self, txid: &Txid) -> bool;
    fn transaction_hashes_in_blocks(&self, blocks: &[BlockHash]) -> Vec<Txid>;
}

#[derive(Default)]
struct MemoryChain {
    blocks: HashMap<BlockHash, Block>,
    block_hashes: HashMap<BlockHash, BlockHashEntry>,
    transactions: HashMap<Txid, Option<BlockHash>>,
}

impl MemoryChain {
    fn sorted_blocks<F: Fn(&Block) -> bool>(&self, filter: F) -> Vec<Block> {
        let mut blocks: Vec<Block> = self.blocks.values().filter(|b| filter(b)).cloned().collect();
        blocks.sort_by_key(|b| b.height);
        blocks
    }
}

/// Thread-safe in-memory [`ChainStorage`]
#[derive(Default)]
pub struct MemoryChainStorage {
    inner: RwLock<MemoryChain>,
}

impl MemoryChainStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChainStorage for MemoryChainStorage {
    fn block(&self, hash: &BlockHash) -> Option<Block> {
        self.inner.read().blocks.get(hash).cloned()
    }

    fn block_at_height(&self, height: u32) -> Option<Block> {
        self.inner
            .read()
            .blocks
            .values()
            .find(|b| b.height == height && !b.stale)
            .cloned()
    }

    fn last_block(&self) -> Option<Block> {
        self.inner
            .read()
            .blocks
            .values()
            .max_by_key(|b| b.height)
            .cloned()
    }

    fn blocks_count(&self) -> usize {
        self.inner.read().blocks.len()
    }

    fn add_block(&self, block: Block) {
        self.inner.write().blocks.insert(block.header_hash, block);
    }

    fn delete_blocks(&self, hashes: &[BlockHash]) {
        let mut inner = self.inner.write();
        let doomed: HashSet<&BlockHash> = hashes.iter().collect();
        for hash in hashes {
            inner.blocks.remove(hash);
        }
        inner
            .transactions
            .retain(|_, block| !block.as_ref().is_some_and(|b| doomed.contains(b)));
    }

    fn first_stale_block(&self) -> Option<Block> {
        self.inner
            .read()
            .blocks
            .values()
            .filter(|b| b.stale)
            .min_by_key(|b| b.height)
            .cloned()
    }

    fn last_stale_block(&self) -> Option<Block> {
        self.inner
            .read()
            .blocks
            .values()
            .filter(|b| b.stale)
            .max_by_key(|b| b.height)
            .cloned()
    }

    fn last_not_stale_block(&self) -> Option<Block> {
        self.inner
            .read()
            .blocks
            .values()
            .filter(|b| !b.stale)
            .max_by_key(|b| b.height)
            .cloned()
    }

    fn blocks_from(&self, height: u32, stale: bool) -> Vec<Block> {
        self.inner
            .read()
            .sorted_blocks(|b| b.height >= height && b.stale == stale)
    }

    fn unstale_all(&self) {
        for block in self.inner.write().blocks.values_mut() {
            block.stale = false;
        }
    }

    fn prunable_blocks(&self, height: u32) -> Vec<Block> {
        self.inner
            .read()
            .sorted_blocks(|b| b.height < height && !b.stale && !b.has_transactions)
    }

    fn latest_blocks(&self, limit: usize) -> Vec<Block> {
        let mut blocks = self.inner.read().sorted_blocks(|_| true);
        blocks.reverse();
        blocks.truncate(limit);
        blocks
    }

    fn block_hashes(&self, limit: usize) -> Vec<BlockHashEntry> {
        let mut entries: Vec<BlockHashEntry> =
            self.inner.read().block_hashes.values().cloned().collect();
        entries.sort_by_key(|e| (e.sequence, e.height));
        entries.truncate(limit);
        entries
    }

    fn last_block_hash(&self) -> Option<BlockHashEntry> {
        self.inner
            .read()
            .block_hashes
            .values()
            .max_by_key(|e| e.sequence)
            .cloned()
    }

    fn block_hash_exists(&self, hash: &BlockHash) -> bool {
        self.inner.read().block_hashes.contains_key(hash)
    }

    fn add_block_hashes(&self, entries: Vec<BlockHashEntry>) {
        let mut inner = self.inner.write();
        for entry in entries {
            inner.block_hashes.insert(entry.header_hash, entry);
        }
    }

    fn delete_block_hash(&self, hash: &BlockHash) {
        self.inner.write().block_hashes.remove(hash);
    }

    fn delete_unanchored_block_hashes(&self) {
        self.inner.write().block_hashes.retain(|_, e| e.height != 0);
    }

    fn block_hashes_count(&self) -> usize {
        self.inner.read().block_hashes.len()
    }

    fn add_transaction(&self, txid: Txid, block: Option<BlockHash>) {
        self.inner.write().transactions.insert(txid, block);
    }

    fn transaction_exists(&self, txid: &Txid) -> bool {
        self.inner.read().transactions.contains_key(txid)
    }

    fn transaction_hashes_in_blocks(&self, blocks: &[BlockHash]) -> Vec<Txid> {
        let inner = self.inner.read();
        inner
            .transactions
            .iter()
            .filter(|(_, block)| block.as_ref().is_some_and(|b| blocks.contains(b)))
            .map(|(txid, _)| *txid)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::hashes::Hash;
    use bitcoin::Network;

    fn create_test_block(height: u32, stale: bool) -> Block {
        let mut header = genesis_block(Network::Regtest).header;
        header.nonce = height;
        let mut block = Block::new(header, height);
        block.stale = stale;
        block
    }

    #[test]
    fn test_stale_queries() {
        let storage = MemoryChainStorage::new();
        for h in 0..3 {
            storage.add_block(create_test_block(h, false));
        }
        for h in 2..5 {
            storage.add_block(create_test_block(h + 10, true));
        }

        assert_eq!(storage.first_stale_block().map(|b| b.height), Some(12));
        assert_eq!(storage.last_stale_block().map(|b| b.height), Some(14));
        assert_eq!(storage.last_not_stale_block().map(|b| b.height), Some(2));
        assert_eq!(storage.blocks_from(13, true).len(), 2);

        storage.unstale_all();
        assert!(storage.first_stale_block().is_none());
        assert_eq!(storage.last_block().map(|b| b.height), Some(14));
    }

    #[test]
    fn test_delete_blocks_drops_their_transactions() {
        let storage = MemoryChainStorage::new();
        let block = create_test_block(1, false);
        let txid = Txid::from_byte_array([1; 32]);
        let unconfirmed = Txid::from_byte_array([2; 32]);
        storage.add_block(block.clone());
        storage.add_transaction(txid, Some(block.header_hash));
        storage.add_transaction(unconfirmed, None);

        assert_eq!(
            storage.transaction_hashes_in_blocks(&[block.header_hash]),
            vec![txid]
        );

        storage.delete_blocks(&[block.header_hash]);
        assert!(storage.block(&block.header_hash).is_none());
        assert!(!storage.transaction_exists(&txid));
        assert!(storage.transaction_exists(&unconfirmed));
    }

    #[test]
    fn test_block_hash_queue_order() {
        let storage = MemoryChainStorage::new();
        let entries: Vec<_> = (0..5u8)
            .map(|i| BlockHashEntry::new(BlockHash::from_byte_array([i; 32]), 0, 4 - i as u64))
            .collect();
        storage.add_block_hashes(entries);
        storage.add_block_hashes(vec![BlockHashEntry::new(
            BlockHash::from_byte_array([9; 32]),
            100,
            10,
        )]);

        let first = storage.block_hashes(2);
        assert_eq!(first[0].sequence, 0);
        assert_eq!(first[1].sequence, 1);
        assert_eq!(storage.last_block_hash().map(|e| e.sequence), Some(10));

        storage.delete_unanchored_block_hashes();
        assert_eq!(storage.block_hashes_count(), 1);
    }
}
