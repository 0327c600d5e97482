use bitcoin::block::Header as BlockHeader;
use bitcoin::{BlockHash, Transaction, Txid};
use serde::{Deserialize, Serialize};

/// A stored block header with its chain position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub header_hash: BlockHash,
    pub height: u32,
    /// Set while the block belongs to a branch that has not been reconciled yet
    pub stale: bool,
    /// Whether the block carried transactions relevant to the wallet
    pub has_transactions: bool,
}

impl Block {
    pub fn new(header: BlockHeader, height: u32) -> Self {
        Self {
            header_hash: header.block_hash(),
            header,
            height,
            stale: false,
            has_transactions: false,
        }
    }

    pub fn previous_hash(&self) -> BlockHash {
        self.header.prev_blockhash
    }
}

/// Entry of the pending download queue.
///
/// `height` stays 0 until the hash is anchored at a known chain position;
/// `sequence` preserves arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHashEntry {
    pub header_hash: BlockHash,
    pub height: u32,
    pub sequence: u64,
}

impl BlockHashEntry {
    pub fn new(header_hash: BlockHash, height: u32, sequence: u64) -> Self {
        Self {
            header_hash,
            height,
            sequence,
        }
    }
}

/// Header plus the transactions a peer matched against our filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    pub header_hash: BlockHash,
    pub transaction_hashes: Vec<Txid>,
    pub transactions: Vec<Transaction>,
    /// Known chain height, if the hash was queued with one
    pub height: Option<u32>,
}

impl MerkleBlock {
    pub fn new(header: BlockHeader, transaction_hashes: Vec<Txid>, height: Option<u32>) -> Self {
        Self {
            header_hash: header.block_hash(),
            header,
            transaction_hashes,
            transactions: Vec::new(),
            height,
        }
    }

    /// All matched transactions have been received
    pub fn is_complete(&self) -> bool {
        self.transaction_hashes.len() == self.transactions.len()
    }

    /// Attach a transaction if it was matched and not yet received.
    pub fn add_transaction(&mut self, tx: Transaction) -> bool {
        let txid = tx.compute_txid();
        if !self.transaction_hashes.contains(&txid)
            || self.transactions.iter().any(|t| t.compute_txid() == txid)
        {
            return false;
        }
        self.transactions.push(tx);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::transaction::Version;
    use bitcoin::Network;

    fn create_test_tx(lock_time: u32) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::from_consensus(lock_time),
            input: vec![],
            output: vec![],
        }
    }

    #[test]
    fn test_merkle_block_completion() {
        let header = genesis_block(Network::Regtest).header;
        let tx1 = create_test_tx(1);
        let tx2 = create_test_tx(2);
        let mut block = MerkleBlock::new(
            header,
            vec![tx1.compute_txid(), tx2.compute_txid()],
            None,
        );

        assert!(!block.is_complete());
        assert!(block.add_transaction(tx1.clone()));
        assert!(!block.add_transaction(tx1));
        assert!(!block.add_transaction(create_test_tx(3)));
        assert!(block.add_transaction(tx2));
        assert!(block.is_complete());
    }

    #[test]
    fn test_block_new_computes_hash() {
        let header = genesis_block(Network::Bitcoin).header;
        let block = Block::new(header, 0);
        assert_eq!(block.header_hash, header.block_hash());
        assert!(!block.stale);
    }
}
