//! Partial merkle tree validation for filtered blocks.
//!
//! Peers answer filtered block requests with a header and a depth-first
//! encoding of the merkle tree: a list of hashes and a bit per visited node.
//! The validator rebuilds the root from that encoding and returns the
//! transaction hashes the peer flagged as matching our filter.

use crate::block::MerkleBlock;
use crate::error::MerkleValidationError;
use bitcoin::block::Header as BlockHeader;
use bitcoin::hashes::{sha256d, Hash, HashEngine};
use bitcoin::{TxMerkleNode, Txid};
use std::collections::HashSet;

/// Default legacy block size limit used to bound transaction counts
pub const DEFAULT_MAX_BLOCK_SIZE: u32 = 1_000_000;

/// Smallest possible serialized transaction size
const MIN_TRANSACTION_SIZE: u32 = 60;

/// Calculate the merkle root from transaction IDs
pub fn calculate_merkle_root_from_txids(txids: &[Txid]) -> TxMerkleNode {
    if txids.is_empty() {
        return TxMerkleNode::from_byte_array([0u8; 32]);
    }

    let mut hashes: Vec<sha256d::Hash> = txids.iter().map(|txid| txid.to_raw_hash()).collect();

    // Build the tree layer by layer, duplicating the last hash of odd layers
    while hashes.len() > 1 {
        if hashes.len() % 2 != 0 {
            hashes.push(hashes[hashes.len() - 1]);
        }
        hashes = hashes
            .chunks(2)
            .map(|pair| combine(&pair[0], &pair[1]))
            .collect();
    }

    TxMerkleNode::from_raw_hash(hashes[0])
}

fn combine(left: &sha256d::Hash, right: &sha256d::Hash) -> sha256d::Hash {
    let mut engine = sha256d::Hash::engine();
    engine.input(left.as_ref());
    engine.input(right.as_ref());
    sha256d::Hash::from_engine(engine)
}

/// Wire form of a partial merkle tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialMerkleProof {
    pub total_transactions: u32,
    pub hashes: Vec<TxMerkleNode>,
    /// Node flags, least significant bit first
    pub flags: Vec<u8>,
}

impl PartialMerkleProof {
    pub fn from_bitcoin(tree: &bitcoin::merkle_tree::PartialMerkleTree) -> Self {
        let bits = tree.bits();
        let mut flags = vec![0u8; bits.len().div_ceil(8)];
        for (i, bit) in bits.iter().enumerate() {
            if *bit {
                flags[i / 8] |= 1 << (i % 8);
            }
        }

        Self {
            total_transactions: tree.num_transactions(),
            hashes: tree.hashes().clone(),
            flags,
        }
    }
}

/// Validates filtered blocks received from peers
#[derive(Debug, Clone)]
pub struct MerkleBlockValidator {
    max_block_size: u32,
}

impl Default for MerkleBlockValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BLOCK_SIZE)
    }
}

impl MerkleBlockValidator {
    pub fn new(max_block_size: u32) -> Self {
        Self { max_block_size }
    }

    /// Validate a `merkleblock` message and turn it into a [`MerkleBlock`]
    /// whose transactions are still to be collected.
    pub fn validate_merkle_block(
        &self,
        block: &bitcoin::MerkleBlock,
    ) -> Result<MerkleBlock, MerkleValidationError> {
        let proof = PartialMerkleProof::from_bitcoin(&block.txn);
        let matched = self.validate(&block.header, &proof)?;
        Ok(MerkleBlock::new(block.header, matched, None))
    }

    /// Rebuild the merkle root and return the matched transaction hashes.
    pub fn validate(
        &self,
        header: &BlockHeader,
        proof: &PartialMerkleProof,
    ) -> Result<Vec<Txid>, MerkleValidationError> {
        let total = proof.total_transactions;
        if total == 0 {
            return Err(MerkleValidationError::NoTransactions);
        }

        let max = self.max_block_size / MIN_TRANSACTION_SIZE;
        if total > max {
            return Err(MerkleValidationError::TooManyTransactions { count: total, max });
        }

        if proof.hashes.len() > total as usize {
            return Err(MerkleValidationError::TooManyHashes {
                hashes: proof.hashes.len(),
                transactions: total,
            });
        }

        if proof.flags.len() * 8 < proof.hashes.len() {
            return Err(MerkleValidationError::NotEnoughFlagBits {
                bits: proof.flags.len() * 8,
                hashes: proof.hashes.len(),
            });
        }

        let mut height = 0;
        while tree_width(total, height) > 1 {
            height += 1;
        }

        let mut traversal = Traversal {
            total,
            proof,
            bits_used: 0,
            hashes_used: 0,
            matched: Vec::new(),
        };
        let root = traversal.traverse(height, 0)?;

        if traversal.hashes_used != proof.hashes.len() {
            return Err(MerkleValidationError::HashCountMismatch {
                used: traversal.hashes_used,
                supplied: proof.hashes.len(),
            });
        }
        if traversal.bits_used.div_ceil(8) != proof.flags.len() {
            return Err(MerkleValidationError::FlagBitsMismatch {
                used: traversal.bits_used.div_ceil(8),
                supplied: proof.flags.len(),
            });
        }

        if TxMerkleNode::from_raw_hash(root) != header.merkle_root {
            return Err(MerkleValidationError::WrongMerkleRoot(header.block_hash()));
        }

        // A txid listed at two leaves is still one transaction to wait for
        let mut seen = HashSet::new();
        let mut matched = traversal.matched;
        matched.retain(|txid| seen.insert(*txid));
        Ok(matched)
    }
}

fn tree_width(total: u32, height: u32) -> u32 {
    ((total as u64 + (1u64 << height) - 1) >> height) as u32
}

struct Traversal<'a> {
    total: u32,
    proof: &'a PartialMerkleProof,
    bits_used: usize,
    hashes_used: usize,
    matched: Vec<Txid>,
}

impl Traversal<'_> {
    fn next_bit(&mut self) -> Result<bool, MerkleValidationError> {
        let index = self.bits_used;
        if index >= self.proof.flags.len() * 8 {
            return Err(MerkleValidationError::FlagBitsMismatch {
                used: index.div_ceil(8) + 1,
                supplied: self.proof.flags.len(),
            });
        }
        self.bits_used += 1;
        Ok(self.proof.flags[index / 8] & (1 << (index % 8)) != 0)
    }

    fn next_hash(&mut self) -> Result<sha256d::Hash, MerkleValidationError> {
        let hash = self.proof.hashes.get(self.hashes_used).ok_or(
            MerkleValidationError::HashCountMismatch {
                used: self.hashes_used + 1,
                supplied: self.proof.hashes.len(),
            },
        )?;
        self.hashes_used += 1;
        Ok(hash.to_raw_hash())
    }

    fn traverse(&mut self, height: u32, pos: u32) -> Result<sha256d::Hash, MerkleValidationError> {
        let parent_of_match = self.next_bit()?;

        if height == 0 || !parent_of_match {
            let hash = self.next_hash()?;
            if height == 0 && parent_of_match {
                self.matched.push(Txid::from_raw_hash(hash));
            }
            return Ok(hash);
        }

        let left = self.traverse(height - 1, pos * 2)?;
        let right = if pos * 2 + 1 < tree_width(self.total, height - 1) {
            let right = self.traverse(height - 1, pos * 2 + 1)?;
            if right == left {
                return Err(MerkleValidationError::DuplicatedBranchHash);
            }
            right
        } else {
            left
        };

        Ok(combine(&left, &right))
    }
}
