use bitcoin::BlockHash;
use thiserror::Error;

/// Reasons a partial merkle tree proof is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MerkleValidationError {
    #[error("Merkle block declares no transactions")]
    NoTransactions,

    #[error("Merkle block declares {count} transactions, limit is {max}")]
    TooManyTransactions { count: u32, max: u32 },

    #[error("Merkle block carries {hashes} hashes for {transactions} transactions")]
    TooManyHashes { hashes: usize, transactions: u32 },

    #[error("Merkle block carries {bits} flag bits for {hashes} hashes")]
    NotEnoughFlagBits { bits: usize, hashes: usize },

    #[error("Merkle proof hash count mismatch: {used} used of {supplied}")]
    HashCountMismatch { used: usize, supplied: usize },

    #[error("Merkle proof flag bits mismatch: {used} used of {supplied} bytes")]
    FlagBitsMismatch { used: usize, supplied: usize },

    #[error("Merkle root mismatch for block {0}")]
    WrongMerkleRoot(BlockHash),

    #[error("Duplicated branch hash in merkle proof")]
    DuplicatedBranchHash,
}

/// Rejection raised by a network specific block validator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockValidationError {
    #[error("Proof of work does not meet target for block {0}")]
    InsufficientWork(BlockHash),

    #[error("Unexpected difficulty change at height {height}")]
    UnexpectedBitsChange { height: u32 },

    #[error("Block validation failed: {0}")]
    Other(String),
}

/// Errors raised while mutating the chain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("No previous block {previous} for block {hash}")]
    NoPreviousBlock { hash: BlockHash, previous: BlockHash },

    #[error("Block rejected: {0}")]
    Rejected(#[from] BlockValidationError),
}
