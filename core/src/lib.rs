//! # SPV chain core
//!
//! Chain model for a simplified payment verification node.
//!
//! - **Blocks**: stored headers with height and stale markers
//! - **Merkle validation**: partial merkle tree proofs from filtered blocks
//! - **Blockchain**: connecting blocks, fork resolution, pruning
//! - **Checkpoints**: trusted starting blocks
//! - **Storage**: the storage contract and an in-memory backend

pub mod block;
pub mod chain;
pub mod checkpoints;
pub mod error;
pub mod merkle;
pub mod pow_validation;
pub mod storage;

pub use block::{Block, BlockHashEntry, MerkleBlock};
pub use chain::{Blockchain, BlockchainListener};
pub use checkpoints::Checkpoint;
pub use error::{BlockValidationError, ChainError, MerkleValidationError};
pub use merkle::{MerkleBlockValidator, PartialMerkleProof};
pub use pow_validation::{BlockValidator, ProofOfWorkValidator};
pub use storage::{ChainStorage, MemoryChainStorage};
