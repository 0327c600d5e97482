use crate::block::Block;
use crate::error::BlockValidationError;
use bitcoin::block::Header as BlockHeader;
use bitcoin::hashes::Hash;
use bitcoin::{Network, Target};
use tracing::debug;

/// Difficulty retarget interval
pub const RETARGET_INTERVAL: u32 = 2016;

/// Network specific check run by [`crate::chain::Blockchain::connect`]
pub trait BlockValidator: Send + Sync {
    fn validate(
        &self,
        candidate: &BlockHeader,
        height: u32,
        previous: &Block,
    ) -> Result<(), BlockValidationError>;
}

/// Header-only proof of work validator
pub struct ProofOfWorkValidator {
    network: Network,
    max_target: Target,
}

impl ProofOfWorkValidator {
    pub fn new(network: Network) -> Self {
        let max_target = match network {
            Network::Bitcoin => Target::MAX_ATTAINABLE_MAINNET,
            Network::Testnet => Target::MAX_ATTAINABLE_TESTNET,
            Network::Regtest => Target::MAX_ATTAINABLE_REGTEST,
            Network::Signet => Target::MAX_ATTAINABLE_SIGNET,
            _ => Target::MAX_ATTAINABLE_TESTNET,
        };

        Self {
            network,
            max_target,
        }
    }

    /// Testnet and regtest allow difficulty to drop between retargets
    fn bits_may_change(&self, height: u32) -> bool {
        match self.network {
            Network::Bitcoin | Network::Signet => height % RETARGET_INTERVAL == 0,
            _ => true,
        }
    }
}

impl BlockValidator for ProofOfWorkValidator {
    fn validate(
        &self,
        candidate: &BlockHeader,
        height: u32,
        previous: &Block,
    ) -> Result<(), BlockValidationError> {
        let hash = candidate.block_hash();
        let target = candidate.target();

        if target > self.max_target {
            return Err(BlockValidationError::InsufficientWork(hash));
        }

        let hash_as_target = Target::from_le_bytes(hash.to_byte_array());
        if hash_as_target > target {
            return Err(BlockValidationError::InsufficientWork(hash));
        }

        if !self.bits_may_change(height) && candidate.bits != previous.header.bits {
            return Err(BlockValidationError::UnexpectedBitsChange { height });
        }

        debug!("Block {} at height {} has valid proof of work", hash, height);
        Ok(())
    }
}
