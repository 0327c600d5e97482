use crate::block::Block;
use anyhow::{bail, Context, Result};
use bitcoin::block::Header as BlockHeader;
use bitcoin::blockdata::constants::genesis_block;
use bitcoin::consensus::deserialize;
use bitcoin::{BlockHash, Network};
use std::path::Path;
use tracing::info;

/// Header (80) + height (4) + hash (32)
const RECORD_SIZE: usize = 116;

/// Trusted starting point for synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub block: Block,
    /// Blocks preceding the checkpoint, needed to validate the next retarget
    pub additional_blocks: Vec<Block>,
}

impl Checkpoint {
    /// Genesis checkpoint bundled for each network
    pub fn bundled(network: Network) -> Self {
        let header = genesis_block(network).header;
        Self {
            block: Block::new(header, 0),
            additional_blocks: Vec::new(),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint file {}", path.display()))?;
        let checkpoint = Self::parse(&contents)?;
        info!(
            "Loaded checkpoint at height {} ({}) from {}",
            checkpoint.block.height,
            checkpoint.block.header_hash,
            path.display()
        );
        Ok(checkpoint)
    }

    /// Parse newline separated hex records, checkpoint block first.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut blocks = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .enumerate()
            .map(|(i, line)| parse_record(line).with_context(|| format!("Checkpoint record {}", i)));

        let block = match blocks.next() {
            Some(block) => block?,
            None => bail!("Checkpoint file contains no records"),
        };
        let additional_blocks = blocks.collect::<Result<Vec<_>>>()?;

        Ok(Self {
            block,
            additional_blocks,
        })
    }

    /// Checkpoint block followed by its additional blocks
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        std::iter::once(&self.block).chain(self.additional_blocks.iter())
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.blocks().any(|b| &b.header_hash == hash)
    }
}

fn parse_record(line: &str) -> Result<Block> {
    let bytes = hex::decode(line).context("Invalid hex")?;
    if bytes.len() != RECORD_SIZE {
        bail!("Expected {} bytes, got {}", RECORD_SIZE, bytes.len());
    }

    let header: BlockHeader = deserialize(&bytes[..80]).context("Invalid block header")?;
    let mut height = [0u8; 4];
    height.copy_from_slice(&bytes[80..84]);
    let height = u32::from_le_bytes(height);
    let hash: BlockHash = deserialize(&bytes[84..]).context("Invalid block hash")?;

    let block = Block::new(header, height);
    if block.header_hash != hash {
        bail!("Hash {} does not match header hash {}", hash, block.header_hash);
    }
    Ok(block)
}
