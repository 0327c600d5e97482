//! BIP37 bloom filters and the manager that builds them from wallet data.
//! https://github.com/bitcoin/bips/blob/master/bip-0037.mediawiki

use bitcoin::consensus::serialize;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::p2p::message_bloom::{BloomFlags, FilterLoad};
use bitcoin::OutPoint;
use spv_core::ChainStorage;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Maximum bloom filter size in bytes
const MAX_BLOOM_FILTER_SIZE: usize = 36_000;

/// Maximum number of hash functions
const MAX_HASH_FUNCS: u32 = 50;

const LN2_SQUARED: f64 = std::f64::consts::LN_2 * std::f64::consts::LN_2;

/// Spent outputs stay in the filter until their spending block is this deep
pub const SPENT_OUTPUT_DEPTH: i64 = 100;

/// Bloom filter for SPV clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: BloomFlags,
}

impl BloomFilter {
    /// Size the filter for `elements` at the given false positive rate
    pub fn new(elements: usize, fp_rate: f64, tweak: u32, flags: BloomFlags) -> Self {
        let elements = elements.max(1) as f64;
        let bits = (-1.0 / LN2_SQUARED * elements * fp_rate.ln()) as usize;
        let size = (bits.min(MAX_BLOOM_FILTER_SIZE * 8) / 8).max(1);
        let hash_funcs = ((size * 8) as f64 / elements * std::f64::consts::LN_2) as u32;

        Self {
            data: vec![0u8; size],
            hash_funcs: hash_funcs.clamp(1, MAX_HASH_FUNCS),
            tweak,
            flags,
        }
    }

    fn bit_index(&self, hash_num: u32, element: &[u8]) -> usize {
        let seed = hash_num.wrapping_mul(0xFBA4C795).wrapping_add(self.tweak);
        murmur3(seed, element) as usize % (self.data.len() * 8)
    }

    pub fn insert(&mut self, element: &[u8]) {
        for i in 0..self.hash_funcs {
            let index = self.bit_index(i, element);
            self.data[index >> 3] |= 1 << (index & 7);
        }
    }

    pub fn contains(&self, element: &[u8]) -> bool {
        (0..self.hash_funcs).all(|i| {
            let index = self.bit_index(i, element);
            self.data[index >> 3] & (1 << (index & 7)) != 0
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn hash_funcs(&self) -> u32 {
        self.hash_funcs
    }

    pub fn to_filter_load(&self) -> FilterLoad {
        FilterLoad {
            filter: self.data.clone(),
            hash_funcs: self.hash_funcs,
            tweak: self.tweak,
            flags: self.flags,
        }
    }
}

/// MurmurHash3 (x86, 32-bit) as used by BIP37
fn murmur3(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut h1 = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13).wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k1 ^= (*byte as u32) << (8 * i);
        }
        h1 ^= k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85ebca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2ae35);
    h1 ^= h1 >> 16;
    h1
}

/// Extra filter elements contributed by other components
pub trait BloomFilterProvider: Send + Sync {
    fn filter_elements(&self) -> Vec<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSpend {
    Unspent,
    /// Spent by a transaction not yet in a block
    SpentUnconfirmed,
    SpentInBlock(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletOutput {
    pub outpoint: OutPoint,
    pub spend: OutputSpend,
}

/// Wallet data the filter is built from
pub trait WalletStorage: Send + Sync {
    /// Serialized public keys of every tracked key
    fn public_keys(&self) -> Vec<Vec<u8>>;
    fn outputs(&self) -> Vec<WalletOutput>;
}

/// Builds the filter sent to peers and publishes each rebuild.
pub struct BloomFilterManager {
    wallet: Arc<dyn WalletStorage>,
    chain: Arc<dyn ChainStorage>,
    providers: Vec<Arc<dyn BloomFilterProvider>>,
    fp_rate: f64,
    publisher: watch::Sender<Option<BloomFilter>>,
}

impl BloomFilterManager {
    pub fn new(wallet: Arc<dyn WalletStorage>, chain: Arc<dyn ChainStorage>, fp_rate: f64) -> Self {
        let (publisher, _) = watch::channel(None);
        Self {
            wallet,
            chain,
            providers: Vec::new(),
            fp_rate,
            publisher,
        }
    }

    pub fn add_provider(&mut self, provider: Arc<dyn BloomFilterProvider>) {
        self.providers.push(provider);
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<BloomFilter>> {
        self.publisher.subscribe()
    }

    pub fn current(&self) -> Option<BloomFilter> {
        self.publisher.borrow().clone()
    }

    fn key_elements(public_key: &[u8]) -> [Vec<u8>; 3] {
        let key_hash = hash160::Hash::hash(public_key);
        let mut redeem_script = vec![0x00, 0x14];
        redeem_script.extend_from_slice(key_hash.as_ref());
        let script_hash = hash160::Hash::hash(&redeem_script);

        [
            public_key.to_vec(),
            key_hash.to_byte_array().to_vec(),
            script_hash.to_byte_array().to_vec(),
        ]
    }

    fn output_included(spend: OutputSpend, last_block_height: i64) -> bool {
        match spend {
            OutputSpend::Unspent | OutputSpend::SpentUnconfirmed => true,
            OutputSpend::SpentInBlock(height) => {
                height as i64 > last_block_height - SPENT_OUTPUT_DEPTH
            }
        }
    }

    /// Every element the next filter must match
    pub fn elements(&self) -> Vec<Vec<u8>> {
        let mut elements = Vec::new();
        let mut seen = HashSet::new();
        let mut push = |element: Vec<u8>| {
            if seen.insert(element.clone()) {
                elements.push(element);
            }
        };

        for key in self.wallet.public_keys() {
            Self::key_elements(&key).into_iter().for_each(&mut push);
        }

        let last_block_height = self
            .chain
            .last_block()
            .map(|b| b.height as i64)
            .unwrap_or(0);
        for output in self.wallet.outputs() {
            if Self::output_included(output.spend, last_block_height) {
                push(serialize(&output.outpoint));
            }
        }

        for provider in &self.providers {
            provider.filter_elements().into_iter().for_each(&mut push);
        }

        elements
    }

    /// Rebuild and publish; skipped when there is nothing to match
    pub fn regenerate(&self) -> Option<BloomFilter> {
        let elements = self.elements();
        if elements.is_empty() {
            debug!("No bloom filter elements, skipping rebuild");
            return None;
        }

        let mut filter = BloomFilter::new(
            elements.len(),
            self.fp_rate,
            rand::random(),
            BloomFlags::None,
        );
        for element in &elements {
            filter.insert(element);
        }

        info!(
            "Rebuilt bloom filter: {} elements, {} bytes",
            elements.len(),
            filter.data().len()
        );
        self.publisher.send_replace(Some(filter.clone()));
        Some(filter)
    }
}
