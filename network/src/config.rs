use anyhow::{bail, Context, Result};
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// BIP111: from this version on peers must advertise NODE_BLOOM
pub const NO_BLOOM_VERSION: u32 = 70011;

/// Throughput floor for a merkle block download, per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedThresholds {
    pub merkle_blocks: f64,
    pub transactions: f64,
    pub transaction_bytes: f64,
}

impl SpeedThresholds {
    /// Divide every threshold by `factor`
    pub fn relaxed(self, factor: f64) -> Self {
        Self {
            merkle_blocks: self.merkle_blocks / factor,
            transactions: self.transactions / factor,
            transaction_bytes: self.transaction_bytes / factor,
        }
    }
}

impl Default for SpeedThresholds {
    fn default() -> Self {
        Self {
            merkle_blocks: 10.0,
            transactions: 50.0,
            transaction_bytes: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpvConfig {
    pub network: Network,
    /// Overrides the network's default P2P port
    pub port: Option<u16>,
    pub dns_seeds: Vec<String>,
    /// Peers held once synced
    pub peer_count: usize,
    /// Peers held while far behind the network
    pub burst_peer_count: usize,
    /// Height gap above which the burst count is used
    pub acceptable_height_gap: u32,
    pub min_protocol_version: u32,
    pub user_agent: String,
    pub max_block_size: u32,
    pub connect_timeout_secs: u64,
    pub speed_thresholds: SpeedThresholds,
    pub bloom_false_positive_rate: f64,
    pub checkpoint_file: Option<PathBuf>,
}

impl SpvConfig {
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            dns_seeds: default_seeds(network),
            ..Self::default()
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.peer_count == 0 {
            bail!("peer_count must be at least 1");
        }
        if self.burst_peer_count < self.peer_count {
            bail!(
                "burst_peer_count ({}) must not be below peer_count ({})",
                self.burst_peer_count,
                self.peer_count
            );
        }
        if !(0.0..1.0).contains(&self.bloom_false_positive_rate)
            || self.bloom_false_positive_rate == 0.0
        {
            bail!(
                "bloom_false_positive_rate must be in (0, 1), got {}",
                self.bloom_false_positive_rate
            );
        }
        if self.max_block_size == 0 {
            bail!("max_block_size must be positive");
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| default_port(self.network))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for SpvConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            port: None,
            dns_seeds: default_seeds(Network::Bitcoin),
            peer_count: 10,
            burst_peer_count: 30,
            acceptable_height_gap: 500,
            min_protocol_version: NO_BLOOM_VERSION,
            user_agent: "/spv-sync:0.1.0/".to_string(),
            max_block_size: spv_core::merkle::DEFAULT_MAX_BLOCK_SIZE,
            connect_timeout_secs: 10,
            speed_thresholds: SpeedThresholds::default(),
            bloom_false_positive_rate: 0.00005,
            checkpoint_file: None,
        }
    }
}

pub fn default_port(network: Network) -> u16 {
    match network {
        Network::Bitcoin => 8333,
        Network::Testnet => 18333,
        Network::Signet => 38333,
        Network::Regtest => 18444,
        _ => 18333,
    }
}

/// DNS seeds per network
pub fn default_seeds(network: Network) -> Vec<String> {
    let seeds: &[&str] = match network {
        Network::Bitcoin => &[
            "seed.bitcoin.sipa.be",
            "dnsseed.bluematt.me",
            "dnsseed.bitcoin.dashjr.org",
            "seed.bitcoinstats.com",
            "seed.bitcoin.jonasschnelli.ch",
            "seed.btc.petertodd.org",
        ],
        Network::Testnet => &[
            "testnet-seed.bitcoin.jonasschnelli.ch",
            "seed.tbtc.petertodd.org",
            "testnet-seed.bluematt.me",
        ],
        Network::Signet => &["seed.signet.bitcoin.sprovoost.nl"],
        _ => &[],
    };
    seeds.iter().map(|s| s.to_string()).collect()
}
