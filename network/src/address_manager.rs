//! Candidate peer addresses and their scoring.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Candidate pool entry, never an active connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub ip: IpAddr,
    /// Completed sessions with this address
    pub score: i32,
    /// Latest handshake latency
    pub connection_time_ms: Option<u64>,
    /// Unix time of the latest successful connection
    pub last_connected_at: Option<u64>,
}

impl PeerAddress {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            score: 0,
            connection_time_ms: None,
            last_connected_at: None,
        }
    }
}

/// Persistence for candidate addresses
pub trait PeerAddressStorage: Send + Sync {
    fn addresses(&self) -> Vec<PeerAddress>;
    fn exists(&self, ip: &IpAddr) -> bool;
    fn add(&self, addresses: Vec<PeerAddress>);
    fn remove(&self, ip: &IpAddr);
    fn increase_score(&self, ip: &IpAddr);
    fn set_connection_time(&self, ip: &IpAddr, latency: Duration);
}

/// In-memory [`PeerAddressStorage`] with JSON snapshots
#[derive(Default)]
pub struct MemoryPeerAddressStorage {
    addresses: RwLock<HashMap<IpAddr, PeerAddress>>,
}

impl MemoryPeerAddressStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let mut addresses = self.addresses();
        addresses.sort_by_key(|a| a.ip);
        let data = serde_json::to_vec_pretty(&addresses)?;
        tokio::fs::write(path, data)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!("Saved {} peer addresses to {}", addresses.len(), path.display());
        Ok(())
    }

    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let addresses: Vec<PeerAddress> = serde_json::from_slice(&data)?;
        info!("Loaded {} peer addresses from {}", addresses.len(), path.display());
        let storage = Self::new();
        storage.add(addresses);
        Ok(storage)
    }
}

impl PeerAddressStorage for MemoryPeerAddressStorage {
    fn addresses(&self) -> Vec<PeerAddress> {
        self.addresses.read().values().cloned().collect()
    }

    fn exists(&self, ip: &IpAddr) -> bool {
        self.addresses.read().contains_key(ip)
    }

    fn add(&self, addresses: Vec<PeerAddress>) {
        let mut stored = self.addresses.write();
        for address in addresses {
            stored.entry(address.ip).or_insert(address);
        }
    }

    fn remove(&self, ip: &IpAddr) {
        self.addresses.write().remove(ip);
    }

    fn increase_score(&self, ip: &IpAddr) {
        if let Some(address) = self.addresses.write().get_mut(ip) {
            address.score += 1;
        }
    }

    fn set_connection_time(&self, ip: &IpAddr, latency: Duration) {
        if let Some(address) = self.addresses.write().get_mut(ip) {
            address.connection_time_ms = Some(latency.as_millis() as u64);
            address.last_connected_at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|d| d.as_secs());
        }
    }
}

/// Hands out candidate IPs to the peer group.
///
/// Owned by the peer group task; not shared.
pub struct PeerAddressManager {
    storage: Arc<dyn PeerAddressStorage>,
    in_use: HashSet<IpAddr>,
    seeds: Vec<String>,
    seed_lookup_needed: bool,
    seed_lookup_running: bool,
}

impl PeerAddressManager {
    pub fn new(storage: Arc<dyn PeerAddressStorage>, seeds: Vec<String>) -> Self {
        Self {
            storage,
            in_use: HashSet::new(),
            seeds,
            seed_lookup_needed: false,
            seed_lookup_running: false,
        }
    }

    /// Next candidate to dial, marked in use.
    ///
    /// Prefers lower score, then lower recorded latency. Returns `None` and
    /// requests a seed lookup when the pool is exhausted.
    pub fn ip(&mut self) -> Option<IpAddr> {
        let candidate = self
            .storage
            .addresses()
            .into_iter()
            .filter(|a| !self.in_use.contains(&a.ip))
            .min_by_key(|a| (a.score, a.connection_time_ms.unwrap_or(0), a.ip));

        match candidate {
            Some(address) => {
                self.in_use.insert(address.ip);
                Some(address.ip)
            }
            None => {
                self.seed_lookup_needed = true;
                None
            }
        }
    }

    /// Seeds to resolve, if a lookup is due and none is running
    pub fn take_seed_lookup(&mut self) -> Option<Vec<String>> {
        if !self.seed_lookup_needed || self.seed_lookup_running || self.seeds.is_empty() {
            return None;
        }
        self.seed_lookup_needed = false;
        self.seed_lookup_running = true;
        Some(self.seeds.clone())
    }

    pub fn seed_lookup_finished(&mut self) {
        self.seed_lookup_running = false;
    }

    /// Insert unknown addresses; `true` if any were new
    pub fn add(&mut self, ips: Vec<IpAddr>) -> bool {
        let fresh: Vec<PeerAddress> = ips
            .into_iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .filter(|ip| !self.storage.exists(ip))
            .map(PeerAddress::new)
            .collect();

        if fresh.is_empty() {
            return false;
        }
        debug!("Adding {} new peer addresses", fresh.len());
        self.storage.add(fresh);
        true
    }

    pub fn mark_connected(&mut self, ip: &IpAddr, latency: Duration) {
        self.storage.set_connection_time(ip, latency);
    }

    pub fn mark_success(&mut self, ip: &IpAddr) {
        self.in_use.remove(ip);
        self.storage.increase_score(ip);
    }

    /// A single failure removes the address for good
    pub fn mark_failed(&mut self, ip: &IpAddr) {
        self.in_use.remove(ip);
        self.storage.remove(ip);
    }

    /// Candidates not currently dialed or connected
    pub fn has_fresh_candidates(&self) -> bool {
        self.storage
            .addresses()
            .iter()
            .any(|a| !self.in_use.contains(&a.ip))
    }
}
