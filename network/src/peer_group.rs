//! Keeps the peer pool at its target size and republishes peer lifecycle
//! as [`PeerGroupEvent`]s.
//!
//! The group runs as one tokio task. Everything it owns (the peer pool,
//! the address manager, connection handles) is only touched from that
//! task; other components talk to it through a [`PeerGroupHandle`].

use crate::address_manager::PeerAddressManager;
use crate::bloom_filter::BloomFilter;
use crate::config::SpvConfig;
use crate::connection::{ConnectionEvent, ConnectionHandle, Connector, PeerId, Requester};
use crate::discovery::resolve_seeds;
use crate::error::PeerError;
use crate::events::{EventPublisher, PeerGroupEvent};
use crate::peer::{Peer, PeerNotification, PeerSettings};
use crate::peer_manager::PeerManager;
use crate::task::{PeerTask, SendTransactionTask};
use bitcoin::Transaction;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const POOL_SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum PeerGroupCommand {
    AddTask { peer: PeerId, task: PeerTask },
    Disconnect {
        peer: PeerId,
        error: Option<PeerError>,
    },
    SendMempool { peer: PeerId },
    Broadcast(Transaction),
    AddAddresses(Vec<IpAddr>),
    Stop,
}

/// Cloneable command side of a running [`PeerGroup`]
#[derive(Debug, Clone)]
pub struct PeerGroupHandle {
    tx: mpsc::UnboundedSender<PeerGroupCommand>,
}

impl PeerGroupHandle {
    pub fn new(tx: mpsc::UnboundedSender<PeerGroupCommand>) -> Self {
        Self { tx }
    }

    fn send(&self, command: PeerGroupCommand) {
        if self.tx.send(command).is_err() {
            debug!("Peer group stopped, dropping command");
        }
    }

    pub fn add_task(&self, peer: PeerId, task: PeerTask) {
        self.send(PeerGroupCommand::AddTask { peer, task });
    }

    pub fn disconnect(&self, peer: PeerId, error: Option<PeerError>) {
        self.send(PeerGroupCommand::Disconnect { peer, error });
    }

    pub fn send_mempool(&self, peer: PeerId) {
        self.send(PeerGroupCommand::SendMempool { peer });
    }

    pub fn broadcast(&self, transaction: Transaction) {
        self.send(PeerGroupCommand::Broadcast(transaction));
    }

    pub fn add_addresses(&self, ips: Vec<IpAddr>) {
        self.send(PeerGroupCommand::AddAddresses(ips));
    }

    pub fn stop(&self) {
        self.send(PeerGroupCommand::Stop);
    }
}

pub struct PeerGroup {
    config: SpvConfig,
    peers: PeerManager,
    addresses: PeerAddressManager,
    connector: Arc<dyn Connector>,
    connections: HashMap<PeerId, ConnectionHandle>,
    publisher: EventPublisher,
    /// Raised target after the first handshake; never lowered again
    burst: Option<usize>,
    first_handshake_done: bool,
    local_height: watch::Receiver<u32>,
    filter: watch::Receiver<Option<BloomFilter>>,
    filter_open: bool,
    commands: mpsc::UnboundedReceiver<PeerGroupCommand>,
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    seed_tx: mpsc::UnboundedSender<Vec<IpAddr>>,
    seed_rx: mpsc::UnboundedReceiver<Vec<IpAddr>>,
    last_summary: Instant,
}

impl PeerGroup {
    pub fn new(
        config: SpvConfig,
        addresses: PeerAddressManager,
        connector: Arc<dyn Connector>,
        publisher: EventPublisher,
        local_height: watch::Receiver<u32>,
        filter: watch::Receiver<Option<BloomFilter>>,
    ) -> (Self, PeerGroupHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (seed_tx, seed_rx) = mpsc::unbounded_channel();

        let group = Self {
            config,
            peers: PeerManager::new(),
            addresses,
            connector,
            connections: HashMap::new(),
            publisher,
            burst: None,
            first_handshake_done: false,
            local_height,
            filter,
            filter_open: true,
            commands,
            conn_tx,
            conn_rx,
            seed_tx,
            seed_rx,
            last_summary: Instant::now(),
        };
        (group, PeerGroupHandle::new(command_tx))
    }

    /// Current target pool size
    pub fn target(&self) -> usize {
        self.burst.unwrap_or(self.config.peer_count)
    }

    pub async fn run(mut self) {
        info!("Starting peer group, target {} peers", self.target());
        self.connect_peers();

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(PeerGroupCommand::Stop) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.conn_rx.recv() => self.handle_connection_event(event),
                Some(ips) = self.seed_rx.recv() => {
                    self.addresses.seed_lookup_finished();
                    self.add_addresses(ips);
                }
                changed = self.filter.changed(), if self.filter_open => match changed {
                    Ok(()) => self.send_filter_to_all(),
                    Err(_) => self.filter_open = false,
                },
                _ = tick.tick() => self.tick(),
            }
        }

        info!("Stopping peer group");
        for id in self.peers.ids() {
            self.remove_peer(id, None, false);
        }
    }

    fn handle_command(&mut self, command: PeerGroupCommand) {
        match command {
            PeerGroupCommand::AddTask { peer, task } => match self.peers.get_mut(&peer) {
                Some(p) => {
                    p.add_task(task, Instant::now());
                    self.flush(peer);
                }
                None => warn!("Dropping {} task for unknown peer {}", task.name(), peer),
            },
            PeerGroupCommand::Disconnect { peer, error } => self.remove_peer(peer, error, true),
            PeerGroupCommand::SendMempool { peer } => {
                if let Some(p) = self.peers.get(&peer) {
                    p.send_mempool();
                }
            }
            PeerGroupCommand::Broadcast(transaction) => {
                let ids: Vec<PeerId> = self.peers.connected().iter().map(|p| p.id()).collect();
                info!(
                    "Broadcasting {} to {} peers",
                    transaction.compute_txid(),
                    ids.len()
                );
                let now = Instant::now();
                for id in ids {
                    if let Some(p) = self.peers.get_mut(&id) {
                        p.add_task(SendTransactionTask::new(transaction.clone()), now);
                    }
                    self.flush(id);
                }
            }
            PeerGroupCommand::AddAddresses(ips) => self.add_addresses(ips),
            PeerGroupCommand::Stop => {}
        }
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        let now = Instant::now();
        match event {
            ConnectionEvent::Established(id) => {
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.connection_established(now);
                }
            }
            ConnectionEvent::Received { peer: id, message } => {
                let Some(peer) = self.peers.get_mut(&id) else {
                    return;
                };
                let result = peer.handle_message(message, now);
                self.flush(id);
                if let Err(e) = result {
                    self.remove_peer(id, Some(e), true);
                }
            }
            ConnectionEvent::Closed { peer, error } => {
                self.connections.remove(&peer);
                self.remove_peer(peer, error.map(PeerError::from), true);
            }
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        for id in self.peers.ids() {
            let Some(peer) = self.peers.get_mut(&id) else {
                continue;
            };
            let result = peer.tick(now);
            self.flush(id);
            if let Err(e) = result {
                self.remove_peer(id, Some(e), true);
            }
        }
        self.start_seed_lookup();

        if now.saturating_duration_since(self.last_summary) >= POOL_SUMMARY_INTERVAL {
            self.last_summary = now;
            info!(
                "Peer pool: {} connected, {} ready, target {}",
                self.peers.connected_count(),
                self.peers.ready().len(),
                self.target()
            );
        }
    }

    /// Republish a peer's pending notifications in order
    fn flush(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };

        for notification in peer.take_notifications() {
            if !self.peers.contains(&id) {
                break;
            }
            let event = match notification {
                PeerNotification::Connected => {
                    self.on_handshake(id);
                    continue;
                }
                PeerNotification::Ready => PeerGroupEvent::Ready(id),
                PeerNotification::Busy => PeerGroupEvent::Busy(id),
                PeerNotification::Inventory(items) => PeerGroupEvent::Inventory { peer: id, items },
                PeerNotification::MerkleBlock(block) => PeerGroupEvent::MerkleBlock {
                    peer: id,
                    block: Arc::new(block),
                },
                PeerNotification::TaskCompleted(outcome) => {
                    PeerGroupEvent::TaskCompleted { peer: id, outcome }
                }
            };
            self.publisher.publish(event);
        }
    }

    fn on_handshake(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        let Some(info) = peer.info() else {
            return;
        };

        self.addresses
            .mark_connected(&id.ip(), info.connection_latency);
        if let Some(filter) = self.filter.borrow().as_ref() {
            peer.send_filter_load(filter.to_filter_load());
        }
        self.publisher.publish(PeerGroupEvent::Connected(info.clone()));

        if !self.first_handshake_done {
            self.first_handshake_done = true;
            let local_height = *self.local_height.borrow();
            let acceptable = local_height.saturating_add(self.config.acceptable_height_gap);
            if info.announced_height > acceptable {
                info!(
                    "Peer {} is {} blocks ahead, raising target to {} peers",
                    id,
                    info.announced_height - local_height,
                    self.config.burst_peer_count
                );
                self.burst = Some(self.config.burst_peer_count);
            }
        } else if self.peers.connected_count() > self.target()
            && self.addresses.has_fresh_candidates()
        {
            if let Some(slowest) = self.peers.slowest() {
                info!("Pool above target, dropping slowest peer {}", slowest);
                self.remove_peer(slowest, None, true);
                return;
            }
        }

        self.connect_peers();
    }

    fn add_addresses(&mut self, ips: Vec<IpAddr>) {
        if !self.addresses.add(ips) {
            return;
        }
        // One extra dial gives the replacement check something to compare
        if self.peers.total_count() >= self.target() {
            if let Some(ip) = self.addresses.ip() {
                self.dial(ip);
            }
        }
        self.connect_peers();
    }

    fn connect_peers(&mut self) {
        while self.peers.total_count() < self.target() {
            let Some(ip) = self.addresses.ip() else {
                break;
            };
            self.dial(ip);
        }
        self.start_seed_lookup();
    }

    fn dial(&mut self, ip: IpAddr) {
        let id = SocketAddr::new(ip, self.config.port());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let settings = PeerSettings {
            min_protocol_version: self.config.min_protocol_version,
            local_best_height: *self.local_height.borrow(),
            user_agent: self.config.user_agent.clone(),
        };

        debug!("Dialing {}", id);
        let peer = Peer::new(id, settings, Requester::new(id, outbound_tx), Instant::now());
        let handle = self.connector.connect(id, outbound_rx, self.conn_tx.clone());
        self.peers.add(peer);
        self.connections.insert(id, handle);
    }

    fn start_seed_lookup(&mut self) {
        let Some(seeds) = self.addresses.take_seed_lookup() else {
            return;
        };
        let tx = self.seed_tx.clone();
        let port = self.config.port();
        tokio::spawn(async move {
            let ips = resolve_seeds(seeds, port).await;
            let _ = tx.send(ips);
        });
    }

    fn remove_peer(&mut self, id: PeerId, error: Option<PeerError>, refill: bool) {
        self.connections.remove(&id);
        let Some(mut peer) = self.peers.remove(&id) else {
            return;
        };
        let was_connected = peer.is_connected();
        peer.close();

        match &error {
            Some(e) => {
                warn!("Disconnected {}: {}", id, e);
                self.addresses.mark_failed(&id.ip());
            }
            None => {
                info!("Disconnected {}", id);
                self.addresses.mark_success(&id.ip());
            }
        }

        if was_connected {
            self.publisher
                .publish(PeerGroupEvent::Disconnected { peer: id, error });
        }
        if refill {
            self.connect_peers();
        }
    }

    fn send_filter_to_all(&mut self) {
        let Some(filter) = self.filter.borrow_and_update().clone() else {
            return;
        };
        let load = filter.to_filter_load();
        let connected = self.peers.connected();
        debug!("Sending new filter to {} peers", connected.len());
        for peer in connected {
            peer.send_filter_load(load.clone());
        }
    }
}
