//! Composition root: wires storage, chain, filter and the peer-facing
//! workers together and owns their tasks.

use crate::address_manager::{PeerAddressManager, PeerAddressStorage};
use crate::block_syncer::{BlockSyncer, PublicKeyManager, TransactionProcessor};
use crate::bloom_filter::{BloomFilterManager, BloomFilterProvider, WalletStorage};
use crate::config::SpvConfig;
use crate::connection::{Connector, TcpConnector};
use crate::events::EventBus;
use crate::ibd::{InitialBlockDownload, SyncListener};
use crate::mempool::MempoolTransactions;
use crate::peer_group::{PeerGroup, PeerGroupHandle};
use anyhow::{bail, Context, Result};
use bitcoin::Transaction;
use spv_core::{
    BlockValidator, Blockchain, BlockchainListener, ChainStorage, Checkpoint,
    MerkleBlockValidator, ProofOfWorkValidator,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Wallet collaborators the node calls into
#[derive(Clone)]
pub struct WalletHooks {
    pub storage: Arc<dyn WalletStorage>,
    pub processor: Arc<dyn TransactionProcessor>,
    pub key_manager: Arc<dyn PublicKeyManager>,
}

struct Running {
    group: PeerGroupHandle,
    bloom: Arc<BloomFilterManager>,
    best_height: watch::Receiver<u32>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct SpvNode {
    config: SpvConfig,
    storage: Arc<dyn ChainStorage>,
    address_storage: Arc<dyn PeerAddressStorage>,
    wallet: WalletHooks,
    validator: Option<Arc<dyn BlockValidator>>,
    connector: Option<Arc<dyn Connector>>,
    providers: Vec<Arc<dyn BloomFilterProvider>>,
    chain_listener: Option<Arc<dyn BlockchainListener>>,
    sync_listener: Option<Arc<dyn SyncListener>>,
    running: Option<Running>,
}

impl SpvNode {
    pub fn new(
        config: SpvConfig,
        storage: Arc<dyn ChainStorage>,
        address_storage: Arc<dyn PeerAddressStorage>,
        wallet: WalletHooks,
    ) -> Result<Self> {
        config.validate().context("Invalid node configuration")?;
        Ok(Self {
            config,
            storage,
            address_storage,
            wallet,
            validator: None,
            connector: None,
            providers: Vec::new(),
            chain_listener: None,
            sync_listener: None,
            running: None,
        })
    }

    /// Replace the bundled proof-of-work validator
    pub fn with_validator(mut self, validator: Arc<dyn BlockValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_filter_provider(mut self, provider: Arc<dyn BloomFilterProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_blockchain_listener(mut self, listener: Arc<dyn BlockchainListener>) -> Self {
        self.chain_listener = Some(listener);
        self
    }

    pub fn with_sync_listener(mut self, listener: Arc<dyn SyncListener>) -> Self {
        self.sync_listener = Some(listener);
        self
    }

    pub fn config(&self) -> &SpvConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            bail!("Node already started");
        }
        info!("Starting SPV node on {}", self.config.network);

        let checkpoint = match &self.config.checkpoint_file {
            Some(path) => Checkpoint::from_file(path)?,
            None => Checkpoint::bundled(self.config.network),
        };

        let validator = self
            .validator
            .clone()
            .unwrap_or_else(|| Arc::new(ProofOfWorkValidator::new(self.config.network)));
        let mut blockchain = Blockchain::new(self.storage.clone(), validator);
        if let Some(listener) = &self.chain_listener {
            blockchain = blockchain.with_listener(listener.clone());
        }

        let mut bloom = BloomFilterManager::new(
            self.wallet.storage.clone(),
            self.storage.clone(),
            self.config.bloom_false_positive_rate,
        );
        for provider in &self.providers {
            bloom.add_provider(provider.clone());
        }
        let bloom = Arc::new(bloom);
        let filter = bloom.subscribe();
        bloom.regenerate();

        let syncer = BlockSyncer::new(
            self.storage.clone(),
            Arc::new(blockchain),
            checkpoint,
            self.wallet.processor.clone(),
            self.wallet.key_manager.clone(),
            bloom.clone(),
        );
        let best_height = syncer.subscribe_best_height();

        let mut bus = EventBus::new();
        let ibd_events = bus.subscribe();
        let mempool_events = bus.subscribe();
        let publisher = bus.start();

        let connector = self.connector.clone().unwrap_or_else(|| {
            Arc::new(TcpConnector::new(
                self.config.network.magic(),
                self.config.connect_timeout(),
            ))
        });
        let addresses =
            PeerAddressManager::new(self.address_storage.clone(), self.config.dns_seeds.clone());
        let (group, handle) = PeerGroup::new(
            self.config.clone(),
            addresses,
            connector,
            publisher,
            best_height.clone(),
            filter,
        );

        let mut ibd = InitialBlockDownload::new(
            syncer,
            handle.clone(),
            MerkleBlockValidator::new(self.config.max_block_size),
            self.config.speed_thresholds,
        );
        if let Some(listener) = &self.sync_listener {
            ibd = ibd.with_listener(listener.clone());
        }
        let mempool =
            MempoolTransactions::new(self.storage.clone(), self.wallet.processor.clone(), handle.clone());

        let tasks = vec![
            tokio::spawn(group.run()),
            tokio::spawn(ibd.run(ibd_events)),
            tokio::spawn(mempool.run(mempool_events)),
        ];

        self.running = Some(Running {
            group: handle,
            bloom,
            best_height,
            tasks,
        });
        Ok(())
    }

    /// Stop the peer group and wait for every worker to drain.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        info!("Stopping SPV node");
        running.group.stop();
        for task in running.tasks {
            task.await.context("Node worker panicked")?;
        }
        Ok(())
    }

    pub fn broadcast_transaction(&self, transaction: Transaction) -> Result<()> {
        let Some(running) = &self.running else {
            bail!("Node not started");
        };
        running.group.broadcast(transaction);
        Ok(())
    }

    /// Rebuild the filter after the wallet learned new keys or outputs
    pub fn regenerate_bloom_filter(&self) -> Result<()> {
        let Some(running) = &self.running else {
            bail!("Node not started");
        };
        running.bloom.regenerate();
        Ok(())
    }

    pub fn best_height(&self) -> Option<u32> {
        self.running.as_ref().map(|r| *r.best_height.borrow())
    }
}
