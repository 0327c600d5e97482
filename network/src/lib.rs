//! Peer-to-peer side of the SPV node: connections, the peer pool, bloom
//! filters and the block download scheduler.

pub mod address_manager;
pub mod block_syncer;
pub mod bloom_filter;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod events;
pub mod ibd;
pub mod mempool;
pub mod message;
pub mod node;
pub mod peer;
pub mod peer_group;
pub mod peer_manager;
pub mod task;
pub mod timeout;

// Re-export main types for external use
pub use address_manager::{
    MemoryPeerAddressStorage, PeerAddress, PeerAddressManager, PeerAddressStorage,
};
pub use block_syncer::{BlockSyncer, ProcessOutcome, PublicKeyManager, TransactionProcessor};
pub use bloom_filter::{
    BloomFilter, BloomFilterManager, BloomFilterProvider, OutputSpend, WalletOutput,
    WalletStorage,
};
pub use config::{SpeedThresholds, SpvConfig};
pub use connection::{ConnectionEvent, ConnectionHandle, Connector, PeerId, Requester, TcpConnector};
pub use error::{HandshakeError, NetworkError, PeerError, TimeoutError};
pub use events::{EventBus, EventPublisher, PeerGroupEvent};
pub use ibd::{InitialBlockDownload, SyncListener};
pub use mempool::{MempoolStats, MempoolTransactions};
pub use message::{InvType, Inventory, Message, MessageHeader};
pub use node::{SpvNode, WalletHooks};
pub use peer::{HandshakeState, Peer, PeerInfo, PeerNotification, PeerSettings};
pub use peer_group::{PeerGroup, PeerGroupCommand, PeerGroupHandle};
pub use peer_manager::PeerManager;
pub use task::{PeerTask, TaskOutcome};
pub use timeout::ConnectionTimeoutManager;
