use anyhow::{bail, Context, Result};
use bitcoin::consensus::{deserialize_partial, serialize};
use bitcoin::hashes::Hash;
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::message_blockdata::{self, GetBlocksMessage};
use bitcoin::p2p::message_bloom::FilterLoad;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::Magic;
use bitcoin::{BlockHash, MerkleBlock, Transaction, Txid};

/// Largest payload accepted from a peer
pub const MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024;

/// Inventory types the sync engine deals with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    Error = 0,
    Tx = 1,
    Block = 2,
    FilteredBlock = 3,
    WitnessTx = 0x40000001,
    WitnessBlock = 0x40000002,
}

/// Inventory item with a raw 32-byte hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inventory {
    pub inv_type: InvType,
    pub hash: [u8; 32],
}

impl Inventory {
    pub fn transaction(txid: Txid) -> Self {
        Self {
            inv_type: InvType::Tx,
            hash: txid.to_byte_array(),
        }
    }

    pub fn block(hash: BlockHash) -> Self {
        Self {
            inv_type: InvType::Block,
            hash: hash.to_byte_array(),
        }
    }

    pub fn filtered_block(hash: BlockHash) -> Self {
        Self {
            inv_type: InvType::FilteredBlock,
            hash: hash.to_byte_array(),
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self.inv_type, InvType::Block | InvType::WitnessBlock)
    }

    pub fn is_transaction(&self) -> bool {
        matches!(self.inv_type, InvType::Tx | InvType::WitnessTx)
    }

    pub fn block_hash(&self) -> BlockHash {
        BlockHash::from_byte_array(self.hash)
    }

    pub fn txid(&self) -> Txid {
        Txid::from_byte_array(self.hash)
    }

    fn to_bitcoin(self) -> message_blockdata::Inventory {
        use message_blockdata::Inventory as Inv;
        match self.inv_type {
            InvType::Error => Inv::Error,
            InvType::Tx => Inv::Transaction(self.txid()),
            InvType::Block => Inv::Block(self.block_hash()),
            InvType::WitnessTx => Inv::WitnessTransaction(self.txid()),
            InvType::WitnessBlock => Inv::WitnessBlock(self.block_hash()),
            InvType::FilteredBlock => Inv::Unknown {
                inv_type: InvType::FilteredBlock as u32,
                hash: self.hash,
            },
        }
    }

    /// Items of types the engine does not handle map to `None`
    fn from_bitcoin(inv: &message_blockdata::Inventory) -> Option<Self> {
        use message_blockdata::Inventory as Inv;
        let (inv_type, hash) = match inv {
            Inv::Transaction(txid) => (InvType::Tx, txid.to_byte_array()),
            Inv::Block(hash) => (InvType::Block, hash.to_byte_array()),
            Inv::WitnessTransaction(txid) => (InvType::WitnessTx, txid.to_byte_array()),
            Inv::WitnessBlock(hash) => (InvType::WitnessBlock, hash.to_byte_array()),
            Inv::Unknown { inv_type: 3, hash } => (InvType::FilteredBlock, *hash),
            _ => return None,
        };
        Some(Self { inv_type, hash })
    }
}

fn to_bitcoin_inventory(items: &[Inventory]) -> Vec<message_blockdata::Inventory> {
    items.iter().map(|i| i.to_bitcoin()).collect()
}

fn from_bitcoin_inventory(items: &[message_blockdata::Inventory]) -> Vec<Inventory> {
    items.iter().filter_map(Inventory::from_bitcoin).collect()
}

/// Messages exchanged with SPV peers
#[derive(Debug, Clone)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Inv(Vec<Inventory>),
    GetData(Vec<Inventory>),
    NotFound(Vec<Inventory>),
    GetBlocks(GetBlocksMessage),
    MerkleBlock(MerkleBlock),
    Tx(Transaction),
    FilterLoad(FilterLoad),
    MemPool,
}

impl Message {
    /// Convert to bitcoin crate's NetworkMessage
    pub fn to_network_message(&self) -> NetworkMessage {
        match self {
            Message::Version(v) => NetworkMessage::Version(v.clone()),
            Message::Verack => NetworkMessage::Verack,
            Message::Ping(n) => NetworkMessage::Ping(*n),
            Message::Pong(n) => NetworkMessage::Pong(*n),
            Message::Inv(items) => NetworkMessage::Inv(to_bitcoin_inventory(items)),
            Message::GetData(items) => NetworkMessage::GetData(to_bitcoin_inventory(items)),
            Message::NotFound(items) => NetworkMessage::NotFound(to_bitcoin_inventory(items)),
            Message::GetBlocks(g) => NetworkMessage::GetBlocks(g.clone()),
            Message::MerkleBlock(b) => NetworkMessage::MerkleBlock(b.clone()),
            Message::Tx(t) => NetworkMessage::Tx(t.clone()),
            Message::FilterLoad(f) => NetworkMessage::FilterLoad(f.clone()),
            Message::MemPool => NetworkMessage::MemPool,
        }
    }

    /// Create from bitcoin crate's NetworkMessage, `None` for commands we ignore
    pub fn from_network_message(msg: NetworkMessage) -> Option<Self> {
        let msg = match msg {
            NetworkMessage::Version(v) => Message::Version(v),
            NetworkMessage::Verack => Message::Verack,
            NetworkMessage::Ping(n) => Message::Ping(n),
            NetworkMessage::Pong(n) => Message::Pong(n),
            NetworkMessage::Inv(items) => Message::Inv(from_bitcoin_inventory(&items)),
            NetworkMessage::GetData(items) => Message::GetData(from_bitcoin_inventory(&items)),
            NetworkMessage::NotFound(items) => Message::NotFound(from_bitcoin_inventory(&items)),
            NetworkMessage::GetBlocks(g) => Message::GetBlocks(g),
            NetworkMessage::MerkleBlock(b) => Message::MerkleBlock(b),
            NetworkMessage::Tx(t) => Message::Tx(t),
            NetworkMessage::FilterLoad(f) => Message::FilterLoad(f),
            NetworkMessage::MemPool => Message::MemPool,
            _ => return None,
        };
        Some(msg)
    }

    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::GetBlocks(_) => "getblocks",
            Message::MerkleBlock(_) => "merkleblock",
            Message::Tx(_) => "tx",
            Message::FilterLoad(_) => "filterload",
            Message::MemPool => "mempool",
        }
    }
}

/// Message header for P2P protocol
#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: [u8; 12],
    pub length: u32,
    pub checksum: u32,
}

impl MessageHeader {
    pub const SIZE: usize = 24;

    /// Parse header from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("Insufficient data for message header");
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[0..4]);

        let mut command = [0u8; 12];
        command.copy_from_slice(&data[4..16]);

        let mut length = [0u8; 4];
        length.copy_from_slice(&data[16..20]);

        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&data[20..24]);

        Ok(MessageHeader {
            magic,
            command,
            length: u32::from_le_bytes(length),
            checksum: u32::from_le_bytes(checksum),
        })
    }

    /// Check the frame belongs to our network and fits the payload limit
    pub fn validate(&self, magic: Magic) -> Result<()> {
        if Magic::from_bytes(self.magic) != magic {
            bail!("Unexpected network magic {:02x?}", self.magic);
        }
        if self.length > MAX_PAYLOAD_SIZE {
            bail!(
                "Payload of {} bytes for {} exceeds limit",
                self.length,
                self.command_string()
            );
        }
        Ok(())
    }

    /// Get command as string
    pub fn command_string(&self) -> String {
        let end = self.command.iter().position(|&b| b == 0).unwrap_or(12);
        String::from_utf8_lossy(&self.command[..end]).to_string()
    }
}

/// Serialize a message to bytes
pub fn serialize_message(msg: &Message, network_magic: Magic) -> Vec<u8> {
    serialize(&RawNetworkMessage::new(network_magic, msg.to_network_message()))
}

/// Deserialize one framed message. Unhandled commands decode to `None`.
pub fn deserialize_message(data: &[u8]) -> Result<(Option<Message>, usize)> {
    let (raw_msg, bytes_read) =
        deserialize_partial::<RawNetworkMessage>(data).context("Failed to deserialize message")?;
    Ok((Message::from_network_message(raw_msg.payload().clone()), bytes_read))
}
