//! Units of protocol work queued on a peer.
//!
//! Tasks never touch the socket directly: they push outbound messages
//! through the peer's [`Requester`] and report validated merkle blocks
//! through the [`TaskContext`]. Only the task at the head of a peer's
//! queue receives timeout checks.

use crate::config::SpeedThresholds;
use crate::connection::Requester;
use crate::error::{PeerError, TimeoutError};
use crate::message::{Inventory, Message};
use bitcoin::consensus::serialize;
use bitcoin::hashes::Hash;
use bitcoin::p2p::message_blockdata::GetBlocksMessage;
use bitcoin::{BlockHash, Transaction, Txid};
use spv_core::{BlockHashEntry, MerkleBlock, MerkleBlockValidator};
use std::time::{Duration, Instant};
use tracing::debug;

/// Hashes returned by a single `getblocks`
pub const MAX_BLOCK_HASHES_PER_REQUEST: usize = 500;

const BLOCK_HASHES_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const MERKLE_BLOCKS_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const TRANSACTIONS_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const SPEED_WINDOW: Duration = Duration::from_secs(10);

/// Per-call state handed to a task by its peer
pub struct TaskContext<'a> {
    pub requester: &'a Requester,
    pub now: Instant,
    pub merkle_blocks: Vec<MerkleBlock>,
}

impl<'a> TaskContext<'a> {
    pub fn new(requester: &'a Requester, now: Instant) -> Self {
        Self {
            requester,
            now,
            merkle_blocks: Vec::new(),
        }
    }
}

/// Result reported when a task leaves the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    BlockHashes(Vec<BlockHash>),
    /// Blocks were reported one by one while the task ran
    MerkleBlocks,
    /// `requested` is the full batch the task was created with
    Transactions {
        requested: Vec<Txid>,
        received: Vec<Transaction>,
    },
    TransactionSent { txid: Txid, requested: bool },
}

#[derive(Debug)]
pub enum PeerTask {
    GetBlockHashes(GetBlockHashesTask),
    GetMerkleBlocks(GetMerkleBlocksTask),
    RequestTransactions(RequestTransactionsTask),
    SendTransaction(SendTransactionTask),
}

impl PeerTask {
    pub fn name(&self) -> &'static str {
        match self {
            PeerTask::GetBlockHashes(_) => "get-block-hashes",
            PeerTask::GetMerkleBlocks(_) => "get-merkle-blocks",
            PeerTask::RequestTransactions(_) => "request-transactions",
            PeerTask::SendTransaction(_) => "send-transaction",
        }
    }

    pub fn start(&mut self, cx: &mut TaskContext<'_>) {
        match self {
            PeerTask::GetBlockHashes(t) => t.start(cx),
            PeerTask::GetMerkleBlocks(t) => t.start(cx),
            PeerTask::RequestTransactions(t) => t.start(cx),
            PeerTask::SendTransaction(t) => t.start(cx),
        }
    }

    /// Offer a message; `Ok(true)` means the task consumed it
    pub fn handle_message(
        &mut self,
        msg: &Message,
        cx: &mut TaskContext<'_>,
    ) -> Result<bool, PeerError> {
        match self {
            PeerTask::GetBlockHashes(t) => Ok(t.handle_message(msg, cx)),
            PeerTask::GetMerkleBlocks(t) => t.handle_message(msg, cx),
            PeerTask::RequestTransactions(t) => Ok(t.handle_message(msg, cx)),
            PeerTask::SendTransaction(t) => Ok(t.handle_message(msg, cx)),
        }
    }

    pub fn check_timeout(&mut self, now: Instant) -> Result<(), PeerError> {
        match self {
            PeerTask::GetBlockHashes(t) => {
                t.check_timeout(now);
                Ok(())
            }
            PeerTask::GetMerkleBlocks(t) => t.check_timeout(now),
            PeerTask::RequestTransactions(t) => {
                t.check_timeout(now);
                Ok(())
            }
            PeerTask::SendTransaction(t) => {
                t.check_timeout(now);
                Ok(())
            }
        }
    }

    pub fn reset_timer(&mut self, now: Instant) {
        match self {
            PeerTask::GetBlockHashes(t) => t.last_response = now,
            PeerTask::GetMerkleBlocks(t) => t.reset_timer(now),
            PeerTask::RequestTransactions(t) => t.last_response = now,
            PeerTask::SendTransaction(t) => t.started = now,
        }
    }

    pub fn is_completed(&self) -> bool {
        match self {
            PeerTask::GetBlockHashes(t) => t.completed,
            PeerTask::GetMerkleBlocks(t) => t.completed,
            PeerTask::RequestTransactions(t) => t.completed,
            PeerTask::SendTransaction(t) => t.completed,
        }
    }

    pub fn into_outcome(self) -> TaskOutcome {
        match self {
            PeerTask::GetBlockHashes(t) => TaskOutcome::BlockHashes(t.hashes),
            PeerTask::GetMerkleBlocks(_) => TaskOutcome::MerkleBlocks,
            PeerTask::RequestTransactions(t) => TaskOutcome::Transactions {
                requested: t.requested,
                received: t.received,
            },
            PeerTask::SendTransaction(t) => TaskOutcome::TransactionSent {
                txid: t.transaction.compute_txid(),
                requested: t.requested,
            },
        }
    }
}

/// Discover block hashes following a locator with `getblocks`.
#[derive(Debug)]
pub struct GetBlockHashesTask {
    locator: Vec<BlockHash>,
    expected_min: usize,
    hashes: Vec<BlockHash>,
    last_response: Instant,
    completed: bool,
}

impl GetBlockHashesTask {
    pub fn new(locator: Vec<BlockHash>, expected_min: usize) -> PeerTask {
        PeerTask::GetBlockHashes(Self {
            locator,
            expected_min: expected_min.min(MAX_BLOCK_HASHES_PER_REQUEST),
            hashes: Vec::new(),
            last_response: Instant::now(),
            completed: false,
        })
    }

    fn start(&mut self, cx: &mut TaskContext<'_>) {
        self.last_response = cx.now;
        cx.requester.send(Message::GetBlocks(GetBlocksMessage::new(
            self.locator.clone(),
            BlockHash::all_zeros(),
        )));
    }

    fn handle_message(&mut self, msg: &Message, cx: &mut TaskContext<'_>) -> bool {
        let Message::Inv(items) = msg else {
            return false;
        };

        let hashes: Vec<BlockHash> = items
            .iter()
            .filter(|i| i.is_block())
            .map(|i| i.block_hash())
            .collect();
        if hashes.is_empty() {
            return false;
        }

        // Peers re-announce the locator tip when they have nothing newer
        if hashes.iter().any(|h| self.locator.contains(h)) {
            return true;
        }

        if hashes.len() >= self.expected_min {
            self.hashes = hashes;
            self.completed = true;
        } else if hashes.len() > self.hashes.len() {
            self.hashes = hashes;
            self.last_response = cx.now;
        }
        true
    }

    fn check_timeout(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_response) > BLOCK_HASHES_IDLE_TIMEOUT {
            debug!(
                "Block hash discovery idle, completing with {} hashes",
                self.hashes.len()
            );
            self.completed = true;
        }
    }
}

#[derive(Debug)]
struct SpeedWindow {
    started: Instant,
    merkle_blocks: u32,
    transactions: u32,
    transaction_bytes: usize,
}

impl SpeedWindow {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            merkle_blocks: 0,
            transactions: 0,
            transaction_bytes: 0,
        }
    }

    /// `Some(true)` when a full window ran below every threshold
    fn is_too_slow(&self, now: Instant, thresholds: &SpeedThresholds) -> Option<bool> {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed < SPEED_WINDOW {
            return None;
        }
        let secs = elapsed.as_secs_f64();
        Some(
            (self.merkle_blocks as f64 / secs) < thresholds.merkle_blocks
                && (self.transactions as f64 / secs) < thresholds.transactions
                && (self.transaction_bytes as f64 / secs) < thresholds.transaction_bytes,
        )
    }
}

/// Download a batch of filtered blocks and their matched transactions.
#[derive(Debug)]
pub struct GetMerkleBlocksTask {
    pending: Vec<BlockHashEntry>,
    partial: Vec<MerkleBlock>,
    validator: MerkleBlockValidator,
    thresholds: SpeedThresholds,
    window: SpeedWindow,
    last_response: Instant,
    completed: bool,
}

impl GetMerkleBlocksTask {
    pub fn new(
        block_hashes: Vec<BlockHashEntry>,
        validator: MerkleBlockValidator,
        thresholds: SpeedThresholds,
    ) -> PeerTask {
        let now = Instant::now();
        PeerTask::GetMerkleBlocks(Self {
            completed: block_hashes.is_empty(),
            pending: block_hashes,
            partial: Vec::new(),
            validator,
            thresholds,
            window: SpeedWindow::new(now),
            last_response: now,
        })
    }

    fn start(&mut self, cx: &mut TaskContext<'_>) {
        self.reset_timer(cx.now);
        if self.pending.is_empty() {
            return;
        }
        let items = self
            .pending
            .iter()
            .map(|entry| Inventory::filtered_block(entry.header_hash))
            .collect();
        cx.requester.send(Message::GetData(items));
    }

    fn reset_timer(&mut self, now: Instant) {
        self.last_response = now;
        self.window = SpeedWindow::new(now);
    }

    fn handle_message(
        &mut self,
        msg: &Message,
        cx: &mut TaskContext<'_>,
    ) -> Result<bool, PeerError> {
        match msg {
            Message::MerkleBlock(merkle_block) => {
                let hash = merkle_block.header.block_hash();
                let Some(entry) = self.pending.iter().find(|e| e.header_hash == hash) else {
                    return Ok(false);
                };
                let height = (entry.height > 0).then_some(entry.height);

                let mut block = self.validator.validate_merkle_block(merkle_block)?;
                block.height = height;

                self.last_response = cx.now;
                self.window.merkle_blocks += 1;

                if block.is_complete() {
                    self.finish(block, cx);
                } else {
                    self.partial.push(block);
                }
                Ok(true)
            }
            Message::Tx(tx) => {
                let txid = tx.compute_txid();
                let Some(index) = self
                    .partial
                    .iter()
                    .position(|b| b.transaction_hashes.contains(&txid))
                else {
                    return Ok(false);
                };

                self.last_response = cx.now;
                self.window.transactions += 1;
                self.window.transaction_bytes += serialize(tx).len();

                self.partial[index].add_transaction(tx.clone());
                if self.partial[index].is_complete() {
                    let block = self.partial.remove(index);
                    self.finish(block, cx);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn finish(&mut self, block: MerkleBlock, cx: &mut TaskContext<'_>) {
        self.pending.retain(|e| e.header_hash != block.header_hash);
        cx.merkle_blocks.push(block);
        if self.pending.is_empty() {
            self.completed = true;
        }
    }

    fn check_timeout(&mut self, now: Instant) -> Result<(), PeerError> {
        if now.saturating_duration_since(self.last_response) > MERKLE_BLOCKS_IDLE_TIMEOUT {
            if self.pending.is_empty() {
                self.completed = true;
                return Ok(());
            }
            return Err(TimeoutError::Task("get-merkle-blocks").into());
        }

        match self.window.is_too_slow(now, &self.thresholds) {
            Some(true) if !self.pending.is_empty() => Err(PeerError::TooSlow),
            Some(_) => {
                self.window = SpeedWindow::new(now);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Fetch announced transactions with `getdata`.
#[derive(Debug)]
pub struct RequestTransactionsTask {
    requested: Vec<Txid>,
    pending: Vec<Txid>,
    received: Vec<Transaction>,
    last_response: Instant,
    completed: bool,
}

impl RequestTransactionsTask {
    pub fn new(hashes: Vec<Txid>) -> PeerTask {
        PeerTask::RequestTransactions(Self {
            completed: hashes.is_empty(),
            requested: hashes.clone(),
            pending: hashes,
            received: Vec::new(),
            last_response: Instant::now(),
        })
    }

    fn start(&mut self, cx: &mut TaskContext<'_>) {
        self.last_response = cx.now;
        if self.pending.is_empty() {
            return;
        }
        let items = self.pending.iter().copied().map(Inventory::transaction).collect();
        cx.requester.send(Message::GetData(items));
    }

    fn handle_message(&mut self, msg: &Message, cx: &mut TaskContext<'_>) -> bool {
        match msg {
            Message::Tx(tx) => {
                let txid = tx.compute_txid();
                let Some(index) = self.pending.iter().position(|h| *h == txid) else {
                    return false;
                };
                self.pending.remove(index);
                self.received.push(tx.clone());
            }
            Message::NotFound(items) => {
                let before = self.pending.len();
                self.pending
                    .retain(|h| !items.iter().any(|i| i.is_transaction() && i.txid() == *h));
                if self.pending.len() == before {
                    return false;
                }
            }
            _ => return false,
        }

        self.last_response = cx.now;
        if self.pending.is_empty() {
            self.completed = true;
        }
        true
    }

    fn check_timeout(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_response) > TRANSACTIONS_IDLE_TIMEOUT {
            debug!(
                "Transaction request idle, {} of {} received",
                self.received.len(),
                self.received.len() + self.pending.len()
            );
            self.completed = true;
        }
    }
}

/// Announce a transaction and serve it when the peer asks.
#[derive(Debug)]
pub struct SendTransactionTask {
    transaction: Transaction,
    requested: bool,
    started: Instant,
    completed: bool,
}

impl SendTransactionTask {
    pub fn new(transaction: Transaction) -> PeerTask {
        PeerTask::SendTransaction(Self {
            transaction,
            requested: false,
            started: Instant::now(),
            completed: false,
        })
    }

    fn start(&mut self, cx: &mut TaskContext<'_>) {
        self.started = cx.now;
        cx.requester.send(Message::Inv(vec![Inventory::transaction(
            self.transaction.compute_txid(),
        )]));
    }

    fn handle_message(&mut self, msg: &Message, cx: &mut TaskContext<'_>) -> bool {
        let Message::GetData(items) = msg else {
            return false;
        };
        let txid = self.transaction.compute_txid();
        if !items.iter().any(|i| i.is_transaction() && i.txid() == txid) {
            return false;
        }

        cx.requester.send(Message::Tx(self.transaction.clone()));
        self.requested = true;
        self.completed = true;
        true
    }

    fn check_timeout(&mut self, now: Instant) {
        if now.saturating_duration_since(self.started) > TRANSACTIONS_IDLE_TIMEOUT {
            self.completed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::merkle_tree::PartialMerkleTree;
    use bitcoin::transaction::Version;
    use bitcoin::Network;
    use spv_core::merkle::calculate_merkle_root_from_txids;
    use tokio::sync::mpsc;

    fn create_test_tx(lock_time: u32) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::from_consensus(lock_time),
            input: vec![],
            output: vec![],
        }
    }

    fn create_merkle_block(nonce: u32, txs: &[Transaction]) -> bitcoin::MerkleBlock {
        let mut txids: Vec<Txid> = txs.iter().map(|t| t.compute_txid()).collect();
        let mut matches = vec![true; txids.len()];
        // One unmatched filler keeps the tree non-empty
        txids.push(Txid::from_byte_array([nonce as u8; 32]));
        matches.push(false);

        let mut header = genesis_block(Network::Regtest).header;
        header.nonce = nonce;
        header.merkle_root = calculate_merkle_root_from_txids(&txids);
        bitcoin::MerkleBlock {
            header,
            txn: PartialMerkleTree::from_txids(&txids, &matches),
        }
    }

    fn requester() -> (Requester, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Requester::new("127.0.0.1:8333".parse().unwrap(), tx), rx)
    }

    fn entry(block: &bitcoin::MerkleBlock, height: u32) -> BlockHashEntry {
        BlockHashEntry::new(block.header.block_hash(), height, 0)
    }

    #[test]
    fn test_block_hashes_complete_on_expected_count() {
        let (requester, mut rx) = requester();
        let now = Instant::now();
        let locator = vec![BlockHash::from_byte_array([1; 32])];
        let mut task = GetBlockHashesTask::new(locator.clone(), 2);
        let mut cx = TaskContext::new(&requester, now);
        task.start(&mut cx);
        assert!(matches!(rx.try_recv(), Ok(Message::GetBlocks(_))));

        // Tip re-announcement is swallowed
        let tip = Message::Inv(vec![Inventory::block(locator[0])]);
        assert!(task.handle_message(&tip, &mut cx).unwrap());
        assert!(!task.is_completed());

        let one = Message::Inv(vec![Inventory::block(BlockHash::from_byte_array([2; 32]))]);
        assert!(task.handle_message(&one, &mut cx).unwrap());
        assert!(!task.is_completed());

        let two = Message::Inv(vec![
            Inventory::block(BlockHash::from_byte_array([2; 32])),
            Inventory::block(BlockHash::from_byte_array([3; 32])),
        ]);
        assert!(task.handle_message(&two, &mut cx).unwrap());
        assert!(task.is_completed());
        assert!(matches!(task.into_outcome(), TaskOutcome::BlockHashes(h) if h.len() == 2));
    }

    #[test]
    fn test_block_hashes_complete_when_idle() {
        let (requester, _rx) = requester();
        let now = Instant::now();
        let mut task = GetBlockHashesTask::new(vec![], 500);
        task.start(&mut TaskContext::new(&requester, now));

        task.check_timeout(now + Duration::from_secs(5)).unwrap();
        assert!(!task.is_completed());
        task.check_timeout(now + Duration::from_secs(11)).unwrap();
        assert!(task.is_completed());
        assert_eq!(task.into_outcome(), TaskOutcome::BlockHashes(vec![]));
    }

    #[test]
    fn test_merkle_blocks_collect_transactions() {
        let (requester, mut rx) = requester();
        let now = Instant::now();
        let tx = create_test_tx(7);
        let with_tx = create_merkle_block(1, &[tx.clone()]);
        let empty = create_merkle_block(2, &[]);

        let mut task = GetMerkleBlocksTask::new(
            vec![entry(&with_tx, 0), entry(&empty, 42)],
            MerkleBlockValidator::default(),
            SpeedThresholds::default(),
        );
        let mut cx = TaskContext::new(&requester, now);
        task.start(&mut cx);
        match rx.try_recv() {
            Ok(Message::GetData(items)) => assert_eq!(items.len(), 2),
            other => panic!("unexpected {:?}", other),
        }

        assert!(task
            .handle_message(&Message::MerkleBlock(with_tx.clone()), &mut cx)
            .unwrap());
        assert!(cx.merkle_blocks.is_empty());

        assert!(task.handle_message(&Message::Tx(tx.clone()), &mut cx).unwrap());
        assert_eq!(cx.merkle_blocks.len(), 1);
        assert_eq!(cx.merkle_blocks[0].transactions, vec![tx]);
        assert_eq!(cx.merkle_blocks[0].height, None);

        assert!(task
            .handle_message(&Message::MerkleBlock(empty), &mut cx)
            .unwrap());
        assert_eq!(cx.merkle_blocks[1].height, Some(42));
        assert!(task.is_completed());
    }

    #[test]
    fn test_merkle_block_with_repeated_leaf_completes() {
        let (requester, _rx) = requester();
        let tx = create_test_tx(8);
        let txids = [tx.compute_txid(), Txid::from_byte_array([9; 32]), tx.compute_txid()];
        let mut header = genesis_block(Network::Regtest).header;
        header.nonce = 3;
        header.merkle_root = calculate_merkle_root_from_txids(&txids);
        let block = bitcoin::MerkleBlock {
            header,
            txn: PartialMerkleTree::from_txids(&txids, &[true, false, true]),
        };

        let mut task = GetMerkleBlocksTask::new(
            vec![entry(&block, 5)],
            MerkleBlockValidator::default(),
            SpeedThresholds::default(),
        );
        let mut cx = TaskContext::new(&requester, Instant::now());
        task.start(&mut cx);
        assert!(task.handle_message(&Message::MerkleBlock(block), &mut cx).unwrap());
        assert!(task.handle_message(&Message::Tx(tx.clone()), &mut cx).unwrap());

        assert!(task.is_completed());
        assert_eq!(cx.merkle_blocks[0].transactions, vec![tx]);
    }

    #[test]
    fn test_merkle_blocks_reject_invalid_proof() {
        let (requester, _rx) = requester();
        let mut block = create_merkle_block(1, &[create_test_tx(1)]);
        block.header.merkle_root = bitcoin::TxMerkleNode::all_zeros();

        let mut task = GetMerkleBlocksTask::new(
            vec![entry(&block, 0)],
            MerkleBlockValidator::default(),
            SpeedThresholds::default(),
        );
        let mut cx = TaskContext::new(&requester, Instant::now());
        task.start(&mut cx);

        let result = task.handle_message(&Message::MerkleBlock(block), &mut cx);
        assert!(matches!(result, Err(PeerError::MerkleValidation(_))));
    }

    #[test]
    fn test_merkle_blocks_too_slow() {
        let (requester, _rx) = requester();
        let now = Instant::now();
        let block = create_merkle_block(1, &[]);
        let mut task = GetMerkleBlocksTask::new(
            vec![entry(&block, 0)],
            MerkleBlockValidator::default(),
            SpeedThresholds::default(),
        );
        task.start(&mut TaskContext::new(&requester, now));

        assert!(task.check_timeout(now + Duration::from_secs(5)).is_ok());
        assert_eq!(
            task.check_timeout(now + Duration::from_secs(11)),
            Err(PeerError::TooSlow)
        );
    }

    #[test]
    fn test_merkle_blocks_idle_timeout() {
        let (requester, _rx) = requester();
        let now = Instant::now();
        let block = create_merkle_block(1, &[]);
        let mut task = GetMerkleBlocksTask::new(
            vec![entry(&block, 0)],
            MerkleBlockValidator::default(),
            SpeedThresholds::default().relaxed(1_000_000.0),
        );
        task.start(&mut TaskContext::new(&requester, now));

        assert_eq!(
            task.check_timeout(now + Duration::from_secs(61)),
            Err(PeerError::Timeout(TimeoutError::Task("get-merkle-blocks")))
        );
    }

    #[test]
    fn test_request_transactions_with_not_found() {
        let (requester, mut rx) = requester();
        let tx1 = create_test_tx(1);
        let tx2 = create_test_tx(2);
        let mut task = RequestTransactionsTask::new(vec![tx1.compute_txid(), tx2.compute_txid()]);
        let mut cx = TaskContext::new(&requester, Instant::now());
        task.start(&mut cx);
        assert!(matches!(rx.try_recv(), Ok(Message::GetData(items)) if items.len() == 2));

        assert!(task.handle_message(&Message::Tx(tx1.clone()), &mut cx).unwrap());
        assert!(!task.is_completed());
        let not_found = Message::NotFound(vec![Inventory::transaction(tx2.compute_txid())]);
        assert!(task.handle_message(&not_found, &mut cx).unwrap());
        assert!(task.is_completed());
        assert_eq!(
            task.into_outcome(),
            TaskOutcome::Transactions {
                requested: vec![tx1.compute_txid(), tx2.compute_txid()],
                received: vec![tx1],
            }
        );
    }

    #[test]
    fn test_send_transaction_serves_getdata() {
        let (requester, mut rx) = requester();
        let tx = create_test_tx(9);
        let mut task = SendTransactionTask::new(tx.clone());
        let mut cx = TaskContext::new(&requester, Instant::now());
        task.start(&mut cx);
        assert!(matches!(rx.try_recv(), Ok(Message::Inv(_))));

        let get_data = Message::GetData(vec![Inventory::transaction(tx.compute_txid())]);
        assert!(task.handle_message(&get_data, &mut cx).unwrap());
        assert!(matches!(rx.try_recv(), Ok(Message::Tx(sent)) if sent == tx));
        assert_eq!(
            task.into_outcome(),
            TaskOutcome::TransactionSent {
                txid: tx.compute_txid(),
                requested: true
            }
        );
    }
}
