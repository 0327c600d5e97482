use crate::config::NO_BLOOM_VERSION;
use crate::connection::{PeerId, Requester};
use crate::error::{HandshakeError, PeerError};
use crate::message::{Inventory, Message};
use crate::task::{PeerTask, TaskContext, TaskOutcome};
use crate::timeout::{ConnectionTimeoutManager, TimeoutAction};
use bitcoin::p2p::message_bloom::FilterLoad;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::{Address, ServiceFlags};
use spv_core::MerkleBlock;
use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Protocol version we speak
pub const PROTOCOL_VERSION: u32 = 70015;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NotConnected,
    Connecting,
    AwaitingVerack,
    Ready,
}

/// Values a peer needs from its owner at creation time
#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub min_protocol_version: u32,
    pub local_best_height: u32,
    pub user_agent: String,
}

/// Snapshot of a connected peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub protocol_version: u32,
    pub announced_height: u32,
    pub connection_latency: Duration,
    pub user_agent: String,
}

/// Notifications drained by the peer's single observer
#[derive(Debug, Clone)]
pub enum PeerNotification {
    Connected,
    Ready,
    Busy,
    Inventory(Vec<Inventory>),
    MerkleBlock(MerkleBlock),
    TaskCompleted(TaskOutcome),
}

#[derive(Debug, Clone)]
struct RemoteVersion {
    protocol_version: u32,
    announced_height: u32,
    user_agent: String,
}

/// One protocol connection: handshake, keepalive and an ordered task queue.
pub struct Peer {
    id: PeerId,
    state: HandshakeState,
    settings: PeerSettings,
    requester: Requester,
    tasks: VecDeque<PeerTask>,
    timeout: ConnectionTimeoutManager,
    remote: Option<RemoteVersion>,
    sent_verack: bool,
    received_verack: bool,
    dial_started: Instant,
    connection_latency: Option<Duration>,
    notifications: Vec<PeerNotification>,
}

impl Peer {
    pub fn new(id: PeerId, settings: PeerSettings, requester: Requester, now: Instant) -> Self {
        Self {
            id,
            state: HandshakeState::Connecting,
            settings,
            requester,
            tasks: VecDeque::new(),
            timeout: ConnectionTimeoutManager::new(now),
            remote: None,
            sent_verack: false,
            received_verack: false,
            dial_started: now,
            connection_latency: None,
            notifications: Vec::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == HandshakeState::Ready
    }

    /// Connected with an empty task queue
    pub fn is_ready(&self) -> bool {
        self.is_connected() && self.tasks.is_empty()
    }

    pub fn announced_height(&self) -> u32 {
        self.remote.as_ref().map(|r| r.announced_height).unwrap_or(0)
    }

    /// Dial to handshake completion; `None` until connected
    pub fn connection_latency(&self) -> Option<Duration> {
        self.connection_latency
    }

    pub fn tasks_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn info(&self) -> Option<PeerInfo> {
        let remote = self.remote.as_ref()?;
        Some(PeerInfo {
            id: self.id,
            protocol_version: remote.protocol_version,
            announced_height: remote.announced_height,
            connection_latency: self.connection_latency?,
            user_agent: remote.user_agent.clone(),
        })
    }

    pub fn take_notifications(&mut self) -> Vec<PeerNotification> {
        std::mem::take(&mut self.notifications)
    }

    /// Socket is up: start the handshake
    pub fn connection_established(&mut self, now: Instant) {
        self.state = HandshakeState::AwaitingVerack;
        self.timeout.reset(now);
        self.requester.send(Message::Version(self.version_message()));
    }

    /// Socket closed or disconnect requested
    pub fn close(&mut self) {
        self.state = HandshakeState::NotConnected;
        self.tasks.clear();
    }

    fn version_message(&self) -> VersionMessage {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let unspecified = std::net::SocketAddr::from(([0, 0, 0, 0], 0));

        let mut version = VersionMessage::new(
            ServiceFlags::NONE,
            timestamp,
            Address::new(&self.id, ServiceFlags::NONE),
            Address::new(&unspecified, ServiceFlags::NONE),
            rand::random(),
            self.settings.user_agent.clone(),
            self.settings.local_best_height as i32,
        );
        version.version = PROTOCOL_VERSION;
        // No transaction relay until our filter is loaded
        version.relay = false;
        version
    }

    fn validate_version(&self, version: &VersionMessage) -> Result<(), HandshakeError> {
        if version.version < self.settings.min_protocol_version {
            return Err(HandshakeError::ProtocolTooOld {
                version: version.version,
                required: self.settings.min_protocol_version,
            });
        }

        if version.start_height <= 0 {
            return Err(HandshakeError::InvalidHeight(version.start_height));
        }

        let announced = version.start_height as u32;
        if announced < self.settings.local_best_height {
            return Err(HandshakeError::StalePeerChain {
                announced,
                local: self.settings.local_best_height,
            });
        }

        if !version.services.has(ServiceFlags::NETWORK) {
            return Err(HandshakeError::NotFullNode);
        }

        if version.version >= NO_BLOOM_VERSION && !version.services.has(ServiceFlags::BLOOM) {
            return Err(HandshakeError::NoBloomFilterSupport);
        }

        Ok(())
    }

    pub fn handle_message(&mut self, msg: Option<Message>, now: Instant) -> Result<(), PeerError> {
        self.timeout.reset(now);
        let Some(msg) = msg else {
            return Ok(());
        };

        match msg {
            Message::Version(_) if self.remote.is_some() => {
                debug!("Ignoring repeated version from {}", self.id);
            }
            Message::Version(version) => {
                self.validate_version(&version)?;
                debug!(
                    "Peer {} version {} height {} agent {}",
                    self.id, version.version, version.start_height, version.user_agent
                );
                self.remote = Some(RemoteVersion {
                    protocol_version: version.version,
                    announced_height: version.start_height as u32,
                    user_agent: version.user_agent,
                });
                self.requester.send(Message::Verack);
                self.sent_verack = true;
                self.maybe_complete_handshake(now);
            }
            Message::Verack => {
                self.received_verack = true;
                self.maybe_complete_handshake(now);
            }
            Message::Ping(nonce) => self.requester.send(Message::Pong(nonce)),
            Message::Pong(_) => {}
            msg => {
                if !self.is_connected() {
                    debug!("Ignoring {} from {} before handshake", msg.command(), self.id);
                    return Ok(());
                }
                if !self.dispatch_to_tasks(&msg, now)? {
                    if let Message::Inv(items) = msg {
                        self.notifications.push(PeerNotification::Inventory(items));
                    }
                }
            }
        }
        Ok(())
    }

    fn maybe_complete_handshake(&mut self, now: Instant) {
        if self.is_connected() || !self.sent_verack || !self.received_verack {
            return;
        }

        self.state = HandshakeState::Ready;
        let latency = now.saturating_duration_since(self.dial_started);
        self.connection_latency = Some(latency);
        info!(
            "Handshake with {} complete in {:?}, height {}",
            self.id,
            latency,
            self.announced_height()
        );

        self.notifications.push(PeerNotification::Connected);
        if self.tasks.is_empty() {
            self.notifications.push(PeerNotification::Ready);
        }
    }

    fn dispatch_to_tasks(&mut self, msg: &Message, now: Instant) -> Result<bool, PeerError> {
        let mut cx = TaskContext::new(&self.requester, now);
        let mut consumed_by = None;
        for (index, task) in self.tasks.iter_mut().enumerate() {
            if task.handle_message(msg, &mut cx)? {
                consumed_by = Some(index);
                break;
            }
        }

        let merkle_blocks = std::mem::take(&mut cx.merkle_blocks);
        self.notifications
            .extend(merkle_blocks.into_iter().map(PeerNotification::MerkleBlock));

        match consumed_by {
            Some(index) => {
                if self.tasks[index].is_completed() {
                    self.complete_task(index, now);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Queue a task and start it right away
    pub fn add_task(&mut self, mut task: PeerTask, now: Instant) {
        if !self.is_connected() {
            warn!("Dropping {} task for {}: not connected", task.name(), self.id);
            return;
        }

        let mut cx = TaskContext::new(&self.requester, now);
        task.start(&mut cx);
        self.tasks.push_back(task);
        if self.tasks.len() == 1 {
            self.notifications.push(PeerNotification::Busy);
        }

        // Tasks with nothing to do finish immediately
        if let Some(index) = self.tasks.iter().position(|t| t.is_completed()) {
            self.complete_task(index, now);
        }
    }

    fn complete_task(&mut self, index: usize, now: Instant) {
        let Some(task) = self.tasks.remove(index) else {
            return;
        };
        debug!("Peer {} completed {}", self.id, task.name());
        self.notifications
            .push(PeerNotification::TaskCompleted(task.into_outcome()));

        match self.tasks.front_mut() {
            Some(head) if index == 0 => head.reset_timer(now),
            Some(_) => {}
            None => self.notifications.push(PeerNotification::Ready),
        }
    }

    /// Keepalive and head-task timeout check
    pub fn tick(&mut self, now: Instant) -> Result<(), PeerError> {
        if let TimeoutAction::SendPing(nonce) = self.timeout.tick(now)? {
            debug!("Pinging idle peer {}", self.id);
            self.requester.send(Message::Ping(nonce));
        }

        if let Some(head) = self.tasks.front_mut() {
            head.check_timeout(now)?;
            if head.is_completed() {
                self.complete_task(0, now);
            }
        }
        Ok(())
    }

    pub fn send_filter_load(&self, filter: FilterLoad) {
        if self.is_connected() {
            self.requester.send(Message::FilterLoad(filter));
        }
    }

    pub fn send_mempool(&self) {
        if self.is_connected() {
            self.requester.send(Message::MemPool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::GetBlockHashesTask;
    use bitcoin::hashes::Hash;
    use bitcoin::BlockHash;
    use tokio::sync::mpsc;

    fn test_peer(id: u8) -> PeerId {
        format!("127.0.0.{}:8333", id).parse().unwrap()
    }

    fn settings(local_best_height: u32) -> PeerSettings {
        PeerSettings {
            min_protocol_version: 70011,
            local_best_height,
            user_agent: "/test/".to_string(),
        }
    }

    fn create_peer(local_best_height: u32) -> (Peer, mpsc::UnboundedReceiver<Message>, Instant) {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let id = test_peer(1);
        let peer = Peer::new(id, settings(local_best_height), Requester::new(id, tx), now);
        (peer, rx, now)
    }

    fn remote_version(version: u32, height: i32, services: ServiceFlags) -> VersionMessage {
        let addr = test_peer(1);
        let mut msg = VersionMessage::new(
            services,
            0,
            Address::new(&addr, ServiceFlags::NONE),
            Address::new(&addr, ServiceFlags::NONE),
            1,
            "/remote/".to_string(),
            height,
        );
        msg.version = version;
        msg
    }

    fn full_services() -> ServiceFlags {
        ServiceFlags::NETWORK | ServiceFlags::BLOOM
    }

    fn handshake(peer: &mut Peer, rx: &mut mpsc::UnboundedReceiver<Message>, now: Instant) {
        peer.connection_established(now);
        assert!(matches!(rx.try_recv(), Ok(Message::Version(_))));
        peer.handle_message(
            Some(Message::Version(remote_version(70015, 1000, full_services()))),
            now,
        )
        .unwrap();
        peer.handle_message(Some(Message::Verack), now + Duration::from_millis(300))
            .unwrap();
        assert!(matches!(rx.try_recv(), Ok(Message::Verack)));
    }

    #[test]
    fn test_handshake_completes_in_either_order() {
        let (mut peer, mut rx, now) = create_peer(10);
        peer.connection_established(now);
        peer.handle_message(Some(Message::Verack), now).unwrap();
        assert!(!peer.is_connected());

        peer.handle_message(
            Some(Message::Version(remote_version(70015, 1000, full_services()))),
            now + Duration::from_millis(250),
        )
        .unwrap();

        assert!(peer.is_connected());
        assert!(peer.is_ready());
        assert_eq!(peer.connection_latency(), Some(Duration::from_millis(250)));
        assert_eq!(peer.announced_height(), 1000);
        let notifications = peer.take_notifications();
        assert!(matches!(notifications[0], PeerNotification::Connected));
        assert!(matches!(notifications[1], PeerNotification::Ready));
        assert!(matches!(rx.try_recv(), Ok(Message::Version(_))));
        assert!(matches!(rx.try_recv(), Ok(Message::Verack)));
    }

    #[test]
    fn test_repeated_version_after_handshake_is_ignored() {
        let (mut peer, mut rx, now) = create_peer(10);
        handshake(&mut peer, &mut rx, now);
        peer.take_notifications();

        // A second version announcing a stale height must not be re-checked
        peer.handle_message(
            Some(Message::Version(remote_version(70015, 5, full_services()))),
            now + Duration::from_secs(1),
        )
        .unwrap();

        assert!(peer.is_connected());
        assert_eq!(peer.announced_height(), 1000);
        assert!(rx.try_recv().is_err());
        assert!(peer.take_notifications().is_empty());
    }

    #[test]
    fn test_handshake_rejections() {
        let cases = [
            (
                remote_version(70001, 1000, full_services()),
                HandshakeError::ProtocolTooOld {
                    version: 70001,
                    required: 70011,
                },
            ),
            (
                remote_version(70015, 0, full_services()),
                HandshakeError::InvalidHeight(0),
            ),
            (
                remote_version(70015, 5, full_services()),
                HandshakeError::StalePeerChain {
                    announced: 5,
                    local: 10,
                },
            ),
            (
                remote_version(70015, 1000, ServiceFlags::BLOOM),
                HandshakeError::NotFullNode,
            ),
            (
                remote_version(70015, 1000, ServiceFlags::NETWORK),
                HandshakeError::NoBloomFilterSupport,
            ),
        ];

        for (version, expected) in cases {
            let (mut peer, _rx, now) = create_peer(10);
            peer.connection_established(now);
            let result = peer.handle_message(Some(Message::Version(version)), now);
            assert_eq!(result, Err(PeerError::Handshake(expected)));
            assert!(!peer.is_connected());
        }
    }

    #[test]
    fn test_task_queue_busy_then_ready() {
        let (mut peer, mut rx, now) = create_peer(10);
        handshake(&mut peer, &mut rx, now);
        peer.take_notifications();

        let locator = vec![BlockHash::all_zeros()];
        peer.add_task(GetBlockHashesTask::new(locator.clone(), 1), now);
        peer.add_task(GetBlockHashesTask::new(locator, 1), now);
        assert_eq!(peer.tasks_count(), 2);
        let notifications = peer.take_notifications();
        assert_eq!(notifications.len(), 1);
        assert!(matches!(notifications[0], PeerNotification::Busy));

        let inv = Message::Inv(vec![Inventory::block(BlockHash::from_byte_array([1; 32]))]);
        peer.handle_message(Some(inv.clone()), now).unwrap();
        assert_eq!(peer.tasks_count(), 1);
        peer.handle_message(Some(inv), now).unwrap();
        assert!(peer.is_ready());

        let notifications = peer.take_notifications();
        assert!(matches!(notifications[0], PeerNotification::TaskCompleted(_)));
        assert!(matches!(notifications[1], PeerNotification::TaskCompleted(_)));
        assert!(matches!(notifications[2], PeerNotification::Ready));
    }

    #[test]
    fn test_unconsumed_inventory_is_reported() {
        let (mut peer, mut rx, now) = create_peer(10);
        handshake(&mut peer, &mut rx, now);
        peer.take_notifications();

        let items = vec![Inventory::block(BlockHash::from_byte_array([1; 32]))];
        peer.handle_message(Some(Message::Inv(items.clone())), now)
            .unwrap();

        match peer.take_notifications().as_slice() {
            [PeerNotification::Inventory(reported)] => assert_eq!(reported, &items),
            other => panic!("unexpected notifications {:?}", other),
        }
    }

    #[test]
    fn test_answers_ping_and_times_out() {
        let (mut peer, mut rx, now) = create_peer(10);
        handshake(&mut peer, &mut rx, now);

        peer.handle_message(Some(Message::Ping(42)), now).unwrap();
        assert!(matches!(rx.try_recv(), Ok(Message::Pong(42))));

        peer.tick(now + Duration::from_secs(61)).unwrap();
        assert!(matches!(rx.try_recv(), Ok(Message::Ping(_))));
        assert!(peer.tick(now + Duration::from_secs(67)).is_err());
    }

    #[test]
    fn test_head_task_timeout_completes_task() {
        let (mut peer, mut rx, now) = create_peer(10);
        handshake(&mut peer, &mut rx, now);
        peer.take_notifications();

        peer.add_task(GetBlockHashesTask::new(vec![], 500), now);
        peer.handle_message(None, now + Duration::from_secs(9)).unwrap();
        peer.tick(now + Duration::from_secs(11)).unwrap();

        assert!(peer.is_ready());
        let notifications = peer.take_notifications();
        assert!(matches!(
            notifications.last(),
            Some(PeerNotification::Ready)
        ));
    }
}
