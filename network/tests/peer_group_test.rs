use bitcoin::p2p::message_bloom::BloomFlags;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::{Address, ServiceFlags};
use parking_lot::Mutex;
use spv_network::{
    BloomFilter, ConnectionEvent, ConnectionHandle, Connector, EventBus, MemoryPeerAddressStorage,
    Message, NetworkError, PeerAddress, PeerAddressManager, PeerAddressStorage, PeerGroup,
    PeerGroupEvent, PeerGroupHandle, PeerId, SpvConfig,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone)]
struct RemoteNode {
    height: i32,
    delay: Duration,
    refuse: bool,
}

impl RemoteNode {
    fn new(height: i32, delay_ms: u64) -> Self {
        Self {
            height,
            delay: Duration::from_millis(delay_ms),
            refuse: false,
        }
    }

    fn refusing() -> Self {
        Self {
            height: 0,
            delay: Duration::ZERO,
            refuse: true,
        }
    }
}

/// Simulates remote nodes answering the handshake
#[derive(Default)]
struct MockConnector {
    nodes: HashMap<IpAddr, RemoteNode>,
    dialed: Arc<Mutex<Vec<PeerId>>>,
    received: Arc<Mutex<Vec<(PeerId, Message)>>>,
}

impl Connector for MockConnector {
    fn connect(
        &self,
        peer: PeerId,
        mut outbound: mpsc::UnboundedReceiver<Message>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> ConnectionHandle {
        self.dialed.lock().push(peer);
        let node = self.nodes.get(&peer.ip()).cloned();
        let received = self.received.clone();

        ConnectionHandle::new(tokio::spawn(async move {
            let node = match node {
                Some(node) if !node.refuse => node,
                _ => {
                    let _ = events.send(ConnectionEvent::Closed {
                        peer,
                        error: Some(NetworkError::Connect("refused".to_string())),
                    });
                    return;
                }
            };

            let _ = events.send(ConnectionEvent::Established(peer));
            while let Some(msg) = outbound.recv().await {
                received.lock().push((peer, msg.clone()));
                if let Message::Version(_) = msg {
                    tokio::time::sleep(node.delay).await;
                    for reply in [Message::Version(remote_version(peer, node.height)), Message::Verack] {
                        let _ = events.send(ConnectionEvent::Received {
                            peer,
                            message: Some(reply),
                        });
                    }
                }
            }
        }))
    }
}

fn remote_version(peer: PeerId, height: i32) -> VersionMessage {
    let mut msg = VersionMessage::new(
        ServiceFlags::NETWORK | ServiceFlags::BLOOM,
        0,
        Address::new(&peer, ServiceFlags::NONE),
        Address::new(&peer, ServiceFlags::NONE),
        7,
        "/mock:0.1/".to_string(),
        height,
    );
    msg.version = 70015;
    msg
}

fn ip(last: u8) -> IpAddr {
    IpAddr::from([127, 0, 0, last])
}

fn test_config(peer_count: usize, burst_peer_count: usize) -> SpvConfig {
    SpvConfig {
        network: bitcoin::Network::Regtest,
        dns_seeds: Vec::new(),
        peer_count,
        burst_peer_count,
        acceptable_height_gap: 500,
        ..SpvConfig::default()
    }
}

struct Harness {
    handle: PeerGroupHandle,
    events: mpsc::UnboundedReceiver<PeerGroupEvent>,
    storage: Arc<MemoryPeerAddressStorage>,
    dialed: Arc<Mutex<Vec<PeerId>>>,
    received: Arc<Mutex<Vec<(PeerId, Message)>>>,
    filter: watch::Sender<Option<BloomFilter>>,
}

fn start_group(
    config: SpvConfig,
    nodes: Vec<(IpAddr, RemoteNode)>,
    initial: &[IpAddr],
    filter: Option<BloomFilter>,
) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let storage = Arc::new(MemoryPeerAddressStorage::new());
    storage.add(initial.iter().copied().map(PeerAddress::new).collect());

    let connector = MockConnector {
        nodes: nodes.into_iter().collect(),
        ..MockConnector::default()
    };
    let dialed = connector.dialed.clone();
    let received = connector.received.clone();

    let mut bus = EventBus::new();
    let events = bus.subscribe();
    let publisher = bus.start();
    let (_height_tx, height_rx) = watch::channel(0u32);
    let (filter_tx, filter_rx) = watch::channel(filter);

    let (group, handle) = PeerGroup::new(
        config,
        PeerAddressManager::new(storage.clone(), Vec::new()),
        Arc::new(connector),
        publisher,
        height_rx,
        filter_rx,
    );
    tokio::spawn(group.run());

    Harness {
        handle,
        events,
        storage,
        dialed,
        received,
        filter: filter_tx,
    }
}

async fn next_matching<F>(events: &mut mpsc::UnboundedReceiver<PeerGroupEvent>, f: F) -> PeerGroupEvent
where
    F: Fn(&PeerGroupEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if f(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is_connected(event: &PeerGroupEvent) -> bool {
    matches!(event, PeerGroupEvent::Connected(_))
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met");
}

fn filter_loads(received: &Mutex<Vec<(PeerId, Message)>>) -> usize {
    received
        .lock()
        .iter()
        .filter(|(_, m)| matches!(m, Message::FilterLoad(_)))
        .count()
}

#[tokio::test]
async fn test_fills_pool_to_target() {
    let nodes = (1..=3).map(|i| (ip(i), RemoteNode::new(100, 1))).collect();
    let mut h = start_group(test_config(2, 4), nodes, &[ip(1), ip(2), ip(3)], None);

    next_matching(&mut h.events, is_connected).await;
    next_matching(&mut h.events, is_connected).await;

    assert_eq!(h.dialed.lock().len(), 2);
    h.handle.stop();
}

#[tokio::test]
async fn test_first_peer_far_ahead_raises_burst_target() {
    let nodes = (1..=4).map(|i| (ip(i), RemoteNode::new(1000, 1))).collect();
    let mut h = start_group(test_config(1, 3), nodes, &[ip(1), ip(2), ip(3), ip(4)], None);

    for _ in 0..3 {
        next_matching(&mut h.events, is_connected).await;
    }
    assert_eq!(h.dialed.lock().len(), 3);
    h.handle.stop();
}

#[tokio::test]
async fn test_first_peer_within_gap_keeps_target() {
    let nodes = (1..=2).map(|i| (ip(i), RemoteNode::new(400, 1))).collect();
    let mut h = start_group(test_config(1, 3), nodes, &[ip(1), ip(2)], None);

    let connected = next_matching(&mut h.events, is_connected).await;
    let peer = connected.peer();
    next_matching(&mut h.events, |e| matches!(e, PeerGroupEvent::Ready(p) if *p == peer)).await;

    assert_eq!(h.dialed.lock().len(), 1);
    h.handle.stop();
}

#[tokio::test]
async fn test_failed_address_is_dropped_and_replaced() {
    let nodes = vec![(ip(1), RemoteNode::refusing()), (ip(2), RemoteNode::new(100, 1))];
    let mut h = start_group(test_config(1, 1), nodes, &[ip(1), ip(2)], None);

    let connected = next_matching(&mut h.events, is_connected).await;
    assert_eq!(connected.peer().ip(), ip(2));
    assert!(!h.storage.exists(&ip(1)));
    assert!(h.storage.exists(&ip(2)));
    h.handle.stop();
}

#[tokio::test]
async fn test_filter_sent_on_handshake_and_on_rebuild() {
    let mut filter = BloomFilter::new(1, 0.001, 5, BloomFlags::None);
    filter.insert(b"wallet key");
    let nodes = vec![(ip(1), RemoteNode::new(100, 1))];
    let mut h = start_group(test_config(1, 1), nodes, &[ip(1)], Some(filter));

    next_matching(&mut h.events, is_connected).await;
    let received = h.received.clone();
    wait_for(|| filter_loads(&received) == 1).await;

    let mut rebuilt = BloomFilter::new(2, 0.001, 6, BloomFlags::None);
    rebuilt.insert(b"new key");
    h.filter.send_replace(Some(rebuilt));
    wait_for(|| filter_loads(&received) == 2).await;
    h.handle.stop();
}

#[tokio::test]
async fn test_fresh_candidates_replace_slowest_peer() {
    let nodes = vec![
        (ip(1), RemoteNode::new(100, 1)),
        (ip(2), RemoteNode::new(100, 150)),
        (ip(3), RemoteNode::new(100, 1)),
        (ip(4), RemoteNode::new(100, 1)),
    ];
    let mut h = start_group(test_config(2, 2), nodes, &[ip(1), ip(2)], None);

    next_matching(&mut h.events, is_connected).await;
    next_matching(&mut h.events, is_connected).await;

    h.handle.add_addresses(vec![ip(3), ip(4)]);
    let connected = next_matching(&mut h.events, is_connected).await;
    assert_eq!(connected.peer().ip(), ip(3));

    match next_matching(&mut h.events, |e| matches!(e, PeerGroupEvent::Disconnected { .. })).await {
        PeerGroupEvent::Disconnected { peer, error } => {
            assert_eq!(peer.ip(), ip(2));
            assert!(error.is_none());
        }
        _ => unreachable!(),
    }
    // A clean eviction keeps the address with a higher score
    let evicted = h
        .storage
        .addresses()
        .into_iter()
        .find(|a| a.ip == ip(2))
        .unwrap();
    assert_eq!(evicted.score, 1);
    h.handle.stop();
}

#[tokio::test]
async fn test_stop_disconnects_everyone() {
    let nodes = vec![(ip(1), RemoteNode::new(100, 1))];
    let mut h = start_group(test_config(1, 1), nodes, &[ip(1)], None);

    next_matching(&mut h.events, is_connected).await;
    h.handle.stop();
    let event =
        next_matching(&mut h.events, |e| matches!(e, PeerGroupEvent::Disconnected { .. })).await;
    assert_eq!(event.peer().ip(), ip(1));
}
