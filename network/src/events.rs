//! Ordered delivery of peer group events to every subscriber.

use crate::connection::PeerId;
use crate::error::PeerError;
use crate::message::Inventory;
use crate::peer::PeerInfo;
use crate::task::TaskOutcome;
use spv_core::MerkleBlock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone)]
pub enum PeerGroupEvent {
    /// Handshake completed
    Connected(PeerInfo),
    Disconnected {
        peer: PeerId,
        error: Option<PeerError>,
    },
    /// Task queue drained
    Ready(PeerId),
    /// First task queued
    Busy(PeerId),
    Inventory {
        peer: PeerId,
        items: Vec<Inventory>,
    },
    MerkleBlock {
        peer: PeerId,
        block: Arc<MerkleBlock>,
    },
    TaskCompleted {
        peer: PeerId,
        outcome: TaskOutcome,
    },
}

impl PeerGroupEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            PeerGroupEvent::Connected(info) => info.id,
            PeerGroupEvent::Disconnected { peer, .. }
            | PeerGroupEvent::Ready(peer)
            | PeerGroupEvent::Busy(peer)
            | PeerGroupEvent::Inventory { peer, .. }
            | PeerGroupEvent::MerkleBlock { peer, .. }
            | PeerGroupEvent::TaskCompleted { peer, .. } => *peer,
        }
    }

    pub fn task_outcome(&self) -> Option<&TaskOutcome> {
        match self {
            PeerGroupEvent::TaskCompleted { outcome, .. } => Some(outcome),
            _ => None,
        }
    }
}

/// Collects subscribers, then runs the single dispatch queue.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<mpsc::UnboundedSender<PeerGroupEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PeerGroupEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Spawn the dispatcher; it stops once every publisher is dropped
    pub fn start(self) -> EventPublisher {
        let (tx, mut rx) = mpsc::unbounded_channel::<PeerGroupEvent>();
        let mut subscribers = self.subscribers;

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                subscribers.retain(|s| s.send(event.clone()).is_ok());
            }
            debug!("Event bus stopped");
        });

        EventPublisher { tx }
    }
}

#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<PeerGroupEvent>,
}

impl EventPublisher {
    pub fn publish(&self, event: PeerGroupEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event bus closed, dropping event");
        }
    }
}
