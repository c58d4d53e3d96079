//! Pool notifications and non-blocking broadcast emitter.

use murmur_net_primitives::{ConnectedPeerInfo, Node, Topic};
use tokio::sync::broadcast;
use tracing::trace;

/// Notifications published by the peer pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    DiscoveryStarted,
    DiscoveryStopped,
    /// Connected peers after a connection event was handled.
    DiscoverySummary(Vec<ConnectedPeerInfo>),
    /// A peer for a cache-only topic connected and was cached.
    PeerDiscovered { topic: Topic, node: Node },
}

impl PoolEvent {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DiscoveryStarted => "discovery.started",
            Self::DiscoveryStopped => "discovery.stopped",
            Self::DiscoverySummary(_) => "discovery.summary",
            Self::PeerDiscovered { .. } => "peer.discovered",
        }
    }
}

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Non-blocking broadcast emitter. Slow subscribers drop events independently.
#[derive(Debug, Clone)]
pub struct PoolEventEmitter {
    tx: broadcast::Sender<PoolEvent>,
}

impl Default for PoolEventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl PoolEventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: PoolEvent) {
        trace!(kind = event.kind(), "pool event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn discovery_started(&self) {
        self.emit(PoolEvent::DiscoveryStarted);
    }

    pub fn discovery_stopped(&self) {
        self.emit(PoolEvent::DiscoveryStopped);
    }

    pub fn discovery_summary(&self, peers: Vec<ConnectedPeerInfo>) {
        self.emit(PoolEvent::DiscoverySummary(peers));
    }

    pub fn peer_discovered(&self, topic: Topic, node: Node) {
        self.emit(PoolEvent::PeerDiscovered { topic, node });
    }
}
