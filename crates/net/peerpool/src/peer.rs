//! Per-topic peer record.

use murmur_net_primitives::{Node, NodeId};
use tokio::time::Instant;

/// A peer tracked by a topic pool, either pending or connected.
#[derive(Debug, Clone)]
pub(crate) struct PeerInfo {
    pub(crate) node: Node,
    /// Last time discovery reported this peer.
    pub(crate) discovered_at: Instant,
    /// Set while the pool itself has asked for the peer to be disconnected.
    pub(crate) dismissed: bool,
}

impl PeerInfo {
    pub(crate) fn new(node: Node, discovered_at: Instant) -> Self {
        Self {
            node,
            discovered_at,
            dismissed: false,
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.node.id
    }
}
