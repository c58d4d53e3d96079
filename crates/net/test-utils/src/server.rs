//! Connection manager double driven by the test.

use std::collections::HashMap;

use murmur_net_primitives::{ConnectedPeerInfo, ConnectionManager, Node, NodeId, ServerPeerEvent};
use parking_lot::Mutex;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Records add/remove requests; connection events are published explicitly
/// with [`emit_added`](Self::emit_added) and [`emit_dropped`](Self::emit_dropped).
#[derive(Debug)]
pub struct MockConnectionManager {
    local_id: NodeId,
    events: broadcast::Sender<ServerPeerEvent>,
    added: Mutex<Vec<Node>>,
    removed: Mutex<Vec<Node>>,
    connected: Mutex<HashMap<NodeId, bool>>,
}

impl MockConnectionManager {
    pub fn new(local_id: NodeId) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            local_id,
            events,
            added: Mutex::default(),
            removed: Mutex::default(),
            connected: Mutex::default(),
        }
    }

    /// Nodes passed to `add_peer`, in call order.
    pub fn added(&self) -> Vec<Node> {
        self.added.lock().clone()
    }

    /// Nodes passed to `remove_peer`, in call order.
    pub fn removed(&self) -> Vec<Node> {
        self.removed.lock().clone()
    }

    pub fn was_added(&self, id: &NodeId) -> bool {
        self.added.lock().iter().any(|node| node.id == *id)
    }

    pub fn was_removed(&self, id: &NodeId) -> bool {
        self.removed.lock().iter().any(|node| node.id == *id)
    }

    /// Publish an outbound connection for `id`.
    pub fn emit_added(&self, id: NodeId) {
        self.connected.lock().insert(id, false);
        let _ = self.events.send(ServerPeerEvent::Added(id));
    }

    /// Publish a disconnect for `id`.
    pub fn emit_dropped(&self, id: NodeId) {
        self.connected.lock().remove(&id);
        let _ = self.events.send(ServerPeerEvent::Dropped(id));
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

impl ConnectionManager for MockConnectionManager {
    fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn add_peer(&self, node: &Node) {
        self.added.lock().push(node.clone());
    }

    fn remove_peer(&self, node: &Node) {
        self.removed.lock().push(node.clone());
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerPeerEvent> {
        self.events.subscribe()
    }

    fn peers_info(&self) -> Vec<ConnectedPeerInfo> {
        let mut peers: Vec<_> = self
            .connected
            .lock()
            .iter()
            .map(|(id, inbound)| ConnectedPeerInfo {
                id: *id,
                name: format!("mock/{}", id.short()),
                remote_addr: String::new(),
                inbound: *inbound,
            })
            .collect();
        peers.sort_by_key(|info| info.id);
        peers
    }
}
